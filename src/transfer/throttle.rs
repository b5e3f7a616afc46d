//! 进度事件节流器
//!
//! 单个任务每次分片完成都会产生进度，分片很小时事件会非常密集。
//! 节流器保证两次进度事件至少间隔 `interval`，终态事件不经过节流。

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 进度事件节流器
#[derive(Debug)]
pub struct ProgressThrottler {
    /// 时间基准
    origin: Instant,
    /// 上次发布距基准的纳秒数，0 表示从未发布
    last_emit_nanos: AtomicU64,
    /// 节流间隔（纳秒）
    interval_nanos: u64,
}

impl ProgressThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            origin: Instant::now(),
            last_emit_nanos: AtomicU64::new(0),
            interval_nanos: interval.as_nanos() as u64,
        }
    }

    pub fn with_millis(interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(interval_ms))
    }

    /// 距离上次发布已超过节流间隔时返回 true 并记录本次发布
    pub fn should_emit(&self) -> bool {
        let now = self.now_nanos();
        let last = self.last_emit_nanos.load(Ordering::Relaxed);

        if last != 0 && now.saturating_sub(last) < self.interval_nanos {
            return false;
        }

        self.last_emit_nanos
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// 强制发布，同时刷新时间戳
    pub fn force_emit(&self) {
        self.last_emit_nanos.store(self.now_nanos(), Ordering::Relaxed);
    }

    /// 距基准的纳秒数，最小为 1 以区分“从未发布”
    fn now_nanos(&self) -> u64 {
        (self.origin.elapsed().as_nanos() as u64).max(1)
    }
}
