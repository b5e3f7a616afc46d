// 速度统计
//
// 定时读取上一周期内累计的字节数，换算成 bytes/s 放入固定长度的历史窗口，
// 对外报告窗口内的平均值。

use crate::config::SpeedConfig;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct SpeedState {
    /// 上一次采样之后累计的字节数
    flow: AtomicU64,
    samples: Mutex<VecDeque<u64>>,
    history_size: usize,
}

impl SpeedState {
    fn sample(&self, elapsed: Duration) {
        let bytes = self.flow.swap(0, Ordering::AcqRel);
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return;
        }

        let mut samples = self.samples.lock();
        samples.push_back((bytes as f64 / secs) as u64);
        while samples.len() > self.history_size {
            samples.pop_front();
        }
    }

    fn reset(&self) {
        self.flow.store(0, Ordering::Release);
        self.samples.lock().clear();
    }
}

/// 速度计数器
///
/// 分片执行器通过 [`record`](Self::record) 上报增量字节数，
/// 计时器每个周期采样一次。
#[derive(Debug)]
pub struct SpeedCounter {
    state: Arc<SpeedState>,
    interval: Duration,
    ticker: Mutex<Option<CancellationToken>>,
}

impl SpeedCounter {
    pub fn new(config: &SpeedConfig) -> Self {
        Self {
            state: Arc::new(SpeedState {
                flow: AtomicU64::new(0),
                samples: Mutex::new(VecDeque::with_capacity(config.history_size)),
                history_size: config.history_size.max(1),
            }),
            interval: config.interval(),
            ticker: Mutex::new(None),
        }
    }

    /// 上报新传输的字节数
    pub fn record(&self, bytes: u64) {
        self.state.flow.fetch_add(bytes, Ordering::AcqRel);
    }

    /// 启动采样，历史记录清零
    pub fn start(&self) {
        self.stop();
        self.state.reset();

        let token = CancellationToken::new();
        let state = self.state.clone();
        let period = self.interval;
        let cancel = token.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // 第一次 tick 立即返回
            interval.tick().await;
            let mut last = Instant::now();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let now = Instant::now();
                        state.sample(now.duration_since(last));
                        last = now;
                    }
                }
            }
        });

        *self.ticker.lock() = Some(token);
    }

    /// 停止采样
    pub fn stop(&self) {
        if let Some(token) = self.ticker.lock().take() {
            token.cancel();
        }
    }

    /// 平均速度 (bytes/s)
    pub fn speed(&self) -> u64 {
        let samples = self.state.samples.lock();
        if samples.is_empty() {
            return 0;
        }
        samples.iter().sum::<u64>() / samples.len() as u64
    }

    /// 按当前速度估算剩余秒数，速度为 0 时无法估算
    pub fn eta(&self, remaining: u64) -> Option<u64> {
        if remaining == 0 {
            return Some(0);
        }
        match self.speed() {
            0 => None,
            speed => Some(remaining.div_ceil(speed)),
        }
    }

    /// 清空历史记录
    pub fn reset(&self) {
        self.state.reset();
    }

    #[cfg(test)]
    fn sample(&self, elapsed: Duration) {
        self.state.sample(elapsed);
    }
}

impl Drop for SpeedCounter {
    fn drop(&mut self) {
        self.stop();
    }
}
