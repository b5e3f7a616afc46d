// 跨任务调度器
//
// 先进先出等待队列，并发上限可在运行时调整

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info};

/// 调度的作业
pub type Job = BoxFuture<'static, ()>;

/// 作业 ID，由 push 分配
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(u64);

struct SchedulerState {
    /// 等待队列（FIFO）
    queue: VecDeque<(JobId, Job)>,
    running: usize,
    concurrency: usize,
}

struct SchedulerInner {
    state: Mutex<SchedulerState>,
    next_id: AtomicU64,
    /// 队列清空且没有运行中的作业时通知
    idle: Notify,
}

/// 跨任务调度器
///
/// 先进先出，最多同时运行 `concurrency` 个作业：
/// 1. 提高并发数立即调度等待中的作业
/// 2. 降低并发数不会打断已在运行的作业
/// 3. 作业只能在开始运行之前移除
///
/// 调度器不关心作业的结果，作业自己负责结算。
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
}

/// 运行计数守卫：作业结束（包括被丢弃）时释放名额并调度下一个
struct RunningGuard {
    inner: Arc<SchedulerInner>,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        let idle = {
            let mut state = self.inner.state.lock();
            state.running -= 1;
            state.running == 0 && state.queue.is_empty()
        };
        if idle {
            self.inner.idle.notify_waiters();
        }
        dispatch(&self.inner);
    }
}

/// 在并发上限内启动等待中的作业
fn dispatch(inner: &Arc<SchedulerInner>) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        return;
    };

    loop {
        // 名额在锁内占用，避免并发调度超过上限
        let next = {
            let mut state = inner.state.lock();
            if state.running >= state.concurrency {
                None
            } else {
                let job = state.queue.pop_front();
                if job.is_some() {
                    state.running += 1;
                }
                job
            }
        };

        let Some((id, job)) = next else {
            break;
        };

        debug!("调度作业 {:?}", id);
        let guard = RunningGuard {
            inner: inner.clone(),
        };
        handle.spawn(async move {
            let _guard = guard;
            job.await;
        });
    }
}

impl TaskScheduler {
    pub fn new(concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        info!("创建任务调度器: 最大并发任务数={}", concurrency);

        Self {
            inner: Arc::new(SchedulerInner {
                state: Mutex::new(SchedulerState {
                    queue: VecDeque::new(),
                    running: 0,
                    concurrency,
                }),
                next_id: AtomicU64::new(1),
                idle: Notify::new(),
            }),
        }
    }

    /// 加入队尾，有空闲名额时立即开始
    pub fn push(&self, job: Job) -> JobId {
        let id = JobId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.state.lock().queue.push_back((id, job));
        dispatch(&self.inner);
        id
    }

    /// 移除尚未开始的作业，作业已开始或不存在时返回 false
    pub fn remove(&self, id: JobId) -> bool {
        let (removed, idle) = {
            let mut state = self.inner.state.lock();
            let removed = match state.queue.iter().position(|(queued, _)| *queued == id) {
                Some(index) => state.queue.remove(index).is_some(),
                None => false,
            };
            (removed, state.running == 0 && state.queue.is_empty())
        };

        if removed {
            debug!("已从等待队列移除作业 {:?}", id);
            if idle {
                self.inner.idle.notify_waiters();
            }
        }
        removed
    }

    /// 调整最大并发数（最小为 1）
    pub fn set_concurrency(&self, concurrency: usize) {
        let concurrency = concurrency.max(1);
        let old = std::mem::replace(&mut self.inner.state.lock().concurrency, concurrency);
        info!("调整最大并发任务数: {} -> {}", old, concurrency);
        dispatch(&self.inner);
    }

    pub fn concurrency(&self) -> usize {
        self.inner.state.lock().concurrency
    }

    pub fn running_count(&self) -> usize {
        self.inner.state.lock().running
    }

    pub fn queued_count(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// 等待所有作业结束
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            {
                let state = self.inner.state.lock();
                if state.running == 0 && state.queue.is_empty() {
                    return;
                }
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_concurrency_bound() {
        let scheduler = TaskScheduler::new(2);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..6 {
            let current = current.clone();
            let peak = peak.clone();
            scheduler.push(Box::pin(async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                current.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        assert!(scheduler.running_count() <= 2);
        scheduler.wait_idle().await;
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.running_count(), 0);
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let scheduler = TaskScheduler::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let order = order.clone();
            scheduler.push(Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(2)).await;
                order.lock().push(i);
            }));
        }

        scheduler.wait_idle().await;
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_remove_before_dispatch() {
        let scheduler = TaskScheduler::new(1);
        let (release, gate) = oneshot::channel::<()>();
        let ran = Arc::new(AtomicUsize::new(0));

        scheduler.push(Box::pin(async move {
            let _ = gate.await;
        }));
        let ran_clone = ran.clone();
        let second = scheduler.push(Box::pin(async move {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(scheduler.queued_count(), 1);
        assert!(scheduler.remove(second));
        assert!(!scheduler.remove(second));

        release.send(()).unwrap();
        scheduler.wait_idle().await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_raising_concurrency_dispatches_immediately() {
        let scheduler = TaskScheduler::new(1);
        let (release, gate) = oneshot::channel::<()>();
        let (started_tx, started_rx) = oneshot::channel::<()>();

        scheduler.push(Box::pin(async move {
            let _ = gate.await;
        }));
        scheduler.push(Box::pin(async move {
            let _ = started_tx.send(());
        }));
        assert_eq!(scheduler.queued_count(), 1);

        scheduler.set_concurrency(2);
        tokio::time::timeout(Duration::from_secs(1), started_rx)
            .await
            .expect("第二个作业应立即开始")
            .unwrap();

        // 降低并发数不会打断运行中的作业
        scheduler.set_concurrency(1);
        assert_eq!(scheduler.concurrency(), 1);

        release.send(()).unwrap();
        scheduler.wait_idle().await;
    }
}
