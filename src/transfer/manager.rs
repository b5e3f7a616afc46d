// 传输管理器
//
// 对外的统一入口：登记任务、调度、暂停/恢复/删除。
// 管理器持有 任务→作业、任务→取消令牌、任务→本地资源 三张表，
// 任务状态只通过事件写入台账。

use super::error::classify_error;
use super::events::{EventPublisher, TransferEvent};
use super::fingerprint::SourceFingerprint;
use super::orchestrator::{
    part_path, FileTransfer, TransferContext, TransferOutcome, TransferParams,
};
use super::task::{Direction, TaskStatus, TransferTask};
use crate::config::AppConfig;
use crate::ledger::TransferLedger;
use crate::range::{full_range, loaded_size, RangeSet};
use crate::remote::RemoteEndpoint;
use crate::scheduler::{JobId, TaskScheduler};
use anyhow::{anyhow, bail, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 跨进程续传需要持久化的最小记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeState {
    pub task_id: String,
    pub direction: Direction,
    pub remote_uri: String,
    pub local_path: PathBuf,
    pub total_size: u64,
    pub missing_ranges: RangeSet,
    /// 上传源文件指纹
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_fingerprint: Option<SourceFingerprint>,
}

/// 任务句柄
#[derive(Debug)]
pub struct TransferHandle {
    task_id: String,
    rx: oneshot::Receiver<TransferOutcome>,
}

impl TransferHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// 等待本次运行结束
    ///
    /// 任务被暂停或删除时返回 Aborted；之后的 resume 会返回新的句柄
    pub async fn finished(self) -> TransferOutcome {
        self.rx
            .await
            .unwrap_or(TransferOutcome::Aborted {
                missing_ranges: None,
            })
    }
}

/// 任务占用的本地资源
#[derive(Debug, Clone)]
struct LocalResource {
    path: PathBuf,
    fingerprint: Option<SourceFingerprint>,
}

#[derive(Debug, Clone)]
struct JobEntry {
    job_id: JobId,
    /// 作业结算后变为 true
    settled: watch::Receiver<bool>,
}

#[derive(Default)]
struct ManagerShared {
    jobs: Mutex<HashMap<String, JobEntry>>,
    cancel_tokens: DashMap<String, CancellationToken>,
    resources: DashMap<String, LocalResource>,
    waiters: DashMap<String, oneshot::Sender<TransferOutcome>>,
}

impl ManagerShared {
    /// 作业结束后的结算
    fn settle(&self, publisher: &EventPublisher, task_id: &str, outcome: TransferOutcome) {
        if let TransferOutcome::Aborted { missing_ranges } = &outcome {
            // 已删除的任务不再记录暂停
            if publisher.ledger().contains(task_id) {
                publisher.publish(TransferEvent::Paused {
                    task_id: task_id.to_string(),
                    missing_ranges: missing_ranges.clone(),
                });
            }
        }

        self.jobs.lock().remove(task_id);
        self.cancel_tokens.remove(task_id);
        self.notify(task_id, outcome);
    }

    /// 从等待队列摘除后的结算
    fn settle_dequeued(&self, task_id: &str) {
        self.jobs.lock().remove(task_id);
        self.cancel_tokens.remove(task_id);
    }

    fn notify(&self, task_id: &str, outcome: TransferOutcome) {
        if let Some((_, tx)) = self.waiters.remove(task_id) {
            let _ = tx.send(outcome);
        }
    }

    fn job(&self, task_id: &str) -> Option<JobEntry> {
        self.jobs.lock().get(task_id).cloned()
    }

    fn cancel(&self, task_id: &str) {
        if let Some(token) = self.cancel_tokens.get(task_id) {
            token.cancel();
        }
    }
}

/// 等待作业结算（发送端已丢弃也视为结算）
async fn wait_settled(entry: JobEntry) {
    let mut settled = entry.settled;
    let _ = settled.wait_for(|done| *done).await;
}

/// 传输管理器
pub struct TransferManager {
    ctx: TransferContext,
    scheduler: TaskScheduler,
    ledger: Arc<TransferLedger>,
    shared: Arc<ManagerShared>,
    /// 根令牌，每个任务使用它的子令牌
    shutdown: CancellationToken,
}

impl TransferManager {
    pub fn new(remote: Arc<dyn RemoteEndpoint>, config: &AppConfig) -> Self {
        let ledger = Arc::new(TransferLedger::new());
        let publisher = EventPublisher::new(ledger.clone());

        info!(
            "创建传输管理器: 分片大小={}, 单文件并发={}, 最大同时任务数={}",
            config.transfer.slice_size,
            config.transfer.slice_concurrency,
            config.transfer.max_concurrent_tasks
        );

        Self {
            ctx: TransferContext {
                remote,
                transfer: config.transfer.clone(),
                speed: config.speed.clone(),
                publisher,
            },
            scheduler: TaskScheduler::new(config.transfer.max_concurrent_tasks),
            ledger,
            shared: Arc::new(ManagerShared::default()),
            shutdown: CancellationToken::new(),
        }
    }

    fn publisher(&self) -> &EventPublisher {
        &self.ctx.publisher
    }

    /// 上传本地文件
    ///
    /// 远端地址非法或源文件不可读时直接返回错误，不登记任务
    pub async fn upload(
        &self,
        local_path: impl AsRef<Path>,
        remote_uri: &str,
    ) -> Result<TransferHandle> {
        self.ctx.remote.validate_uri(remote_uri)?;

        let local_path = local_path.as_ref().to_path_buf();
        let fingerprint = SourceFingerprint::compute(&local_path)
            .await
            .map_err(|e| anyhow::Error::new(classify_error(&e)))?;

        let task = TransferTask::new(
            Direction::Upload,
            remote_uri.to_string(),
            local_path,
            Some(fingerprint.size),
        );
        info!(
            "创建上传任务: id={}, 本地={:?}, 远端={}, 大小={} bytes",
            task.id, task.local_path, task.remote_uri, fingerprint.size
        );

        Ok(self.register(task, Some(fingerprint)))
    }

    /// 下载远端文件，`known_size` 为已知的文件大小
    pub async fn download(
        &self,
        remote_uri: &str,
        dest: impl AsRef<Path>,
        known_size: Option<u64>,
    ) -> Result<TransferHandle> {
        self.ctx.remote.validate_uri(remote_uri)?;

        let task = TransferTask::new(
            Direction::Download,
            remote_uri.to_string(),
            dest.as_ref().to_path_buf(),
            known_size,
        );
        info!(
            "创建下载任务: id={}, 远端={}, 本地={:?}",
            task.id, task.remote_uri, task.local_path
        );

        Ok(self.register(task, None))
    }

    fn register(&self, task: TransferTask, fingerprint: Option<SourceFingerprint>) -> TransferHandle {
        let params = TransferParams {
            task_id: task.id.clone(),
            direction: task.direction,
            remote_uri: task.remote_uri.clone(),
            local_path: task.local_path.clone(),
            total_size: task.total_size,
            missing_ranges: None,
            fingerprint: fingerprint.clone(),
            retries: 0,
        };

        self.shared.resources.insert(
            task.id.clone(),
            LocalResource {
                path: task.local_path.clone(),
                fingerprint,
            },
        );
        self.publisher().publish(TransferEvent::Created {
            task: Box::new(task),
        });

        self.start(params)
    }

    /// 把任务交给调度器
    fn start(&self, params: TransferParams) -> TransferHandle {
        let task_id = params.task_id.clone();

        let (tx, rx) = oneshot::channel();
        self.shared.waiters.insert(task_id.clone(), tx);

        let token = self.shutdown.child_token();
        self.shared
            .cancel_tokens
            .insert(task_id.clone(), token.clone());

        let (settled_tx, settled_rx) = watch::channel(false);
        let ctx = self.ctx.clone();
        let shared = self.shared.clone();
        let job_task_id = task_id.clone();

        let job = Box::pin(async move {
            let publisher = ctx.publisher.clone();
            let outcome = FileTransfer::new(params, ctx, token).run().await;
            shared.settle(&publisher, &job_task_id, outcome);
            let _ = settled_tx.send(true);
        });

        // 作业可能立即开始，登记和入队在同一把锁内完成
        let mut jobs = self.shared.jobs.lock();
        let job_id = self.scheduler.push(job);
        jobs.insert(
            task_id.clone(),
            JobEntry {
                job_id,
                settled: settled_rx,
            },
        );
        drop(jobs);

        TransferHandle { task_id, rx }
    }

    /// 暂停任务
    ///
    /// 等待中的任务直接移出队列；运行中的任务触发取消并等待其结算
    pub async fn pause(&self, task_id: &str) -> Result<()> {
        let task = self
            .ledger
            .get(task_id)
            .ok_or_else(|| anyhow!("任务不存在: {}", task_id))?;

        if !matches!(task.status, TaskStatus::Wait | TaskStatus::Run) {
            bail!("任务当前状态不支持暂停: {:?}", task.status);
        }

        let Some(entry) = self.shared.job(task_id) else {
            return Ok(());
        };

        if self.scheduler.remove(entry.job_id) {
            self.shared.settle_dequeued(task_id);
            self.publisher().publish(TransferEvent::Paused {
                task_id: task_id.to_string(),
                missing_ranges: None,
            });
            self.shared.notify(
                task_id,
                TransferOutcome::Aborted {
                    missing_ranges: task.missing_ranges,
                },
            );
            info!("暂停等待中的任务: {}", task_id);
            return Ok(());
        }

        self.shared.cancel(task_id);
        wait_settled(entry).await;
        info!("暂停任务: {}", task_id);
        Ok(())
    }

    /// 恢复任务
    ///
    /// 暂停的任务从剩余范围继续；失败的任务从头开始
    pub async fn resume(&self, task_id: &str) -> Result<TransferHandle> {
        let task = self
            .ledger
            .get(task_id)
            .ok_or_else(|| anyhow!("任务不存在: {}", task_id))?;

        if self.shared.job(task_id).is_some() {
            bail!("任务仍在调度中: {}", task_id);
        }

        let resource = self.shared.resources.get(task_id).map(|r| r.value().clone());

        let params = match task.status {
            TaskStatus::Pause => TransferParams {
                task_id: task.id.clone(),
                direction: task.direction,
                remote_uri: task.remote_uri.clone(),
                local_path: task.local_path.clone(),
                total_size: task.total_size,
                missing_ranges: task.missing_ranges.clone(),
                fingerprint: resource.and_then(|r| r.fingerprint),
                retries: task.retries,
            },
            TaskStatus::Fail => {
                let fingerprint = match task.direction {
                    Direction::Upload => {
                        let fingerprint = SourceFingerprint::compute(&task.local_path)
                            .await
                            .map_err(|e| anyhow::Error::new(classify_error(&e)))?;
                        self.shared.resources.insert(
                            task.id.clone(),
                            LocalResource {
                                path: task.local_path.clone(),
                                fingerprint: Some(fingerprint.clone()),
                            },
                        );
                        Some(fingerprint)
                    }
                    Direction::Download => None,
                };

                TransferParams {
                    task_id: task.id.clone(),
                    direction: task.direction,
                    remote_uri: task.remote_uri.clone(),
                    local_path: task.local_path.clone(),
                    total_size: None,
                    missing_ranges: None,
                    fingerprint,
                    retries: 0,
                }
            }
            status => bail!("任务当前状态不支持恢复: {:?}", status),
        };

        info!("恢复任务: {} (状态 {:?})", task_id, task.status);
        self.publisher().publish(TransferEvent::Queued {
            task_id: task_id.to_string(),
        });
        Ok(self.start(params))
    }

    /// 删除任务，下载任务的临时文件一并删除
    pub async fn remove(&self, task_id: &str) -> Result<()> {
        let task = self
            .ledger
            .get(task_id)
            .ok_or_else(|| anyhow!("任务不存在: {}", task_id))?;

        // 先从台账移除，结算时不再记录暂停
        self.publisher().publish(TransferEvent::Removed {
            task_id: task_id.to_string(),
        });

        if let Some(entry) = self.shared.job(task_id) {
            if self.scheduler.remove(entry.job_id) {
                self.shared.settle_dequeued(task_id);
            } else {
                self.shared.cancel(task_id);
                wait_settled(entry).await;
            }
        }

        self.shared.notify(
            task_id,
            TransferOutcome::Aborted {
                missing_ranges: task.missing_ranges.clone(),
            },
        );

        let local_path = self
            .shared
            .resources
            .remove(task_id)
            .map(|(_, resource)| resource.path)
            .unwrap_or(task.local_path);

        if task.direction == Direction::Download {
            let part = part_path(&local_path);
            if let Err(e) = tokio::fs::remove_file(&part).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("删除临时文件失败: {:?}, 错误: {}", part, e);
                }
            }
        }

        info!("删除任务: {}", task_id);
        Ok(())
    }

    /// 登记一个持久化的任务，状态为暂停，之后调用 resume 继续
    pub fn restore(&self, state: ResumeState) -> Result<String> {
        self.ctx.remote.validate_uri(&state.remote_uri)?;
        if self.ledger.contains(&state.task_id) {
            bail!("任务已存在: {}", state.task_id);
        }

        let mut task = TransferTask::new(
            state.direction,
            state.remote_uri,
            state.local_path.clone(),
            Some(state.total_size),
        );
        task.id = state.task_id.clone();
        task.loaded = loaded_size(&state.missing_ranges, state.total_size);
        task.missing_ranges = Some(state.missing_ranges);
        task.status = TaskStatus::Pause;

        info!(
            "恢复持久化任务: id={}, 已完成 {}/{} bytes",
            task.id, task.loaded, state.total_size
        );

        self.shared.resources.insert(
            task.id.clone(),
            LocalResource {
                path: state.local_path,
                fingerprint: state.source_fingerprint,
            },
        );
        self.publisher().publish(TransferEvent::Created {
            task: Box::new(task),
        });

        Ok(state.task_id)
    }

    /// 导出续传记录，文件大小未知时返回 None
    pub fn resume_state(&self, task_id: &str) -> Option<ResumeState> {
        let task = self.ledger.get(task_id)?;
        let total_size = task.total_size?;

        let source_fingerprint = match task.direction {
            Direction::Upload => self
                .shared
                .resources
                .get(task_id)
                .and_then(|r| r.fingerprint.clone()),
            Direction::Download => None,
        };

        Some(ResumeState {
            task_id: task.id,
            direction: task.direction,
            remote_uri: task.remote_uri,
            local_path: task.local_path,
            total_size,
            missing_ranges: task
                .missing_ranges
                .unwrap_or_else(|| full_range(total_size)),
            source_fingerprint,
        })
    }

    /// 所有任务
    pub fn tasks(&self) -> Vec<TransferTask> {
        self.ledger.list()
    }

    pub fn task(&self, task_id: &str) -> Option<TransferTask> {
        self.ledger.get(task_id)
    }

    /// 订阅事件流
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.publisher().subscribe()
    }

    /// 调整最大同时传输文件数
    pub fn set_max_concurrent_tasks(&self, max: usize) {
        self.scheduler.set_concurrency(max);
    }

    pub fn max_concurrent_tasks(&self) -> usize {
        self.scheduler.concurrency()
    }

    /// 取消所有任务并等待结算
    pub async fn shutdown(&self) {
        info!("正在关闭传输管理器...");
        self.shutdown.cancel();

        let queued: Vec<(String, JobEntry)> = self
            .shared
            .jobs
            .lock()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect();

        for (task_id, entry) in queued {
            if !self.scheduler.remove(entry.job_id) {
                continue;
            }
            self.shared.settle_dequeued(&task_id);
            let missing_ranges = self.ledger.get(&task_id).and_then(|t| t.missing_ranges);
            self.publisher().publish(TransferEvent::Paused {
                task_id: task_id.clone(),
                missing_ranges: None,
            });
            self.shared
                .notify(&task_id, TransferOutcome::Aborted { missing_ranges });
        }

        self.scheduler.wait_idle().await;
        info!("传输管理器已关闭");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::{sum_size, ByteRange, DEFAULT_SLICE_SIZE};
    use crate::transfer::error::TransferError;
    use crate::remote::MemoryRemote;
    use std::time::Duration;
    use tokio::sync::broadcast::error::RecvError;

    fn config(slice_size: u64, slice_concurrency: usize) -> AppConfig {
        let mut config = AppConfig::default();
        config.transfer.slice_size = slice_size;
        config.transfer.slice_concurrency = slice_concurrency;
        config.transfer.retry_backoff_ms = 10;
        config.transfer.progress_throttle_ms = 0;
        config.speed.interval_ms = 50;
        config
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn transfer_error(err: &anyhow::Error) -> Option<&TransferError> {
        err.downcast_ref::<TransferError>()
    }

    /// 等待某个任务的进度达到指定百分比
    async fn wait_for_percent(
        rx: &mut broadcast::Receiver<TransferEvent>,
        task_id: &str,
        percent: f64,
    ) {
        loop {
            match rx.recv().await {
                Ok(TransferEvent::Progress {
                    task_id: id,
                    snapshot,
                }) if id == task_id && snapshot.percent() >= percent => return,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("事件通道已关闭"),
            }
        }
    }

    #[tokio::test]
    async fn test_upload_ten_megabytes_plus_tail() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("big.bin");
        let data = pattern(10 * 1024 * 1024 + 567);
        std::fs::write(&source, &data).unwrap();

        let remote = Arc::new(MemoryRemote::new());
        let manager = TransferManager::new(remote.clone(), &config(DEFAULT_SLICE_SIZE, 5));

        let handle = manager.upload(&source, "mem://big.bin").await.unwrap();
        let id = handle.task_id().to_string();
        assert_eq!(handle.finished().await, TransferOutcome::Succeeded);

        let mut writes = remote.write_ranges();
        writes.sort_by_key(|r| r.start);
        assert_eq!(writes.len(), 11);
        assert_eq!(
            writes[10],
            ByteRange::new(10 * 1024 * 1024, 10 * 1024 * 1024 + 566)
        );
        assert_eq!(writes[10].size(), 567);
        assert!(remote.max_in_flight() <= 5);

        let task = manager.task(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Success);
        assert_eq!(task.loaded, data.len() as u64);
        assert_eq!(task.missing_ranges, Some(vec![]));
        assert_eq!(remote.get("mem://big.bin").unwrap(), data);
    }

    #[tokio::test]
    async fn test_download_survives_transient_failures() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("b.bin");
        let data = pattern(64 * 1024);

        let remote = Arc::new(MemoryRemote::new());
        remote.insert("mem://b.bin", data.clone());
        remote.fail_next_reads(9);

        let manager = TransferManager::new(remote.clone(), &config(4096, 1));
        let handle = manager.download("mem://b.bin", &dest, None).await.unwrap();
        let id = handle.task_id().to_string();

        assert_eq!(handle.finished().await, TransferOutcome::Succeeded);

        let task = manager.task(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Success);
        assert!(task.retries >= 9);
        assert_eq!(std::fs::read(&dest).unwrap(), data);
        assert!(!part_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_pause_persist_and_resume_in_fresh_manager() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("c.bin");
        let data = pattern(100 * 1024);
        let cfg = config(1024, 2);

        let remote = Arc::new(MemoryRemote::new().with_latency(Duration::from_millis(5)));
        remote.insert("mem://c.bin", data.clone());
        let manager = TransferManager::new(remote.clone(), &cfg);
        let mut rx = manager.subscribe();

        let handle = manager.download("mem://c.bin", &dest, None).await.unwrap();
        let id = handle.task_id().to_string();

        wait_for_percent(&mut rx, &id, 40.0).await;
        manager.pause(&id).await.unwrap();

        let TransferOutcome::Aborted {
            missing_ranges: Some(missing),
        } = handle.finished().await
        else {
            panic!("暂停后应返回 Aborted");
        };
        assert!(!missing.is_empty());

        let paused = manager.task(&id).unwrap();
        assert_eq!(paused.status, TaskStatus::Pause);
        assert_eq!(paused.missing_ranges.as_ref(), Some(&missing));

        let state = manager.resume_state(&id).unwrap();
        let persisted = serde_json::to_string(&state).unwrap();
        drop(manager);

        let restored: ResumeState = serde_json::from_str(&persisted).unwrap();
        assert_eq!(restored, state);
        assert!(sum_size(&restored.missing_ranges) < data.len() as u64);

        let remote2 = Arc::new(MemoryRemote::new());
        remote2.insert("mem://c.bin", data.clone());
        let manager2 = TransferManager::new(remote2.clone(), &cfg);

        assert_eq!(manager2.restore(restored.clone()).unwrap(), id);
        assert_eq!(manager2.task(&id).unwrap().status, TaskStatus::Pause);

        let handle = manager2.resume(&id).await.unwrap();
        assert_eq!(handle.finished().await, TransferOutcome::Succeeded);

        // 只请求了剩余的分片
        let reads = remote2.read_ranges();
        assert!(reads.iter().all(|r| paused.is_missing(r)));
        assert_eq!(sum_size(&reads), sum_size(&restored.missing_ranges));
        assert_eq!(std::fs::read(&dest).unwrap(), data);
    }

    #[tokio::test]
    async fn test_integrity_mismatch_fails_without_retry() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("d.bin");
        std::fs::write(&source, pattern(8 * 1024)).unwrap();

        let remote = Arc::new(MemoryRemote::new());
        remote.corrupt_next_hashes(1);
        let manager = TransferManager::new(remote.clone(), &config(1024, 1));

        let handle = manager.upload(&source, "mem://d.bin").await.unwrap();
        let id = handle.task_id().to_string();

        let outcome = handle.finished().await;
        assert!(matches!(
            outcome,
            TransferOutcome::Failed(TransferError::Integrity { .. })
        ));

        let task = manager.task(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Fail);
        assert_eq!(task.retries, 0);
        assert!(task.fail_reason.is_some());
        assert_eq!(remote.write_ranges().len(), 1);
    }

    #[tokio::test]
    async fn test_abort_is_final() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("e.bin");

        let remote = Arc::new(MemoryRemote::new().with_latency(Duration::from_millis(20)));
        remote.insert("mem://e.bin", pattern(64 * 1024));
        let manager = TransferManager::new(remote.clone(), &config(1024, 2));
        let mut rx = manager.subscribe();

        let handle = manager.download("mem://e.bin", &dest, None).await.unwrap();
        let id = handle.task_id().to_string();
        wait_for_percent(&mut rx, &id, 1.0).await;

        manager.pause(&id).await.unwrap();
        assert!(matches!(
            handle.finished().await,
            TransferOutcome::Aborted { .. }
        ));

        let requested = remote.read_ranges().len();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(remote.read_ranges().len(), requested);
        assert_eq!(manager.task(&id).unwrap().status, TaskStatus::Pause);
        assert!(part_path(&dest).exists());
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_invalid_requests_are_rejected_synchronously() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(MemoryRemote::new());
        let manager = TransferManager::new(remote, &config(1024, 2));

        let err = manager
            .download("not a uri", dir.path().join("x"), None)
            .await
            .unwrap_err();
        assert!(matches!(
            transfer_error(&err),
            Some(TransferError::InvalidUri(_))
        ));

        let err = manager
            .upload(dir.path().join("missing.bin"), "mem://x")
            .await
            .unwrap_err();
        assert!(matches!(transfer_error(&err), Some(TransferError::Io(_))));

        assert!(manager.tasks().is_empty());
    }

    #[tokio::test]
    async fn test_files_run_one_at_a_time() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(MemoryRemote::new().with_latency(Duration::from_millis(2)));
        let manager = TransferManager::new(remote.clone(), &config(1024, 3));
        let mut rx = manager.subscribe();

        let mut handles = Vec::new();
        for i in 0..3 {
            let uri = format!("mem://f{}.bin", i);
            remote.insert(&uri, pattern(8 * 1024));
            handles.push(
                manager
                    .download(&uri, dir.path().join(format!("f{}.bin", i)), None)
                    .await
                    .unwrap(),
            );
        }
        for handle in handles {
            assert_eq!(handle.finished().await, TransferOutcome::Succeeded);
        }

        let mut running = 0i32;
        let mut peak = 0i32;
        while let Ok(event) = rx.try_recv() {
            match event {
                TransferEvent::Running { .. } => running += 1,
                TransferEvent::Succeeded { .. } | TransferEvent::Failed { .. } => running -= 1,
                _ => {}
            }
            peak = peak.max(running);
        }
        assert_eq!(peak, 1);
        assert_eq!(running, 0);
    }

    #[tokio::test]
    async fn test_raising_task_limit_starts_waiting_file() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(MemoryRemote::new().with_latency(Duration::from_millis(10)));
        let manager = TransferManager::new(remote.clone(), &config(1024, 1));
        let mut rx = manager.subscribe();

        let mut handles = Vec::new();
        for i in 0..2 {
            let uri = format!("mem://r{}.bin", i);
            remote.insert(&uri, pattern(8 * 1024));
            handles.push(
                manager
                    .download(&uri, dir.path().join(format!("r{}.bin", i)), None)
                    .await
                    .unwrap(),
            );
        }

        manager.set_max_concurrent_tasks(2);
        assert_eq!(manager.max_concurrent_tasks(), 2);
        for handle in handles {
            assert_eq!(handle.finished().await, TransferOutcome::Succeeded);
        }

        let mut running = 0i32;
        let mut peak = 0i32;
        while let Ok(event) = rx.try_recv() {
            match event {
                TransferEvent::Running { .. } => running += 1,
                TransferEvent::Succeeded { .. } => running -= 1,
                _ => {}
            }
            peak = peak.max(running);
        }
        assert_eq!(peak, 2);
    }

    #[tokio::test]
    async fn test_pause_waiting_task_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(MemoryRemote::new().with_latency(Duration::from_millis(20)));
        remote.insert("mem://g1.bin", pattern(64 * 1024));
        remote.insert("mem://g2.bin", pattern(4 * 1024));
        let manager = TransferManager::new(remote.clone(), &config(1024, 1));

        let first = manager
            .download("mem://g1.bin", dir.path().join("g1.bin"), None)
            .await
            .unwrap();
        let second = manager
            .download("mem://g2.bin", dir.path().join("g2.bin"), None)
            .await
            .unwrap();
        let second_id = second.task_id().to_string();

        assert_eq!(manager.task(&second_id).unwrap().status, TaskStatus::Wait);
        manager.pause(&second_id).await.unwrap();
        assert_eq!(manager.task(&second_id).unwrap().status, TaskStatus::Pause);
        assert!(matches!(
            second.finished().await,
            TransferOutcome::Aborted { .. }
        ));

        manager.shutdown().await;
        assert!(matches!(
            first.finished().await,
            TransferOutcome::Aborted { .. }
        ));
        assert!(manager
            .tasks()
            .iter()
            .all(|t| t.status == TaskStatus::Pause));
    }

    #[tokio::test]
    async fn test_remove_running_download_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("h.bin");
        let remote = Arc::new(MemoryRemote::new().with_latency(Duration::from_millis(10)));
        remote.insert("mem://h.bin", pattern(64 * 1024));
        let manager = TransferManager::new(remote.clone(), &config(1024, 2));
        let mut rx = manager.subscribe();

        let handle = manager.download("mem://h.bin", &dest, None).await.unwrap();
        let id = handle.task_id().to_string();
        wait_for_percent(&mut rx, &id, 1.0).await;

        manager.remove(&id).await.unwrap();
        assert!(matches!(
            handle.finished().await,
            TransferOutcome::Aborted { .. }
        ));
        assert!(manager.task(&id).is_none());
        assert!(!part_path(&dest).exists());
        assert!(manager.remove(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_resume_detects_remote_shrink() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(MemoryRemote::new());
        remote.insert("mem://s.bin", pattern(1000));
        let manager = TransferManager::new(remote, &config(256, 2));

        let id = manager
            .restore(ResumeState {
                task_id: "shrunk".to_string(),
                direction: Direction::Download,
                remote_uri: "mem://s.bin".to_string(),
                local_path: dir.path().join("s.bin"),
                total_size: 2000,
                missing_ranges: vec![ByteRange::new(1000, 1999)],
                source_fingerprint: None,
            })
            .unwrap();

        let outcome = manager.resume(&id).await.unwrap().finished().await;
        assert_eq!(
            outcome,
            TransferOutcome::Failed(TransferError::SizeChanged {
                expected: 2000,
                actual: 1000
            })
        );
        assert_eq!(manager.task(&id).unwrap().status, TaskStatus::Fail);
    }

    #[tokio::test]
    async fn test_resume_rejects_modified_upload_source() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src.bin");
        std::fs::write(&source, pattern(4096)).unwrap();
        let fingerprint = SourceFingerprint::compute(&source).await.unwrap();

        // 大小不变，内容改变
        std::fs::write(&source, vec![0u8; 4096]).unwrap();

        let remote = Arc::new(MemoryRemote::new());
        let manager = TransferManager::new(remote.clone(), &config(1024, 2));
        let id = manager
            .restore(ResumeState {
                task_id: "changed".to_string(),
                direction: Direction::Upload,
                remote_uri: "mem://src.bin".to_string(),
                local_path: source.clone(),
                total_size: 4096,
                missing_ranges: vec![ByteRange::new(2048, 4095)],
                source_fingerprint: Some(fingerprint),
            })
            .unwrap();

        let outcome = manager.resume(&id).await.unwrap().finished().await;
        assert_eq!(outcome, TransferOutcome::Failed(TransferError::SourceChanged));
        assert!(remote.write_ranges().is_empty());
    }

    #[tokio::test]
    async fn test_zero_byte_transfers() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(MemoryRemote::new());
        let manager = TransferManager::new(remote.clone(), &config(1024, 2));

        let source = dir.path().join("empty.bin");
        std::fs::write(&source, b"").unwrap();
        let handle = manager.upload(&source, "mem://empty.bin").await.unwrap();
        assert_eq!(handle.finished().await, TransferOutcome::Succeeded);
        assert_eq!(remote.get("mem://empty.bin"), Some(Vec::new()));
        assert!(remote.write_ranges().is_empty());

        let dest = dir.path().join("empty-copy.bin");
        let handle = manager
            .download("mem://empty.bin", &dest, None)
            .await
            .unwrap();
        assert_eq!(handle.finished().await, TransferOutcome::Succeeded);
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), 0);
        assert!(remote.read_ranges().is_empty());
    }

    #[tokio::test]
    async fn test_failed_task_restarts_from_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("later.bin");
        let remote = Arc::new(MemoryRemote::new());
        let manager = TransferManager::new(remote.clone(), &config(1024, 2));

        let handle = manager
            .download("mem://later.bin", &dest, None)
            .await
            .unwrap();
        let id = handle.task_id().to_string();
        assert!(matches!(
            handle.finished().await,
            TransferOutcome::Failed(TransferError::Other(_))
        ));
        assert!(manager.resume_state(&id).is_none());

        let data = pattern(3000);
        remote.insert("mem://later.bin", data.clone());
        let handle = manager.resume(&id).await.unwrap();
        assert_eq!(handle.finished().await, TransferOutcome::Succeeded);
        assert_eq!(std::fs::read(&dest).unwrap(), data);

        // 已完成的任务不能再恢复
        assert!(manager.resume(&id).await.is_err());
    }

    /// 所有请求都不返回的远端
    struct StalledRemote;

    #[async_trait::async_trait]
    impl RemoteEndpoint for StalledRemote {
        async fn stat(&self, _uri: &str) -> Result<crate::remote::RemoteStat> {
            std::future::pending().await
        }

        async fn read_range(
            &self,
            _uri: &str,
            _start: u64,
            _end: u64,
            _on_progress: &(dyn Fn(u64) + Send + Sync),
        ) -> Result<Vec<u8>> {
            std::future::pending().await
        }

        async fn write_range(
            &self,
            _uri: &str,
            _data: Vec<u8>,
            _start: u64,
            _end: u64,
            _total_size: u64,
        ) -> Result<crate::remote::WriteAck> {
            std::future::pending().await
        }

        async fn write_empty(&self, _uri: &str) -> Result<()> {
            std::future::pending().await
        }
    }

    async fn wait_for_running(rx: &mut broadcast::Receiver<TransferEvent>, task_id: &str) {
        loop {
            match rx.recv().await {
                Ok(TransferEvent::Running { task_id: id }) if id == task_id => return,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("事件通道已关闭"),
            }
        }
    }

    #[tokio::test]
    async fn test_pause_during_stalled_stat() {
        let dir = tempfile::tempdir().unwrap();
        let manager = TransferManager::new(Arc::new(StalledRemote), &config(1024, 2));
        let mut rx = manager.subscribe();

        let handle = manager
            .download("mem://stalled.bin", dir.path().join("stalled.bin"), None)
            .await
            .unwrap();
        let id = handle.task_id().to_string();
        wait_for_running(&mut rx, &id).await;

        tokio::time::timeout(Duration::from_secs(3), manager.pause(&id))
            .await
            .expect("初始化阶段的暂停应立即生效")
            .unwrap();
        assert_eq!(
            handle.finished().await,
            TransferOutcome::Aborted {
                missing_ranges: None
            }
        );
        assert_eq!(manager.task(&id).unwrap().status, TaskStatus::Pause);
    }

    #[tokio::test]
    async fn test_pause_and_shutdown_during_stalled_empty_upload() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("empty.bin");
        std::fs::write(&source, b"").unwrap();

        let manager = TransferManager::new(Arc::new(StalledRemote), &config(1024, 2));
        let mut rx = manager.subscribe();

        let handle = manager.upload(&source, "mem://empty.bin").await.unwrap();
        let id = handle.task_id().to_string();
        wait_for_running(&mut rx, &id).await;

        tokio::time::timeout(Duration::from_secs(3), manager.pause(&id))
            .await
            .expect("创建空文件时的暂停应立即生效")
            .unwrap();
        assert!(matches!(
            handle.finished().await,
            TransferOutcome::Aborted { .. }
        ));

        let handle = manager.resume(&id).await.unwrap();
        wait_for_running(&mut rx, &id).await;
        tokio::time::timeout(Duration::from_secs(3), manager.shutdown())
            .await
            .expect("关闭不应等待卡住的请求");
        assert!(matches!(
            handle.finished().await,
            TransferOutcome::Aborted { .. }
        ));
    }

    #[tokio::test]
    async fn test_stat_failures_are_retried() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("stat.bin");
        let data = pattern(5000);

        let remote = Arc::new(MemoryRemote::new());
        remote.insert("mem://stat.bin", data.clone());
        remote.fail_next_stats(2);
        let manager = TransferManager::new(remote.clone(), &config(1024, 2));

        let handle = manager.download("mem://stat.bin", &dest, None).await.unwrap();
        let id = handle.task_id().to_string();
        assert_eq!(handle.finished().await, TransferOutcome::Succeeded);

        let task = manager.task(&id).unwrap();
        assert_eq!(task.retries, 2);
        assert_eq!(task.total_size, Some(5000));
        assert_eq!(std::fs::read(&dest).unwrap(), data);
    }

    #[tokio::test]
    async fn test_upload_write_failures_are_retried() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("up.bin");
        let data = pattern(4096);
        std::fs::write(&source, &data).unwrap();

        let remote = Arc::new(MemoryRemote::new());
        remote.fail_next_writes(3);
        let manager = TransferManager::new(remote.clone(), &config(1024, 1));

        let handle = manager.upload(&source, "mem://up.bin").await.unwrap();
        let id = handle.task_id().to_string();
        assert_eq!(handle.finished().await, TransferOutcome::Succeeded);

        let task = manager.task(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Success);
        assert_eq!(task.retries, 3);
        // 4 个分片 + 3 次失败的写入
        assert_eq!(remote.write_ranges().len(), 7);
        assert_eq!(remote.get("mem://up.bin").unwrap(), data);
    }

    #[tokio::test]
    async fn test_resume_after_remote_grew_keeps_recorded_size() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("grew.bin");
        let data = pattern(3000);

        let remote = Arc::new(MemoryRemote::new());
        remote.insert("mem://grew.bin", data.clone());

        // 上次运行已完成前 1000 字节
        let mut partial = data[..1000].to_vec();
        partial.resize(2000, 0);
        std::fs::write(part_path(&dest), &partial).unwrap();

        let manager = TransferManager::new(remote.clone(), &config(256, 2));
        let id = manager
            .restore(ResumeState {
                task_id: "grew".to_string(),
                direction: Direction::Download,
                remote_uri: "mem://grew.bin".to_string(),
                local_path: dest.clone(),
                total_size: 2000,
                missing_ranges: vec![ByteRange::new(1000, 1999)],
                source_fingerprint: None,
            })
            .unwrap();

        let handle = manager.resume(&id).await.unwrap();
        assert_eq!(handle.finished().await, TransferOutcome::Succeeded);

        let task = manager.task(&id).unwrap();
        assert_eq!(task.total_size, Some(2000));
        assert_eq!(task.loaded, 2000);

        let reads = remote.read_ranges();
        let recorded = ByteRange::new(1000, 1999);
        assert!(reads.iter().all(|r| recorded.covers(r)));
        assert_eq!(sum_size(&reads), 1000);
        assert_eq!(std::fs::read(&dest).unwrap(), data[..2000].to_vec());
    }
}
