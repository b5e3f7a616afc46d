// 单文件传输编排器
//
// 负责一个任务从初始化到终态的全过程：
// 1. 初始化：确定文件大小和剩余范围，准备本地文件
// 2. 传输：切分剩余范围，受限并发执行分片，逐个提交完成结果
// 3. 失败：分类错误，可重试错误等待固定退避后重新开始本轮传输
//
// 剩余范围只在编排器的单一更新循环中修改，分片任务只返回结果。

use super::error::{classify_error, TransferError};
use super::events::{EventPublisher, TransferEvent};
use super::fingerprint::SourceFingerprint;
use super::guard::guarded;
use super::slice::{SliceExecutor, SliceJob, SliceOutput};
use super::task::{Direction, ProgressSnapshot};
use super::throttle::ProgressThrottler;
use crate::config::{SpeedConfig, TransferConfig};
use crate::range::{
    full_range, loaded_size, slice_index, split_into_slices, subtract_completed, sum_size,
    ByteRange, RangeSet,
};
use crate::remote::RemoteEndpoint;
use crate::speed::SpeedCounter;
use anyhow::{Context, Result};
use std::ffi::OsString;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// stat / 创建空文件 等元数据请求的超时
const METADATA_TIMEOUT: Duration = Duration::from_secs(60);

/// 下载临时文件路径: `<dest>.part`
pub fn part_path(dest: &Path) -> PathBuf {
    let mut name = OsString::from(dest.as_os_str());
    name.push(".part");
    PathBuf::from(name)
}

/// 传输终态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Succeeded,
    Failed(TransferError),
    /// 被取消，附带最后一次提交的剩余范围（初始化之前取消时为 None）
    Aborted { missing_ranges: Option<RangeSet> },
}

/// 编排器共享的运行环境
#[derive(Clone)]
pub struct TransferContext {
    pub remote: Arc<dyn RemoteEndpoint>,
    pub transfer: TransferConfig,
    pub speed: SpeedConfig,
    pub publisher: EventPublisher,
}

/// 单次运行的任务参数
#[derive(Debug, Clone)]
pub struct TransferParams {
    pub task_id: String,
    pub direction: Direction,
    pub remote_uri: String,
    pub local_path: PathBuf,
    /// 已知的文件大小
    pub total_size: Option<u64>,
    /// 续传时的剩余范围，None 表示全新传输
    pub missing_ranges: Option<RangeSet>,
    /// 上传源文件登记时的指纹
    pub fingerprint: Option<SourceFingerprint>,
    /// 已累计的重试次数
    pub retries: u32,
}

/// 单文件传输
pub struct FileTransfer {
    params: TransferParams,
    ctx: TransferContext,
    executor: SliceExecutor,
    speed: Arc<SpeedCounter>,
    throttler: ProgressThrottler,
    cancel: CancellationToken,

    total_size: Option<u64>,
    missing: Option<RangeSet>,
    loaded: u64,
    retries: u32,
    initialized: bool,
    /// 下载写入的临时文件
    sink: Option<File>,
}

impl FileTransfer {
    pub fn new(params: TransferParams, ctx: TransferContext, cancel: CancellationToken) -> Self {
        let total_size = params.total_size;
        let missing = params.missing_ranges.clone();
        let loaded = match (&missing, total_size) {
            (Some(missing), Some(total)) => loaded_size(missing, total),
            _ => 0,
        };

        Self {
            executor: SliceExecutor::new(ctx.remote.clone()),
            speed: Arc::new(SpeedCounter::new(&ctx.speed)),
            throttler: ProgressThrottler::with_millis(ctx.transfer.progress_throttle_ms),
            retries: params.retries,
            params,
            ctx,
            cancel,
            total_size,
            missing,
            loaded,
            initialized: false,
            sink: None,
        }
    }

    fn task_id(&self) -> &str {
        &self.params.task_id
    }

    /// 运行到终态
    pub async fn run(mut self) -> TransferOutcome {
        info!(
            "开始传输: task={}, 方向={:?}, 远端={}, 本地={:?}",
            self.params.task_id, self.params.direction, self.params.remote_uri, self.params.local_path
        );
        self.ctx.publisher.publish(TransferEvent::Running {
            task_id: self.params.task_id.clone(),
        });

        loop {
            if self.cancel.is_cancelled() {
                return self.abort().await;
            }

            let error = match self.attempt().await {
                Ok(()) => return self.succeed().await,
                Err(e) => e,
            };

            if self.cancel.is_cancelled() {
                return self.abort().await;
            }

            match classify_error(&error) {
                TransferError::Aborted => return self.abort().await,
                kind if kind.is_retryable() => {
                    self.retries += 1;
                    warn!(
                        "传输出错，{}ms 后重试 (task={}, 第 {} 次): {:#}",
                        self.ctx.transfer.retry_backoff_ms, self.params.task_id, self.retries, error
                    );
                    self.emit_progress(true);

                    tokio::select! {
                        _ = self.cancel.cancelled() => return self.abort().await,
                        _ = tokio::time::sleep(self.ctx.transfer.retry_backoff()) => {}
                    }
                }
                kind => return self.fail(kind).await,
            }
        }
    }

    /// 一轮传输：必要时初始化，然后传输当前剩余范围
    async fn attempt(&mut self) -> Result<()> {
        if !self.initialized {
            self.initialize().await?;
            self.initialized = true;
            self.emit_progress(true);
        }
        self.run_slices().await
    }

    async fn initialize(&mut self) -> Result<()> {
        let total = match self.params.direction {
            Direction::Download => self.resolve_download_size().await?,
            Direction::Upload => self.resolve_upload_size().await?,
        };

        let missing = match self.missing.take() {
            Some(missing) => missing,
            None => full_range(total),
        };
        self.total_size = Some(total);
        self.loaded = loaded_size(&missing, total);
        self.missing = Some(missing);

        match self.params.direction {
            Direction::Download => self.prepare_sink(total).await?,
            Direction::Upload if total == 0 => {
                guarded(
                    self.ctx.remote.write_empty(&self.params.remote_uri),
                    &self.cancel,
                    METADATA_TIMEOUT,
                )
                .await
                .context("创建远端空文件失败")?;
            }
            Direction::Upload => {}
        }

        info!(
            "初始化完成: task={}, 大小={} bytes, 已完成={} bytes, 剩余范围 {} 段",
            self.params.task_id,
            total,
            self.loaded,
            self.missing.as_ref().map(Vec::len).unwrap_or(0)
        );
        Ok(())
    }

    async fn resolve_download_size(&self) -> Result<u64> {
        let known = self.total_size;
        // 已知大小的全新下载不需要 stat
        if let (Some(size), None) = (known, &self.missing) {
            return Ok(size);
        }

        let stat = guarded(
            self.ctx.remote.stat(&self.params.remote_uri),
            &self.cancel,
            METADATA_TIMEOUT,
        )
        .await?;
        match known {
            Some(expected) if stat.size < expected => Err(TransferError::SizeChanged {
                expected,
                actual: stat.size,
            }
            .into()),
            Some(expected) => {
                if stat.size > expected {
                    warn!(
                        "远端文件已变大 ({} -> {} bytes)，只继续下载已记录的范围: task={}",
                        expected, stat.size, self.params.task_id
                    );
                }
                Ok(expected)
            }
            None => Ok(stat.size),
        }
    }

    async fn resolve_upload_size(&self) -> Result<u64> {
        let metadata = fs::metadata(&self.params.local_path)
            .await
            .with_context(|| format!("读取源文件信息失败: {:?}", self.params.local_path))?;
        let actual = metadata.len();

        if let Some(expected) = self.total_size {
            if actual != expected {
                return Err(TransferError::SizeChanged { expected, actual }.into());
            }
        }

        if self.missing.is_some() {
            if let Some(expected) = &self.params.fingerprint {
                let current = SourceFingerprint::compute(&self.params.local_path).await?;
                if &current != expected {
                    return Err(TransferError::SourceChanged.into());
                }
            }
        }

        Ok(actual)
    }

    /// 准备下载临时文件，续传时复用已有的临时文件
    async fn prepare_sink(&mut self, total: u64) -> Result<()> {
        let part = part_path(&self.params.local_path);
        if let Some(parent) = part.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("创建目录失败: {:?}", parent))?;
            }
        }

        let resumable = self.loaded > 0
            && fs::metadata(&part)
                .await
                .map(|m| m.len() == total)
                .unwrap_or(false);

        let file = if resumable {
            OpenOptions::new()
                .write(true)
                .open(&part)
                .await
                .with_context(|| format!("打开临时文件失败: {:?}", part))?
        } else {
            if self.loaded > 0 {
                warn!(
                    "临时文件不存在或大小不符，从头下载: task={}, 文件={:?}",
                    self.params.task_id, part
                );
                self.missing = Some(full_range(total));
                self.loaded = 0;
            }
            let file = File::create(&part)
                .await
                .with_context(|| format!("创建临时文件失败: {:?}", part))?;
            file.set_len(total).await.context("预分配临时文件失败")?;
            file
        };

        self.sink = Some(file);
        Ok(())
    }

    /// 受限并发传输剩余范围
    async fn run_slices(&mut self) -> Result<()> {
        let missing = self.missing.clone().unwrap_or_default();
        let slice_size = self.ctx.transfer.slice_size;
        let slices = split_into_slices(&missing, slice_size);
        if slices.is_empty() {
            return Ok(());
        }

        let limit = self.ctx.transfer.slice_concurrency.max(1);
        debug!(
            "本轮传输 {} 个分片，并发数 {}: task={}",
            slices.len(),
            limit,
            self.params.task_id
        );

        // 每轮一个子令牌，失败时只取消本轮的分片
        let attempt = self.cancel.child_token();
        self.speed.start();

        let mut pending = slices.into_iter();
        let mut join_set: JoinSet<Result<(SliceJob, SliceOutput)>> = JoinSet::new();

        let result = loop {
            while join_set.len() < limit {
                let Some(range) = pending.next() else {
                    break;
                };
                self.spawn_slice(&mut join_set, range, &attempt);
            }

            let Some(joined) = join_set.join_next().await else {
                break Ok(());
            };

            let completed = match joined {
                Ok(result) => result,
                Err(e) => Err(anyhow::anyhow!("分片任务异常: {}", e)),
            };

            match completed {
                Ok((job, output)) => {
                    if let Err(e) = self.commit(&job, output).await {
                        break Err(e);
                    }
                }
                Err(e) => break Err(e),
            }
        };

        if result.is_err() {
            attempt.cancel();
            join_set.shutdown().await;
        }
        result
    }

    fn spawn_slice(
        &self,
        join_set: &mut JoinSet<Result<(SliceJob, SliceOutput)>>,
        range: ByteRange,
        attempt: &CancellationToken,
    ) {
        let job = SliceJob {
            remote_uri: self.params.remote_uri.clone(),
            start: range.start,
            end: range.end,
            total_size: self.total_size.unwrap_or_default(),
            direction: self.params.direction,
        };
        let executor = self.executor.clone();
        let speed = self.speed.clone();
        let cancel = attempt.clone();
        let local_path = self.params.local_path.clone();

        join_set.spawn(async move {
            let payload = match job.direction {
                Direction::Upload => Some(read_slice(&local_path, job.start, job.size()).await?),
                Direction::Download => None,
            };
            let output = executor
                .execute(&job, payload, &cancel, |bytes| speed.record(bytes))
                .await?;
            Ok((job, output))
        });
    }

    /// 提交一个完成的分片
    async fn commit(&mut self, job: &SliceJob, output: SliceOutput) -> Result<()> {
        if let SliceOutput::Downloaded(data) = output {
            let sink = self.sink.as_mut().context("下载临时文件未打开")?;
            sink.seek(SeekFrom::Start(job.start))
                .await
                .context("文件定位失败")?;
            sink.write_all(&data).await.context("写入文件失败")?;
        }

        let range = job.range();
        let missing = self.missing.get_or_insert_with(Vec::new);
        *missing = subtract_completed(missing, range);
        let finished = missing.is_empty();

        let total = self.total_size.unwrap_or_default();
        self.loaded = (self.loaded + range.size()).min(total);

        debug!(
            "分片 #{} 完成: task={}, 范围={}, 进度 {}/{}",
            slice_index(&range, self.ctx.transfer.slice_size),
            self.params.task_id,
            range,
            self.loaded,
            total
        );

        self.emit_progress(finished);
        Ok(())
    }

    fn emit_progress(&self, force: bool) {
        let Some(total_size) = self.total_size else {
            return;
        };
        if force {
            self.throttler.force_emit();
        } else if !self.throttler.should_emit() {
            return;
        }

        let missing_ranges = self.missing.clone().unwrap_or_default();
        let remaining = sum_size(&missing_ranges);
        let snapshot = ProgressSnapshot {
            loaded: self.loaded,
            total_size,
            missing_ranges,
            speed: self.speed.speed(),
            eta: self.speed.eta(remaining),
            retries: self.retries,
        };

        self.ctx.publisher.publish(TransferEvent::Progress {
            task_id: self.params.task_id.clone(),
            snapshot,
        });
    }

    async fn flush_sink(&mut self) -> Result<()> {
        if let Some(sink) = self.sink.as_mut() {
            sink.flush().await.context("刷新文件缓冲失败")?;
            sink.sync_all().await.context("同步文件失败")?;
        }
        Ok(())
    }

    async fn succeed(mut self) -> TransferOutcome {
        self.speed.stop();

        if self.params.direction == Direction::Download {
            let finalized = async {
                self.flush_sink().await?;
                self.sink = None;
                let part = part_path(&self.params.local_path);
                fs::rename(&part, &self.params.local_path)
                    .await
                    .with_context(|| format!("重命名临时文件失败: {:?}", part))
            }
            .await;

            if let Err(e) = finalized {
                let kind = classify_error(&e);
                return self.fail(kind).await;
            }
        }

        self.loaded = self.total_size.unwrap_or(self.loaded);
        self.missing = Some(Vec::new());
        self.emit_progress(true);

        let completed_at = chrono::Utc::now().timestamp();
        self.ctx.publisher.publish(TransferEvent::Succeeded {
            task_id: self.params.task_id.clone(),
            completed_at,
        });
        info!(
            "✓ 传输完成: task={}, 大小={} bytes, 重试 {} 次",
            self.params.task_id, self.loaded, self.retries
        );
        TransferOutcome::Succeeded
    }

    async fn fail(mut self, kind: TransferError) -> TransferOutcome {
        self.speed.stop();

        if self.params.direction == Direction::Download {
            self.sink = None;
            let part = part_path(&self.params.local_path);
            if let Err(e) = fs::remove_file(&part).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("删除临时文件失败: {:?}, 错误: {}", part, e);
                }
            }
        }

        error!("传输失败: task={}, 原因: {}", self.params.task_id, kind);
        self.ctx.publisher.publish(TransferEvent::Failed {
            task_id: self.params.task_id.clone(),
            error: kind.to_string(),
        });
        TransferOutcome::Failed(kind)
    }

    /// 取消：保留临时文件和已提交的剩余范围
    async fn abort(mut self) -> TransferOutcome {
        self.speed.stop();
        if let Err(e) = self.flush_sink().await {
            warn!("暂停时刷新临时文件失败: task={}, 错误: {:#}", self.task_id(), e);
        }
        self.emit_progress(true);

        info!("传输已中止: task={}, 已完成 {} bytes", self.task_id(), self.loaded);
        TransferOutcome::Aborted {
            missing_ranges: self.missing.clone(),
        }
    }
}

/// 读取上传分片数据（阻塞 I/O 放到 spawn_blocking 中执行）
async fn read_slice(local_path: &Path, start: u64, size: u64) -> Result<Vec<u8>> {
    use std::io::{Read, Seek};

    let local_path = local_path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::open(&local_path)
            .with_context(|| format!("无法打开文件: {:?}", local_path))?;
        file.seek(SeekFrom::Start(start))?;

        let mut buffer = vec![0u8; size as usize];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    })
    .await
    .context("读取分片任务异常退出")?
}
