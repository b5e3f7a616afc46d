// 分片执行器
//
// 执行单个分片的网络操作。错误原样上抛，由编排器统一分类和重试。

use super::error::TransferError;
use super::guard::guarded;
use super::task::Direction;
use crate::range::ByteRange;
use crate::remote::{content_hash, RemoteEndpoint, RemoteError};
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 单个分片任务
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceJob {
    pub remote_uri: String,
    pub start: u64,
    pub end: u64,
    pub total_size: u64,
    pub direction: Direction,
}

impl SliceJob {
    pub fn range(&self) -> ByteRange {
        ByteRange::new(self.start, self.end)
    }

    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// 分片执行结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SliceOutput {
    /// 下载得到的字节
    Downloaded(Vec<u8>),
    /// 上传成功，附带已校验的内容哈希
    Uploaded { content_hash: String },
}

/// 根据分片大小计算请求超时（秒）
///
/// 按最低 100KB/s 估算耗时再乘以 3，限制在 60 ~ 600 秒之间
pub fn slice_timeout_secs(slice_size: u64) -> u64 {
    const MIN_SPEED_KBPS: u64 = 100;
    const MIN_TIMEOUT: u64 = 60;
    const MAX_TIMEOUT: u64 = 600;

    let expected_secs = (slice_size / (MIN_SPEED_KBPS * 1024)) * 3;
    expected_secs.clamp(MIN_TIMEOUT, MAX_TIMEOUT)
}

/// 分片执行器
#[derive(Clone)]
pub struct SliceExecutor {
    remote: Arc<dyn RemoteEndpoint>,
}

impl SliceExecutor {
    pub fn new(remote: Arc<dyn RemoteEndpoint>) -> Self {
        Self { remote }
    }

    /// 执行一个分片
    ///
    /// * `payload` - 上传时的分片数据，下载时为 None
    /// * `flow` - 流量回调，只接收增量字节数
    pub async fn execute<F>(
        &self,
        job: &SliceJob,
        payload: Option<Vec<u8>>,
        cancel: &CancellationToken,
        flow: F,
    ) -> Result<SliceOutput>
    where
        F: Fn(u64) + Send + Sync,
    {
        if cancel.is_cancelled() {
            return Err(TransferError::Aborted.into());
        }

        let timeout_secs = slice_timeout_secs(job.size());
        debug!(
            "执行分片 {:?} {}: bytes={}-{}, timeout={}s",
            job.direction, job.remote_uri, job.start, job.end, timeout_secs
        );

        match job.direction {
            Direction::Download => self.download(job, cancel, timeout_secs, flow).await,
            Direction::Upload => {
                let data = payload.context("上传分片缺少数据")?;
                self.upload(job, data, cancel, timeout_secs, flow).await
            }
        }
    }

    async fn download<F>(
        &self,
        job: &SliceJob,
        cancel: &CancellationToken,
        timeout_secs: u64,
        flow: F,
    ) -> Result<SliceOutput>
    where
        F: Fn(u64) + Send + Sync,
    {
        // 远端回报的是本次请求的累计字节数，这里换算成增量
        let received = AtomicU64::new(0);
        let on_progress = |cumulative: u64| {
            let previous = received.swap(cumulative, Ordering::AcqRel);
            if cumulative > previous {
                flow(cumulative - previous);
            }
        };

        let data = guarded(
            self.remote
                .read_range(&job.remote_uri, job.start, job.end, &on_progress),
            cancel,
            Duration::from_secs(timeout_secs),
        )
        .await?;

        if data.len() as u64 != job.size() {
            return Err(RemoteError::LengthMismatch {
                expected: job.size(),
                actual: data.len() as u64,
            }
            .into());
        }

        Ok(SliceOutput::Downloaded(data))
    }

    async fn upload<F>(
        &self,
        job: &SliceJob,
        data: Vec<u8>,
        cancel: &CancellationToken,
        timeout_secs: u64,
        flow: F,
    ) -> Result<SliceOutput>
    where
        F: Fn(u64) + Send + Sync,
    {
        if data.len() as u64 != job.size() {
            anyhow::bail!(
                "上传分片数据长度错误: 期望 {} 字节，实际 {} 字节",
                job.size(),
                data.len()
            );
        }

        // 发送之前计算哈希，数据随后移交给远端
        let expected = content_hash(&data);

        let ack = guarded(
            self.remote
                .write_range(&job.remote_uri, data, job.start, job.end, job.total_size),
            cancel,
            Duration::from_secs(timeout_secs),
        )
        .await?;

        if !ack.content_hash.eq_ignore_ascii_case(&expected) {
            return Err(TransferError::Integrity {
                range: job.range(),
                expected,
                actual: ack.content_hash,
            }
            .into());
        }

        flow(job.size());
        Ok(SliceOutput::Uploaded {
            content_hash: expected,
        })
    }
}
