// 远端请求保护
//
// 所有远端调用都在任务的取消令牌和超时下执行，取消时返回 Aborted。

use super::error::TransferError;
use anyhow::{Context, Result};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// 在取消令牌和超时的保护下执行远端请求
pub async fn guarded<T>(
    request: impl Future<Output = Result<T>>,
    cancel: &CancellationToken,
    timeout: Duration,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransferError::Aborted.into()),
        result = tokio::time::timeout(timeout, request) => {
            result.with_context(|| format!("远端请求超时 ({}s)", timeout.as_secs()))?
        }
    }
}
