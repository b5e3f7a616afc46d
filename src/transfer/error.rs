// 传输错误分类
//
// 分片执行器只抛出原始错误，编排器是唯一的分类者，也是唯一决定重试的地方

use crate::range::ByteRange;
use crate::remote::RemoteError;

/// 传输错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    /// 取消令牌已触发
    #[error("传输已中止")]
    Aborted,

    /// 可重试的网络错误（连接重置、超时、5xx 等）
    #[error("网络错误: {0}")]
    Network(String),

    /// 上传分片哈希不一致
    #[error("分片 {range} 校验失败: 本地 {expected}, 远端 {actual}")]
    Integrity {
        range: ByteRange,
        expected: String,
        actual: String,
    },

    /// 文件大小与记录不一致
    #[error("文件大小已变化: 期望 {expected} 字节，实际 {actual} 字节")]
    SizeChanged { expected: u64, actual: u64 },

    /// 上传源文件在暂停期间被修改
    #[error("源文件内容已变化，无法续传")]
    SourceChanged,

    /// 远端地址非法
    #[error("无效的远端地址: {0}")]
    InvalidUri(String),

    /// 本地文件读写失败
    #[error("本地文件错误: {0}")]
    Io(String),

    /// 其他无法归类的错误
    #[error("{0}")]
    Other(String),
}

impl TransferError {
    /// 是否可重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransferError::Network(_))
    }
}

/// 对原始错误进行分类
///
/// 依次检查错误链上的已知类型，都不匹配时按错误信息判断是否像网络错误。
pub fn classify_error(error: &anyhow::Error) -> TransferError {
    for cause in error.chain() {
        if let Some(e) = cause.downcast_ref::<TransferError>() {
            return e.clone();
        }
        if let Some(e) = cause.downcast_ref::<RemoteError>() {
            return classify_remote_error(e, error);
        }
        if let Some(e) = cause.downcast_ref::<reqwest::Error>() {
            return classify_reqwest_error(e, error);
        }
        if cause.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
            return TransferError::Network(format!("{:#}", error));
        }
        if let Some(e) = cause.downcast_ref::<std::io::Error>() {
            return classify_io_error(e, error);
        }
    }

    classify_by_message(error)
}

fn classify_remote_error(e: &RemoteError, error: &anyhow::Error) -> TransferError {
    let message = format!("{:#}", error);
    match e {
        RemoteError::Status { status, .. } if is_transient_status(*status) => {
            TransferError::Network(message)
        }
        RemoteError::Status { .. } => TransferError::Other(message),
        RemoteError::LengthMismatch { .. } | RemoteError::Disconnected(_) => {
            TransferError::Network(message)
        }
        RemoteError::NotFound(_) | RemoteError::Malformed(_) => TransferError::Other(message),
    }
}

fn classify_reqwest_error(e: &reqwest::Error, error: &anyhow::Error) -> TransferError {
    let message = format!("{:#}", error);
    if let Some(status) = e.status() {
        return if is_transient_status(status.as_u16()) {
            TransferError::Network(message)
        } else {
            TransferError::Other(message)
        };
    }
    if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
        TransferError::Network(message)
    } else {
        classify_by_message(error)
    }
}

fn classify_io_error(e: &std::io::Error, error: &anyhow::Error) -> TransferError {
    use std::io::ErrorKind;

    let message = format!("{:#}", error);
    match e.kind() {
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::ConnectionRefused
        | ErrorKind::NotConnected
        | ErrorKind::BrokenPipe
        | ErrorKind::TimedOut => TransferError::Network(message),
        _ => TransferError::Io(message),
    }
}

/// 408 / 429 / 5xx 视为临时错误
fn is_transient_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..600).contains(&status)
}

fn classify_by_message(error: &anyhow::Error) -> TransferError {
    let message = format!("{:#}", error);
    let lower = message.to_lowercase();

    let looks_like_network = [
        "timeout",
        "timed out",
        "connection",
        "network",
        "dns",
        "reset",
        "broken pipe",
    ]
    .iter()
    .any(|keyword| lower.contains(keyword));

    if looks_like_network {
        TransferError::Network(message)
    } else {
        TransferError::Other(message)
    }
}
