//! 远端文件端点
//!
//! 传输核心只依赖 [`RemoteEndpoint`] 定义的四个原语：
//! `stat` / `read_range` / `write_range` / `write_empty`。

pub mod http;
pub mod memory;

pub use http::HttpRemote;
pub use memory::MemoryRemote;

use crate::transfer::error::TransferError;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// 远端文件元信息
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteStat {
    /// 文件大小（字节）
    pub size: u64,
}

/// 分片写入确认
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteAck {
    /// 远端对收到内容计算的 MD5（十六进制）
    #[serde(rename = "md5")]
    pub content_hash: String,
}

/// 远端错误
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// 非成功状态码
    #[error("远端返回错误状态 {status}: {message}")]
    Status { status: u16, message: String },

    /// 返回数据长度与请求范围不符
    #[error("数据长度不符: 期望 {expected} 字节，实际 {actual} 字节")]
    LengthMismatch { expected: u64, actual: u64 },

    /// 远端文件不存在
    #[error("远端文件不存在: {0}")]
    NotFound(String),

    /// 响应格式错误
    #[error("响应格式错误: {0}")]
    Malformed(String),

    /// 连接中断
    #[error("连接中断: {0}")]
    Disconnected(String),
}

/// 远端端点
///
/// `read_range` 的进度回调参数为本次请求累计收到的字节数，
/// 由分片执行器换算成增量。
#[async_trait]
pub trait RemoteEndpoint: Send + Sync {
    /// 校验远端地址，不发起任何网络请求
    fn validate_uri(&self, uri: &str) -> Result<(), TransferError> {
        reqwest::Url::parse(uri)
            .map(|_| ())
            .map_err(|e| TransferError::InvalidUri(format!("{}: {}", uri, e)))
    }

    /// 查询远端文件大小
    async fn stat(&self, uri: &str) -> Result<RemoteStat>;

    /// 读取闭区间 `[start, end]` 的字节
    async fn read_range(
        &self,
        uri: &str,
        start: u64,
        end: u64,
        on_progress: &(dyn Fn(u64) + Send + Sync),
    ) -> Result<Vec<u8>>;

    /// 写入闭区间 `[start, end]` 的字节
    async fn write_range(
        &self,
        uri: &str,
        data: Vec<u8>,
        start: u64,
        end: u64,
        total_size: u64,
    ) -> Result<WriteAck>;

    /// 创建空文件
    async fn write_empty(&self, uri: &str) -> Result<()>;
}

/// 计算内容哈希（MD5 十六进制小写）
pub fn content_hash(data: &[u8]) -> String {
    hex::encode(md5::compute(data).0)
}
