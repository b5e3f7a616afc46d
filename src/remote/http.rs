// HTTP 远端端点
//
// 约定：
// - stat:        HEAD，读取 Content-Length
// - read_range:  GET + `Range: bytes=s-e`，流式接收
// - write_range: PUT + `Content-Range: bytes s-e/total`，响应 `{"md5": "<hex>"}`
// - write_empty: PUT 空请求体

use super::{RemoteEndpoint, RemoteError, RemoteStat, WriteAck};
use crate::transfer::error::TransferError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{header, Client, Response, StatusCode};
use std::time::Duration;
use tracing::debug;

/// 错误响应体最多保留的字符数
const ERROR_BODY_LIMIT: usize = 256;

/// 基于 reqwest 的远端端点
#[derive(Debug, Clone)]
pub struct HttpRemote {
    client: Client,
}

impl HttpRemote {
    /// 创建 HTTP 端点
    ///
    /// 单次请求的超时由分片执行器按分片大小控制，这里只限制建立连接的时间
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("range-transfer/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(16)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true)
            .build()
            .context("创建 HTTP 客户端失败")?;

        Ok(Self::with_client(client))
    }

    /// 使用已有的客户端
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

/// 检查响应状态，失败时转换为 RemoteError
async fn check_status(resp: Response, uri: &str) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(RemoteError::NotFound(uri.to_string()).into());
    }

    let mut message = resp.text().await.unwrap_or_default();
    if message.len() > ERROR_BODY_LIMIT {
        let mut cut = ERROR_BODY_LIMIT;
        while !message.is_char_boundary(cut) {
            cut -= 1;
        }
        message.truncate(cut);
    }

    Err(RemoteError::Status {
        status: status.as_u16(),
        message,
    }
    .into())
}

/// 解析 `Content-Range: bytes s-e/total`
fn parse_content_range(value: &str) -> Option<(u64, u64)> {
    let range = value.trim().strip_prefix("bytes")?.trim_start();
    let (span, _total) = range.split_once('/')?;
    let (start, end) = span.split_once('-')?;
    Some((start.trim().parse().ok()?, end.trim().parse().ok()?))
}

#[async_trait]
impl RemoteEndpoint for HttpRemote {
    fn validate_uri(&self, uri: &str) -> Result<(), TransferError> {
        let url = reqwest::Url::parse(uri)
            .map_err(|e| TransferError::InvalidUri(format!("{}: {}", uri, e)))?;

        match url.scheme() {
            "http" | "https" if url.host_str().is_some() => Ok(()),
            scheme => Err(TransferError::InvalidUri(format!(
                "{}: 不支持的协议或缺少主机 ({})",
                uri, scheme
            ))),
        }
    }

    async fn stat(&self, uri: &str) -> Result<RemoteStat> {
        let resp = self
            .client
            .head(uri)
            .send()
            .await
            .context("发送 HEAD 请求失败")?;
        let resp = check_status(resp, uri).await?;

        let size = resp
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| RemoteError::Malformed("响应缺少 Content-Length".to_string()))?;

        debug!("远端文件大小: {} -> {} bytes", uri, size);
        Ok(RemoteStat { size })
    }

    async fn read_range(
        &self,
        uri: &str,
        start: u64,
        end: u64,
        on_progress: &(dyn Fn(u64) + Send + Sync),
    ) -> Result<Vec<u8>> {
        let expected = end - start + 1;

        let resp = self
            .client
            .get(uri)
            .header(header::RANGE, format!("bytes={}-{}", start, end))
            .send()
            .await
            .context("发送 Range 请求失败")?;
        let resp = check_status(resp, uri).await?;

        if resp.status() == StatusCode::PARTIAL_CONTENT {
            let window = resp
                .headers()
                .get(header::CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range);
            match window {
                Some((s, e)) if s == start && e == end => {}
                Some((s, e)) => {
                    return Err(RemoteError::Malformed(format!(
                        "返回范围 {}-{} 与请求范围 {}-{} 不符",
                        s, e, start, end
                    ))
                    .into())
                }
                None => {
                    return Err(RemoteError::Malformed(
                        "206 响应缺少有效的 Content-Range".to_string(),
                    )
                    .into())
                }
            }
        } else if start != 0 {
            // 服务端忽略 Range 时只有从 0 开始的请求还能按长度截断使用
            return Err(RemoteError::Malformed(format!(
                "服务端不支持 Range 请求，状态码 {}",
                resp.status()
            ))
            .into());
        }

        let mut buffer = Vec::with_capacity(expected as usize);
        let mut stream = resp.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("读取数据流失败")?;
            let remaining = expected as usize - buffer.len();
            if chunk.len() >= remaining {
                buffer.extend_from_slice(&chunk[..remaining]);
                on_progress(buffer.len() as u64);
                break;
            }
            buffer.extend_from_slice(&chunk);
            on_progress(buffer.len() as u64);
        }

        if buffer.len() as u64 != expected {
            return Err(RemoteError::LengthMismatch {
                expected,
                actual: buffer.len() as u64,
            }
            .into());
        }

        Ok(buffer)
    }

    async fn write_range(
        &self,
        uri: &str,
        data: Vec<u8>,
        start: u64,
        end: u64,
        total_size: u64,
    ) -> Result<WriteAck> {
        let resp = self
            .client
            .put(uri)
            .header(
                header::CONTENT_RANGE,
                format!("bytes {}-{}/{}", start, end, total_size),
            )
            .body(data)
            .send()
            .await
            .context("发送分片上传请求失败")?;
        let resp = check_status(resp, uri).await?;

        let body = resp.bytes().await.context("读取上传响应失败")?;
        let ack: WriteAck = serde_json::from_slice(&body)
            .map_err(|e| RemoteError::Malformed(format!("上传响应解析失败: {}", e)))?;

        Ok(ack)
    }

    async fn write_empty(&self, uri: &str) -> Result<()> {
        let resp = self
            .client
            .put(uri)
            .body(Vec::<u8>::new())
            .send()
            .await
            .context("创建空文件请求失败")?;
        check_status(resp, uri).await?;
        Ok(())
    }
}
