// 内存远端端点
//
// 进程内的远端实现，支持故障注入和请求记录，用于测试与本地演示

use super::{content_hash, RemoteEndpoint, RemoteError, RemoteStat, WriteAck};
use crate::range::ByteRange;
use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// 内存远端
#[derive(Debug, Default)]
pub struct MemoryRemote {
    objects: DashMap<String, Vec<u8>>,
    /// 接下来 N 次读取失败
    fail_reads: AtomicU32,
    /// 接下来 N 次写入失败
    fail_writes: AtomicU32,
    /// 接下来 N 次 stat 失败
    fail_stats: AtomicU32,
    /// 接下来 N 次写入返回错误的哈希
    corrupt_hashes: AtomicU32,
    /// 每次读写的延迟（毫秒）
    latency_ms: AtomicU64,
    read_log: Mutex<Vec<ByteRange>>,
    write_log: Mutex<Vec<ByteRange>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: AtomicUsize,
}

/// 在途请求计数守卫，请求被取消时同样会递减
struct InFlight {
    counter: Arc<AtomicUsize>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// 消耗一次故障配额
fn take_fault(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置每次读写的模拟延迟
    pub fn with_latency(self, latency: Duration) -> Self {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
        self
    }

    /// 放入一个远端文件
    pub fn insert(&self, uri: &str, data: Vec<u8>) {
        self.objects.insert(uri.to_string(), data);
    }

    /// 读取远端文件内容
    pub fn get(&self, uri: &str) -> Option<Vec<u8>> {
        self.objects.get(uri).map(|entry| entry.value().clone())
    }

    pub fn fail_next_reads(&self, count: u32) {
        self.fail_reads.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_writes(&self, count: u32) {
        self.fail_writes.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_stats(&self, count: u32) {
        self.fail_stats.store(count, Ordering::SeqCst);
    }

    /// 接下来 N 次写入返回与内容不符的哈希
    pub fn corrupt_next_hashes(&self, count: u32) {
        self.corrupt_hashes.store(count, Ordering::SeqCst);
    }

    /// 所有成功发起的读取范围（按请求顺序）
    pub fn read_ranges(&self) -> Vec<ByteRange> {
        self.read_log.lock().clone()
    }

    /// 所有成功发起的写入范围（按请求顺序）
    pub fn write_ranges(&self) -> Vec<ByteRange> {
        self.write_log.lock().clone()
    }

    /// 观测到的最大在途请求数
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn enter(&self) -> InFlight {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        InFlight {
            counter: self.in_flight.clone(),
        }
    }

    async fn simulate_latency(&self) {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
    }
}

#[async_trait]
impl RemoteEndpoint for MemoryRemote {
    async fn stat(&self, uri: &str) -> Result<RemoteStat> {
        if take_fault(&self.fail_stats) {
            return Err(RemoteError::Disconnected("注入的 stat 故障".to_string()).into());
        }
        let size = self
            .objects
            .get(uri)
            .map(|entry| entry.len() as u64)
            .ok_or_else(|| RemoteError::NotFound(uri.to_string()))?;
        Ok(RemoteStat { size })
    }

    async fn read_range(
        &self,
        uri: &str,
        start: u64,
        end: u64,
        on_progress: &(dyn Fn(u64) + Send + Sync),
    ) -> Result<Vec<u8>> {
        let _guard = self.enter();
        self.read_log.lock().push(ByteRange::new(start, end));

        if take_fault(&self.fail_reads) {
            self.simulate_latency().await;
            return Err(RemoteError::Disconnected("注入的读取故障".to_string()).into());
        }

        let data = {
            let object = self
                .objects
                .get(uri)
                .ok_or_else(|| RemoteError::NotFound(uri.to_string()))?;
            if end >= object.len() as u64 {
                return Err(RemoteError::Status {
                    status: 416,
                    message: format!("范围 {}-{} 超出文件大小 {}", start, end, object.len()),
                }
                .into());
            }
            object[start as usize..=end as usize].to_vec()
        };

        // 分两段回报进度，模拟流式接收
        let half = data.len() as u64 / 2;
        if half > 0 {
            on_progress(half);
        }
        self.simulate_latency().await;
        on_progress(data.len() as u64);

        Ok(data)
    }

    async fn write_range(
        &self,
        uri: &str,
        data: Vec<u8>,
        start: u64,
        end: u64,
        total_size: u64,
    ) -> Result<WriteAck> {
        let _guard = self.enter();
        self.write_log.lock().push(ByteRange::new(start, end));
        self.simulate_latency().await;

        if take_fault(&self.fail_writes) {
            return Err(RemoteError::Disconnected("注入的写入故障".to_string()).into());
        }
        if data.len() as u64 != end - start + 1 {
            return Err(RemoteError::LengthMismatch {
                expected: end - start + 1,
                actual: data.len() as u64,
            }
            .into());
        }

        let hash = content_hash(&data);
        {
            let mut object = self.objects.entry(uri.to_string()).or_default();
            if object.len() as u64 != total_size {
                object.resize(total_size as usize, 0);
            }
            object[start as usize..=end as usize].copy_from_slice(&data);
        }

        let content_hash = if take_fault(&self.corrupt_hashes) {
            hash.chars().rev().collect()
        } else {
            hash
        };
        Ok(WriteAck { content_hash })
    }

    async fn write_empty(&self, uri: &str) -> Result<()> {
        if take_fault(&self.fail_writes) {
            return Err(RemoteError::Disconnected("注入的写入故障".to_string()).into());
        }
        self.objects.insert(uri.to_string(), Vec::new());
        Ok(())
    }
}
