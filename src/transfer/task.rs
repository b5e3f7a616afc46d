// 传输任务定义
//
// 上传、下载共用同一个任务结构，方向由 Direction 区分

use crate::range::{sum_size, ByteRange, RangeSet};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// 传输方向
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// 本地 → 远端
    Upload,
    /// 远端 → 本地
    Download,
}

/// 任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// 等待调度
    Wait,
    /// 传输中
    Run,
    /// 已暂停
    Pause,
    /// 已完成
    Success,
    /// 失败
    Fail,
}

impl TaskStatus {
    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Fail)
    }
}

/// 进度快照
///
/// 由编排器在每个分片完成后生成，台账只读取快照，不直接修改任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// 已确认完成的字节数
    pub loaded: u64,
    /// 文件总大小
    pub total_size: u64,
    /// 剩余范围
    pub missing_ranges: RangeSet,
    /// 平均速度 (bytes/s)
    pub speed: u64,
    /// 预计剩余时间（秒），None 表示无法估算
    pub eta: Option<u64>,
    /// 文件级重试次数
    pub retries: u32,
}

impl ProgressSnapshot {
    /// 进度百分比
    pub fn percent(&self) -> f64 {
        if self.total_size == 0 {
            return 100.0;
        }
        (self.loaded as f64 / self.total_size as f64) * 100.0
    }

    /// 剩余字节数
    pub fn missing_bytes(&self) -> u64 {
        sum_size(&self.missing_ranges)
    }
}

/// 传输任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferTask {
    /// 任务ID
    pub id: String,
    /// 传输方向
    pub direction: Direction,
    /// 任务状态
    pub status: TaskStatus,
    /// 远端地址
    pub remote_uri: String,
    /// 本地路径（上传为源文件，下载为目标文件）
    pub local_path: PathBuf,
    /// 文件大小，首次 stat 之前未知
    pub total_size: Option<u64>,
    /// 已确认完成的字节数
    pub loaded: u64,
    /// 剩余范围，编排器确定之前为 None
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing_ranges: Option<RangeSet>,
    /// 传输速度 (bytes/s)
    pub speed: u64,
    /// 预计剩余时间（秒）
    pub eta: Option<u64>,
    /// 文件级重试次数
    #[serde(default)]
    pub retries: u32,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
    /// 开始时间 (Unix timestamp)
    pub started_at: Option<i64>,
    /// 完成时间 (Unix timestamp)
    pub completed_at: Option<i64>,
    /// 失败原因
    pub fail_reason: Option<String>,
}

impl TransferTask {
    pub fn new(
        direction: Direction,
        remote_uri: String,
        local_path: PathBuf,
        total_size: Option<u64>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            direction,
            status: TaskStatus::Wait,
            remote_uri,
            local_path,
            total_size,
            loaded: 0,
            missing_ranges: None,
            speed: 0,
            eta: None,
            retries: 0,
            created_at: chrono::Utc::now().timestamp(),
            started_at: None,
            completed_at: None,
            fail_reason: None,
        }
    }

    /// 计算进度百分比
    pub fn progress(&self) -> f64 {
        match self.total_size {
            Some(0) if self.status == TaskStatus::Success => 100.0,
            Some(total) if total > 0 => (self.loaded as f64 / total as f64) * 100.0,
            _ => 0.0,
        }
    }

    /// 应用进度快照
    pub fn apply_progress(&mut self, snapshot: &ProgressSnapshot) {
        self.total_size = Some(snapshot.total_size);
        self.loaded = snapshot.loaded;
        self.missing_ranges = Some(snapshot.missing_ranges.clone());
        self.speed = snapshot.speed;
        self.eta = snapshot.eta;
        self.retries = snapshot.retries;
    }

    /// 标记为等待调度
    pub fn mark_waiting(&mut self) {
        self.status = TaskStatus::Wait;
        self.fail_reason = None;
    }

    /// 标记为传输中
    pub fn mark_running(&mut self) {
        self.status = TaskStatus::Run;
        if self.started_at.is_none() {
            self.started_at = Some(chrono::Utc::now().timestamp());
        }
    }

    /// 标记为暂停，保留剩余范围用于恢复
    pub fn mark_paused(&mut self, missing_ranges: Option<RangeSet>) {
        self.status = TaskStatus::Pause;
        self.speed = 0;
        self.eta = None;
        if missing_ranges.is_some() {
            self.missing_ranges = missing_ranges;
        }
    }

    /// 标记为已完成
    pub fn mark_succeeded(&mut self) {
        self.status = TaskStatus::Success;
        self.completed_at = Some(chrono::Utc::now().timestamp());
        self.loaded = self.total_size.unwrap_or(self.loaded);
        self.missing_ranges = Some(Vec::new());
        self.speed = 0;
        self.eta = Some(0);
    }

    /// 标记为失败
    pub fn mark_failed(&mut self, reason: String) {
        self.status = TaskStatus::Fail;
        self.fail_reason = Some(reason);
        self.speed = 0;
        self.eta = None;
    }

    /// 剩余范围中是否包含指定分片
    pub fn is_missing(&self, range: &ByteRange) -> bool {
        self.missing_ranges
            .as_ref()
            .map(|ranges| ranges.iter().any(|r| r.covers(range)))
            .unwrap_or(true)
    }
}
