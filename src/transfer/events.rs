//! 传输事件
//!
//! 编排器和管理器只通过事件报告状态：事件先同步写入台账，再广播给订阅者。

use super::task::{ProgressSnapshot, TransferTask};
use crate::ledger::TransferLedger;
use crate::range::RangeSet;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// 广播通道容量
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// 事件优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventPriority {
    /// 进度更新
    Low = 0,
    /// 状态变更
    Medium = 1,
    /// 完成、失败、删除
    High = 2,
}

/// 传输事件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum TransferEvent {
    /// 任务登记
    Created { task: Box<TransferTask> },
    /// 进入等待队列
    Queued { task_id: String },
    /// 开始传输
    Running { task_id: String },
    /// 进度更新
    Progress {
        task_id: String,
        snapshot: ProgressSnapshot,
    },
    /// 已暂停，None 表示剩余范围沿用上一次记录
    Paused {
        task_id: String,
        missing_ranges: Option<RangeSet>,
    },
    /// 传输完成
    Succeeded { task_id: String, completed_at: i64 },
    /// 传输失败
    Failed { task_id: String, error: String },
    /// 任务删除
    Removed { task_id: String },
}

impl TransferEvent {
    pub fn task_id(&self) -> &str {
        match self {
            TransferEvent::Created { task } => &task.id,
            TransferEvent::Queued { task_id }
            | TransferEvent::Running { task_id }
            | TransferEvent::Progress { task_id, .. }
            | TransferEvent::Paused { task_id, .. }
            | TransferEvent::Succeeded { task_id, .. }
            | TransferEvent::Failed { task_id, .. }
            | TransferEvent::Removed { task_id } => task_id,
        }
    }

    pub fn priority(&self) -> EventPriority {
        match self {
            TransferEvent::Progress { .. } => EventPriority::Low,
            TransferEvent::Created { .. }
            | TransferEvent::Queued { .. }
            | TransferEvent::Running { .. }
            | TransferEvent::Paused { .. } => EventPriority::Medium,
            TransferEvent::Succeeded { .. }
            | TransferEvent::Failed { .. }
            | TransferEvent::Removed { .. } => EventPriority::High,
        }
    }

    pub fn event_type_name(&self) -> &'static str {
        match self {
            TransferEvent::Created { .. } => "created",
            TransferEvent::Queued { .. } => "queued",
            TransferEvent::Running { .. } => "running",
            TransferEvent::Progress { .. } => "progress",
            TransferEvent::Paused { .. } => "paused",
            TransferEvent::Succeeded { .. } => "succeeded",
            TransferEvent::Failed { .. } => "failed",
            TransferEvent::Removed { .. } => "removed",
        }
    }
}

/// 事件发布器
#[derive(Debug, Clone)]
pub struct EventPublisher {
    ledger: Arc<TransferLedger>,
    sender: broadcast::Sender<TransferEvent>,
}

impl EventPublisher {
    pub fn new(ledger: Arc<TransferLedger>) -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { ledger, sender }
    }

    /// 发布事件
    ///
    /// 没有订阅者时广播失败是正常情况，台账总会收到事件
    pub fn publish(&self, event: TransferEvent) {
        self.ledger.apply(&event);
        let _ = self.sender.send(event);
    }

    /// 订阅事件流
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.sender.subscribe()
    }

    pub fn ledger(&self) -> &Arc<TransferLedger> {
        &self.ledger
    }
}
