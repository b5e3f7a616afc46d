// 传输台账
//
// 所有任务的可观测记录。台账只消费事件，不参与调度，
// 对未知任务的写入直接忽略（任务可能已被删除）。

use crate::transfer::events::TransferEvent;
use crate::transfer::task::{ProgressSnapshot, TransferTask};
use crate::range::RangeSet;
use dashmap::DashMap;
use tracing::debug;

/// 传输台账
#[derive(Debug, Default)]
pub struct TransferLedger {
    tasks: DashMap<String, TransferTask>,
}

impl TransferLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// 应用一个事件
    pub fn apply(&self, event: &TransferEvent) {
        match event {
            TransferEvent::Created { task } => self.add(task.as_ref().clone()),
            TransferEvent::Queued { task_id } => self.set_waiting(task_id),
            TransferEvent::Running { task_id } => self.set_running(task_id),
            TransferEvent::Progress { task_id, snapshot } => {
                self.update_progress(task_id, snapshot)
            }
            TransferEvent::Paused {
                task_id,
                missing_ranges,
            } => self.set_paused(task_id, missing_ranges.clone()),
            TransferEvent::Succeeded {
                task_id,
                completed_at,
            } => self.set_succeeded(task_id, *completed_at),
            TransferEvent::Failed { task_id, error } => self.set_failed(task_id, error),
            TransferEvent::Removed { task_id } => self.remove(task_id),
        }
    }

    pub fn add(&self, task: TransferTask) {
        debug!("台账登记任务: {}", task.id);
        self.tasks.insert(task.id.clone(), task);
    }

    pub fn update_progress(&self, task_id: &str, snapshot: &ProgressSnapshot) {
        self.modify(task_id, |task| task.apply_progress(snapshot));
    }

    pub fn set_waiting(&self, task_id: &str) {
        self.modify(task_id, TransferTask::mark_waiting);
    }

    pub fn set_running(&self, task_id: &str) {
        self.modify(task_id, TransferTask::mark_running);
    }

    pub fn set_paused(&self, task_id: &str, missing_ranges: Option<RangeSet>) {
        self.modify(task_id, |task| task.mark_paused(missing_ranges));
    }

    pub fn set_succeeded(&self, task_id: &str, completed_at: i64) {
        self.modify(task_id, |task| {
            task.mark_succeeded();
            task.completed_at = Some(completed_at);
        });
    }

    pub fn set_failed(&self, task_id: &str, reason: &str) {
        self.modify(task_id, |task| task.mark_failed(reason.to_string()));
    }

    pub fn remove(&self, task_id: &str) {
        if self.tasks.remove(task_id).is_some() {
            debug!("台账移除任务: {}", task_id);
        }
    }

    pub fn get(&self, task_id: &str) -> Option<TransferTask> {
        self.tasks.get(task_id).map(|t| t.value().clone())
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.tasks.contains_key(task_id)
    }

    /// 所有任务，按创建时间排序
    pub fn list(&self) -> Vec<TransferTask> {
        let mut tasks: Vec<TransferTask> = self.tasks.iter().map(|t| t.value().clone()).collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    fn modify(&self, task_id: &str, f: impl FnOnce(&mut TransferTask)) {
        if let Some(mut task) = self.tasks.get_mut(task_id) {
            f(task.value_mut());
        }
    }
}
