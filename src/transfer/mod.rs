// 传输模块
//
// 单文件分片传输（上传/下载）、任务状态、事件和统一的传输管理器

pub mod error;
pub mod events;
pub mod fingerprint;
pub mod guard;
pub mod manager;
pub mod orchestrator;
pub mod slice;
pub mod task;
pub mod throttle;

pub use error::{classify_error, TransferError};
pub use events::{EventPriority, EventPublisher, TransferEvent};
pub use fingerprint::SourceFingerprint;
pub use manager::{ResumeState, TransferHandle, TransferManager};
pub use orchestrator::{part_path, TransferOutcome};
pub use slice::{SliceExecutor, SliceJob, SliceOutput};
pub use task::{Direction, ProgressSnapshot, TaskStatus, TransferTask};
pub use throttle::ProgressThrottler;
