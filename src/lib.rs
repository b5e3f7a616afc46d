// Range Transfer Library
// 可续传的分片文件传输核心库

// 配置管理模块
pub mod config;

// 日志模块
pub mod logging;

// 字节范围
pub mod range;

// 速度统计
pub mod speed;

// 远端存储接口
pub mod remote;

// 跨任务调度
pub mod scheduler;

// 任务台账
pub mod ledger;

// 传输模块
pub mod transfer;

// 导出常用类型
pub use config::AppConfig;
pub use ledger::TransferLedger;
pub use range::{ByteRange, RangeSet};
pub use remote::{HttpRemote, MemoryRemote, RemoteEndpoint};
pub use scheduler::TaskScheduler;
pub use speed::SpeedCounter;
pub use transfer::{
    Direction, ResumeState, TaskStatus, TransferError, TransferEvent, TransferHandle,
    TransferManager, TransferOutcome, TransferTask,
};
