use clap::{Parser, Subcommand};
use range_transfer::{
    config::{AppConfig, LogConfig}, logging, transfer::EventPriority, HttpRemote, ResumeState, TransferEvent,
    TransferHandle, TransferManager, TransferOutcome,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const CONFIG_PATH: &str = "config/app.toml";

/// 可续传的分片文件传输工具
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 上传本地文件
    Upload {
        /// 本地文件
        local: PathBuf,
        /// 远端地址
        uri: String,
    },
    /// 下载远端文件
    Download {
        /// 远端地址
        uri: String,
        /// 本地文件
        local: PathBuf,
        /// 已知的文件大小，省略时向远端查询
        #[arg(long)]
        size: Option<u64>,
    },
    /// 从续传记录继续中断的任务
    Resume {
        /// 续传记录文件（<本地文件>.resume.json）
        state_file: PathBuf,
    },
}

/// 续传记录文件: `<本地文件>.resume.json`
fn state_path(local: &Path) -> PathBuf {
    let mut name = local.as_os_str().to_os_string();
    name.push(".resume.json");
    PathBuf::from(name)
}

async fn start(manager: &TransferManager, command: Command) -> anyhow::Result<TransferHandle> {
    match command {
        Command::Upload { local, uri } => manager.upload(&local, &uri).await,
        Command::Download { uri, local, size } => manager.download(&uri, &local, size).await,
        Command::Resume { state_file } => {
            let content = tokio::fs::read_to_string(&state_file).await?;
            let state: ResumeState = serde_json::from_str(&content)?;
            let task_id = manager.restore(state)?;
            manager.resume(&task_id).await
        }
    }
}

/// 打印事件流
fn spawn_event_logger(manager: &TransferManager) {
    let mut rx = manager.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match &event {
                TransferEvent::Progress { task_id, snapshot } => info!(
                    "[{}] {:.1}% ({}/{} bytes), 速度 {} B/s, 剩余 {}",
                    task_id,
                    snapshot.percent(),
                    snapshot.loaded,
                    snapshot.total_size,
                    snapshot.speed,
                    snapshot
                        .eta
                        .map(|s| format!("{}s", s))
                        .unwrap_or_else(|| "未知".to_string())
                ),
                other if other.priority() >= EventPriority::Medium => {
                    info!("[{}] 事件: {}", other.task_id(), other.event_type_name())
                }
                other => debug!("[{}] 事件: {}", other.task_id(), other.event_type_name()),
            }
        }
    });
}

/// 加载日志配置
///
/// 日志系统初始化之前只读取 [log] 部分，失败时使用默认配置
async fn load_log_config(path: &str) -> LogConfig {
    AppConfig::load_from_file(path)
        .await
        .map(|config| config.log)
        .unwrap_or_default()
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // 🔥 初始化日志系统（必须保持 _log_guard 存活）
    let _log_guard = logging::init_logging(&load_log_config(CONFIG_PATH).await);

    info!("Range Transfer v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load_or_default(CONFIG_PATH).await;
    config.transfer.validate()?;

    let remote = Arc::new(HttpRemote::new()?);
    let manager = TransferManager::new(remote, &config);
    spawn_event_logger(&manager);

    let handle = start(&manager, cli.command).await?;
    let task_id = handle.task_id().to_string();

    // 🔥 使用 select! 监听关闭信号，中断时保存续传记录
    let outcome = tokio::select! {
        outcome = handle.finished() => outcome,
        _ = tokio::signal::ctrl_c() => {
            info!("收到 Ctrl+C，暂停任务...");
            manager.pause(&task_id).await?;
            TransferOutcome::Aborted { missing_ranges: None }
        }
    };

    match outcome {
        TransferOutcome::Succeeded => info!("✓ 任务完成: {}", task_id),
        TransferOutcome::Failed(e) => {
            error!("任务失败: {}, 原因: {}", task_id, e);
            manager.shutdown().await;
            return Ok(ExitCode::FAILURE);
        }
        TransferOutcome::Aborted { .. } => match manager.resume_state(&task_id) {
            Some(state) => {
                let path = state_path(&state.local_path);
                let json = serde_json::to_string_pretty(&state)?;
                tokio::fs::write(&path, json).await?;
                info!("续传记录已保存: {:?}", path);
            }
            None => warn!("任务尚未确定文件大小，无法保存续传记录: {}", task_id),
        },
    }

    manager.shutdown().await;
    info!("应用已安全退出");
    Ok(ExitCode::SUCCESS)
}
