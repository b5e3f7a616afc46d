// 配置管理模块

use crate::range::DEFAULT_SLICE_SIZE;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 传输配置
    #[serde(default)]
    pub transfer: TransferConfig,
    /// 速度统计配置
    #[serde(default)]
    pub speed: SpeedConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 传输配置
///
/// 两层并发上限相互独立：
/// - `max_concurrent_tasks` 限制同时传输的文件数
/// - `slice_concurrency` 限制单个文件内同时传输的分片数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// 分片大小（字节），默认 1MB
    #[serde(default = "default_slice_size")]
    pub slice_size: u64,
    /// 单文件最大并发分片数，默认 5
    #[serde(default = "default_slice_concurrency")]
    pub slice_concurrency: usize,
    /// 最大同时传输文件数，默认 1（文件串行、分片并行）
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// 可重试错误的固定退避时间（毫秒），默认 500
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// 进度事件最小发布间隔（毫秒），默认 200
    #[serde(default = "default_progress_throttle_ms")]
    pub progress_throttle_ms: u64,
}

fn default_slice_size() -> u64 {
    DEFAULT_SLICE_SIZE
}

fn default_slice_concurrency() -> usize {
    5
}

fn default_max_concurrent_tasks() -> usize {
    1
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_progress_throttle_ms() -> u64 {
    200
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            slice_size: default_slice_size(),
            slice_concurrency: default_slice_concurrency(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            retry_backoff_ms: default_retry_backoff_ms(),
            progress_throttle_ms: default_progress_throttle_ms(),
        }
    }
}

impl TransferConfig {
    /// 退避时间
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// 验证配置合法性
    pub fn validate(&self) -> Result<()> {
        if self.slice_size == 0 {
            anyhow::bail!("分片大小必须大于 0");
        }
        if self.slice_concurrency == 0 {
            anyhow::bail!("单文件并发分片数必须大于 0");
        }
        if self.max_concurrent_tasks == 0 {
            anyhow::bail!("最大同时传输文件数必须大于 0");
        }
        Ok(())
    }
}

/// 速度统计配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeedConfig {
    /// 采样间隔（毫秒），默认 500
    #[serde(default = "default_speed_interval_ms")]
    pub interval_ms: u64,
    /// 历史采样数，默认 10
    #[serde(default = "default_speed_history_size")]
    pub history_size: usize,
}

fn default_speed_interval_ms() -> u64 {
    500
}

fn default_speed_history_size() -> usize {
    10
}

impl Default for SpeedConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_speed_interval_ms(),
            history_size: default_speed_history_size(),
        }
    }
}

impl SpeedConfig {
    /// 采样间隔
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config
            .transfer
            .validate()
            .context("配置文件中的传输参数验证失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.transfer
            .validate()
            .context("保存配置失败：传输参数不合法")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);
        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {}", e);
                let default_config = Self::default();

                // 尝试保存默认配置
                if let Err(e) = default_config.save_to_file(path).await {
                    tracing::error!("保存默认配置失败: {}", e);
                }

                default_config
            }
        }
    }
}
