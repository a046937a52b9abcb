use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::core::{Result, TransferConfig};

/// 默认分片大小 10MB
pub const DEFAULT_BLOCK_SIZE: u64 = 10 * 1024 * 1024;

// 用于序列化 Duration（毫秒）
fn serialize_duration<S>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let millis = u64::deserialize(deserializer)?;
    Ok(Duration::from_millis(millis))
}

/// 上传配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UploadConfig {
    /// 预读分片数
    pub parallel: usize,
    /// 分片大小
    pub block_size: u64,
    /// 上传限速（字节/秒）
    pub max_upload_rate: Option<u64>,
    /// 是否启用秒传
    pub rapid_upload: bool,
    /// 覆盖同名文件（旧文件移到回收站）
    pub overwrite: bool,
    /// 跳过同名文件，不比较内容
    pub skip_same_name: bool,
    pub show_progress: bool,
    /// 断点记录文件
    pub checkpoint_file: Option<PathBuf>,
    #[serde(serialize_with = "serialize_duration", deserialize_with = "deserialize_duration")]
    pub progress_interval: Duration,
    /// 断点记录最短落盘间隔
    #[serde(serialize_with = "serialize_duration", deserialize_with = "deserialize_duration")]
    pub checkpoint_interval: Duration,
    /// 单个任务最多重试次数
    pub max_retries: u32,
    /// 单次运行内最多修正分片乱序的次数
    pub max_amend_attempts: u32,
    /// 单次运行内最多重建上传会话的次数
    pub max_session_restarts: u32,
    /// 检测目录之后的等待，避免触发限流
    #[serde(serialize_with = "serialize_duration", deserialize_with = "deserialize_duration")]
    pub folder_check_delay: Duration,
    #[serde(serialize_with = "serialize_duration", deserialize_with = "deserialize_duration")]
    pub post_prepare_delay: Duration,
    /// 删除旧文件之后的等待
    #[serde(serialize_with = "serialize_duration", deserialize_with = "deserialize_duration")]
    pub delete_settle_delay: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            parallel: 1,
            block_size: DEFAULT_BLOCK_SIZE,
            max_upload_rate: None,
            rapid_upload: true,
            overwrite: false,
            skip_same_name: false,
            show_progress: true,
            checkpoint_file: None,
            progress_interval: Duration::from_secs(1),
            checkpoint_interval: Duration::from_secs(3),
            max_retries: 3,
            max_amend_attempts: 3,
            max_session_restarts: 3,
            folder_check_delay: Duration::from_secs(1),
            post_prepare_delay: Duration::from_secs(2),
            delete_settle_delay: Duration::from_millis(500),
        }
    }
}

impl UploadConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// 不做任何限流等待，测试用
    pub fn without_delays(mut self) -> Self {
        self.folder_check_delay = Duration::ZERO;
        self.post_prepare_delay = Duration::ZERO;
        self.delete_settle_delay = Duration::ZERO;
        self
    }

    pub fn task_options(&self) -> TaskOptions {
        TaskOptions {
            parallel: self.parallel.max(1),
            block_size: self.block_size.max(1),
            max_upload_rate: self.max_upload_rate,
            rapid_upload: self.rapid_upload,
            overwrite: self.overwrite,
            skip_same_name: self.skip_same_name,
            show_progress: self.show_progress,
        }
    }

    /// 传输引擎配置：预读深度和限速取任务自己的选项，上报间隔取全局配置
    pub fn transfer_config(&self, options: &TaskOptions, block_size: u64) -> TransferConfig {
        TransferConfig {
            parallel: options.parallel.max(1),
            block_size,
            max_rate: options.max_upload_rate,
            progress_interval: self.progress_interval,
            checkpoint_interval: self.checkpoint_interval,
        }
    }
}

/// 单个任务的选项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOptions {
    pub parallel: usize,
    pub block_size: u64,
    pub max_upload_rate: Option<u64>,
    pub rapid_upload: bool,
    pub overwrite: bool,
    pub skip_same_name: bool,
    pub show_progress: bool,
}

impl Default for TaskOptions {
    fn default() -> Self {
        UploadConfig::default().task_options()
    }
}
