use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;
use crate::checkpoint::Checkpoint;
use super::errors::{Result, UploadError};

/// 上传任务唯一标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 本地文件指纹：路径 + 大小 + 修改时间，作为断点记录的索引
///
/// 相同指纹的两个文件被认为内容一致，这只是一个经验判断。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct LocalFileFingerprint {
    pub path: PathBuf,
    pub size: u64,
    pub mod_time: i64,
}

impl LocalFileFingerprint {
    pub fn key(&self) -> String {
        format!("{}|{}|{}", self.path.display(), self.size, self.mod_time)
    }
}

impl fmt::Display for LocalFileFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// 待上传的本地文件
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LocalFile {
    pub path: PathBuf,
    pub size: u64,
    /// 修改时间（Unix 秒）
    pub mod_time: i64,
    /// 已计算过的内容 SHA1
    pub content_hash: Option<String>,
    /// 上一次创建的上传会话
    pub session: Option<RemoteUploadSession>,
    pub parent_folder_id: Option<String>,
}

impl LocalFile {
    /// 读取文件元信息
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(UploadError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("not a regular file: {}", path.display()),
            )));
        }

        let mod_time = metadata
            .modified()
            .ok()
            .and_then(|time| time.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|elapsed| elapsed.as_secs() as i64)
            .unwrap_or_default();

        Ok(Self {
            path: path.to_path_buf(),
            size: metadata.len(),
            mod_time,
            content_hash: None,
            session: None,
            parent_folder_id: None,
        })
    }

    /// 确认文件仍然可读
    pub async fn ensure_readable(&self) -> Result<()> {
        let file = tokio::fs::File::open(&self.path).await?;
        drop(file);
        Ok(())
    }

    pub fn fingerprint(&self) -> LocalFileFingerprint {
        LocalFileFingerprint {
            path: self.path.clone(),
            size: self.size,
            mod_time: self.mod_time,
        }
    }

    pub fn modified_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.mod_time, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// 网盘上已存在的文件
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RemoteFile {
    pub drive_id: String,
    pub file_id: String,
    pub parent_file_id: String,
    pub name: String,
    pub size: u64,
    pub content_hash: Option<String>,
}

/// 分片上传地址
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PartUploadUrl {
    /// 从 1 开始
    pub part_number: u32,
    pub upload_url: Url,
}

/// 服务端已确认的分片
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct UploadedPart {
    pub part_number: u32,
    pub size: u64,
    pub etag: Option<String>,
}

/// 服务端创建的上传会话
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RemoteUploadSession {
    pub drive_id: String,
    pub file_id: String,
    pub parent_file_id: String,
    pub upload_id: String,
    pub block_size: u64,
    pub content_hash: Option<String>,
    /// 创建时服务端已有相同内容（秒传命中）
    pub rapid_upload: bool,
    #[serde(default)]
    pub part_urls: Vec<PartUploadUrl>,
}

/// 同名文件处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckNameMode {
    /// 同名时服务端自动重命名
    AutoRename,
}

/// 创建上传会话的参数
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateUploadParam {
    pub drive_id: String,
    pub parent_file_id: String,
    pub name: String,
    pub size: u64,
    pub block_size: u64,
    pub check_name_mode: CheckNameMode,
    pub content_hash: Option<String>,
    pub content_hash_name: Option<String>,
    pub proof_code: Option<String>,
    pub proof_version: Option<String>,
    pub local_created_at: DateTime<Utc>,
    pub local_modified_at: DateTime<Utc>,
}

/// 预哈希检测参数
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreHashParam {
    pub drive_id: String,
    pub parent_file_id: String,
    pub name: String,
    pub size: u64,
    pub pre_hash: String,
}

/// 上传阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum UploadPhase {
    /// 准备：创建目录、计算哈希、创建上传会话
    PrepareUpload,
    /// 秒传判定
    RapidUpload,
    /// 分片上传
    Upload,
}

impl fmt::Display for UploadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PrepareUpload => "prepare",
            Self::RapidUpload => "rapid-upload",
            Self::Upload => "upload",
        };
        f.write_str(name)
    }
}

/// 成功结束的方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// 正常上传了全部数据
    Uploaded,
    /// 秒传命中，没有传输数据
    RapidUploaded,
    /// 存在同名文件，跳过
    SkippedSameName,
    /// 存在内容一致的同名文件
    IdenticalExists,
}

/// 单次运行的最终结果
#[derive(Debug, Default)]
pub struct TaskResult {
    pub succeed: bool,
    pub need_retry: bool,
    pub cancelled: bool,
    pub message: String,
    pub err: Option<UploadError>,
    /// 匹配到的远端文件
    pub extra: Option<RemoteFile>,
    pub outcome: Option<UploadOutcome>,
}

impl TaskResult {
    pub fn success(outcome: UploadOutcome, message: impl Into<String>) -> Self {
        Self {
            succeed: true,
            message: message.into(),
            outcome: Some(outcome),
            ..Default::default()
        }
    }

    pub fn with_extra(mut self, file: RemoteFile) -> Self {
        self.extra = Some(file);
        self
    }

    pub fn failure(message: impl Into<String>, err: UploadError) -> Self {
        let cancelled = matches!(err, UploadError::Cancelled);
        Self {
            need_retry: err.is_retryable(),
            cancelled,
            message: message.into(),
            err: Some(err),
            ..Default::default()
        }
    }

    pub fn cancelled() -> Self {
        Self {
            cancelled: true,
            message: "upload cancelled".to_string(),
            err: Some(UploadError::Cancelled),
            ..Default::default()
        }
    }

    /// 是否传输了文件数据
    pub fn transferred_bytes(&self) -> bool {
        self.outcome == Some(UploadOutcome::Uploaded)
    }
}

impl fmt::Display for TaskResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.err, self.succeed) {
            (Some(err), _) => write!(f, "failed! {}, {}", self.message, err),
            (None, true) => write!(f, "succeeded! {}", self.message),
            (None, false) => f.write_str(&self.message),
        }
    }
}

/// 传输引擎的周期状态
#[derive(Debug, Clone, PartialEq)]
pub struct TransferStatus {
    pub uploaded: u64,
    pub total: u64,
    /// 瞬时速度（字节/秒）
    pub speed: u64,
    pub elapsed: Duration,
    /// 速度为 0 时未知
    pub time_left: Option<Duration>,
}

/// 传输引擎上报给编排器的事件
#[derive(Debug, Clone)]
pub enum TransferEvent {
    Status(TransferStatus),
    /// 断点状态有更新，需要落盘
    Checkpoint(Checkpoint),
}

// 静态断言确保类型是 Send 的
const _: () = {
    fn assert_send<T: Send>() {}
    fn assert_types() {
        assert_send::<TaskResult>();
        assert_send::<TransferEvent>();
        assert_send::<LocalFile>();
    }
};
