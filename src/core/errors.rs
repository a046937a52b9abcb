use std::fmt;
use thiserror::Error;

/// 远端 API 错误码
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiErrorCode {
    /// 文件或目录不存在
    FileNotFound,
    /// 触发限流
    TooManyRequests,
    /// 网关错误
    BadGateway,
    /// 文件大小超出账户限制
    PayloadTooLarge,
    /// 上传任务 upload_id 不存在或已过期
    UploadIdNotFound,
    /// 分片没有按顺序上传
    PartNotSequential,
    /// 其它未特别处理的错误码
    Other(String),
}

impl ApiErrorCode {
    pub fn from_code(code: &str) -> Self {
        match code {
            "NotFound.File" | "NotFound.FileId" | "NotFound.ParentFileId" => Self::FileNotFound,
            "TooManyRequests" => Self::TooManyRequests,
            "BadGateway" => Self::BadGateway,
            "PayloadTooLarge" | "FileSizeExceed" | "FileSizeExceed.UploadFile" => Self::PayloadTooLarge,
            "NotFound.UploadId" | "NoSuchUpload" => Self::UploadIdNotFound,
            "PartNotSequential" => Self::PartNotSequential,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::FileNotFound => "NotFound.File",
            Self::TooManyRequests => "TooManyRequests",
            Self::BadGateway => "BadGateway",
            Self::PayloadTooLarge => "PayloadTooLarge",
            Self::UploadIdNotFound => "NotFound.UploadId",
            Self::PartNotSequential => "PartNotSequential",
            Self::Other(code) => code,
        }
    }
}

impl fmt::Display for ApiErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 远端 API 返回的结构化错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("api error {code}: {message}")]
pub struct ApiError {
    pub code: ApiErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ApiErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.code == ApiErrorCode::FileNotFound
    }
}

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// 上传会话在服务端已失效
    #[error("the remote upload session no longer exists")]
    NoSuchUpload,

    /// 服务端要求分片严格按顺序确认
    #[error("upload parts were not acknowledged in sequence")]
    PartNotSequential,

    #[error("corrupt resume state: {0}")]
    CorruptResumeState(String),

    #[error("Upload was cancelled")]
    Cancelled,

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error(transparent)]
    Unclassified(#[from] anyhow::Error),
}

impl UploadError {
    pub fn corrupt_resume_state(message: impl Into<String>) -> Self {
        Self::CorruptResumeState(message.into())
    }

    /// 会话失效类错误，需要重新创建上传会话
    pub fn is_session_expired(&self) -> bool {
        match self {
            Self::NoSuchUpload => true,
            Self::Api(err) => err.code == ApiErrorCode::UploadIdNotFound,
            _ => false,
        }
    }

    pub fn is_part_not_sequential(&self) -> bool {
        match self {
            Self::PartNotSequential => true,
            Self::Api(err) => err.code == ApiErrorCode::PartNotSequential,
            _ => false,
        }
    }

    /// 外层调度器是否应当退避后重新提交该任务
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Io(_) => false,
            Self::Api(err) => !matches!(
                err.code,
                ApiErrorCode::PayloadTooLarge | ApiErrorCode::PartNotSequential
            ),
            Self::Http(_) => true,
            Self::NoSuchUpload => true,
            Self::PartNotSequential => false,
            Self::CorruptResumeState(_) => false,
            Self::Cancelled => false,
            Self::Serde(_) | Self::Config(_) => false,
            Self::Unclassified(_) => false,
        }
    }
}

/// Error alias
pub type Result<T, E = UploadError> = std::result::Result<T, E>;
