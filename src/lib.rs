pub mod checkpoint;
pub mod config;
pub mod core;
pub mod folder;
pub mod hash;
pub mod notify;
pub mod orchestrator;
pub mod runner;
pub mod stats;
pub mod transfer;
pub mod utils;

// 重新导出核心类型
pub use core::{
    ApiError,
    ApiErrorCode,
    BlockTransfer,
    BlockTransferFactory,
    CheckpointStore,
    CompletionHook,
    DriveApi,
    LocalFile,
    ProgressSink,
    RemoteFile,
    RemoteUploadSession,
    Result,
    TaskId,
    TaskResult,
    UploadError,
    UploadOutcome,
    UploadPhase,
};

pub use checkpoint::{Checkpoint, JsonCheckpointStore, MemoryCheckpointStore};
pub use config::{TaskOptions, UploadConfig};
pub use folder::FolderProvisioner;
pub use notify::{FileRecorder, LogProgressSink, UploadFinished};
pub use orchestrator::{UploadOrchestrator, UploadServices, UploadTask};
pub use runner::TaskRunner;
pub use stats::{SpeedCounter, UploadStatistic};
pub use transfer::{MultiUploader, MultiUploaderFactory};
