mod errors;
mod traits;
mod types;

pub use errors::{ApiError, ApiErrorCode, Result, UploadError};
pub use traits::{
    BlockTransfer,
    BlockTransferFactory,
    CheckpointStore,
    CompletionHook,
    DriveApi,
    ProgressSink,
    TransferConfig,
    TransferRequest,
};
pub use types::{
    CheckNameMode,
    CreateUploadParam,
    LocalFile,
    LocalFileFingerprint,
    PartUploadUrl,
    PreHashParam,
    RemoteFile,
    RemoteUploadSession,
    TaskId,
    TaskResult,
    TransferEvent,
    TransferStatus,
    UploadOutcome,
    UploadPhase,
    UploadedPart,
};
