use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use crate::checkpoint::Checkpoint;
use crate::notify::UploadFinished;
use crate::stats::SpeedCounter;
use crate::utils::progress::ProgressReport;
use super::errors::{ApiError, Result};
use super::types::{
    CreateUploadParam,
    LocalFileFingerprint,
    PartUploadUrl,
    PreHashParam,
    RemoteFile,
    RemoteUploadSession,
    TaskId,
    TransferEvent,
    UploadedPart,
};

/// 网盘开放接口。认证与传输细节由实现方负责
#[async_trait]
pub trait DriveApi: Send + Sync {
    /// 计算持有证明时使用的访问令牌
    fn access_token(&self) -> String;

    /// 按完整路径查询文件或目录，不存在时返回 `Ok(None)`
    async fn file_by_path(&self, drive_id: &str, path: &str) -> Result<Option<RemoteFile>, ApiError>;

    /// 按完整路径逐级创建目录，返回最末级目录 ID
    async fn mkdir_by_full_path(&self, drive_id: &str, path: &str) -> Result<String, ApiError>;

    /// 批量删除（移入回收站），全部成功时返回 true
    async fn batch_delete(&self, drive_id: &str, file_ids: &[String]) -> Result<bool, ApiError>;

    /// 预哈希检测，返回 true 表示可能可以秒传
    async fn check_pre_hash(&self, param: &PreHashParam) -> Result<bool, ApiError>;

    async fn create_upload(&self, param: &CreateUploadParam) -> Result<RemoteUploadSession, ApiError>;

    /// 服务端已确认的分片，按分片号升序
    async fn list_uploaded_parts(
        &self,
        drive_id: &str,
        file_id: &str,
        upload_id: &str,
    ) -> Result<Vec<UploadedPart>, ApiError>;

    /// 获取（或刷新）指定分片的上传地址
    async fn get_upload_urls(
        &self,
        session: &RemoteUploadSession,
        part_numbers: &[u32],
    ) -> Result<Vec<PartUploadUrl>, ApiError>;

    async fn complete_upload(&self, session: &RemoteUploadSession) -> Result<RemoteFile, ApiError>;
}

/// 断点续传记录存储
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn find(&self, fingerprint: &LocalFileFingerprint) -> Option<Checkpoint>;

    async fn upsert(&self, fingerprint: &LocalFileFingerprint, checkpoint: Checkpoint);

    async fn delete(&self, fingerprint: &LocalFileFingerprint);

    /// 写入持久化存储
    async fn persist(&self) -> Result<()>;
}

/// 传输引擎配置
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// 预读的分片数
    pub parallel: usize,
    pub block_size: u64,
    /// 速度上限（字节/秒）
    pub max_rate: Option<u64>,
    pub progress_interval: Duration,
    pub checkpoint_interval: Duration,
}

/// 创建传输引擎所需的全部输入
pub struct TransferRequest {
    pub session: RemoteUploadSession,
    pub file_path: PathBuf,
    pub file_size: u64,
    pub config: TransferConfig,
    /// 断点续传状态
    pub checkpoint: Option<Checkpoint>,
    pub speeds: Arc<SpeedCounter>,
}

/// 分片传输引擎
#[async_trait]
pub trait BlockTransfer: Send {
    /// 上传全部未完成分片，直到成功、失败或被取消
    async fn execute(
        &mut self,
        events: mpsc::UnboundedSender<TransferEvent>,
        cancel: CancellationToken,
    ) -> Result<()>;

    /// 当前断点状态，只包含服务端已确认的分片
    fn checkpoint(&self) -> Checkpoint;
}

pub trait BlockTransferFactory: Send + Sync {
    fn create(&self, request: TransferRequest) -> Box<dyn BlockTransfer>;
}

/// 进度输出
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, task_id: TaskId, report: &ProgressReport);
}

/// 上传结束通知（插件回调、上传记录等）
#[async_trait]
pub trait CompletionHook: Send + Sync {
    async fn on_upload_finished(&self, finished: &UploadFinished) -> anyhow::Result<()>;
}
