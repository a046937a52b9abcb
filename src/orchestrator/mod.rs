//! 单个文件的上传编排
//!
//! 任务按阶段推进：准备（目录、哈希、创建会话）→ 秒传判定 → 分片上传。
//! 会话失效时回到准备阶段，分片乱序时修正断点后重新进入上传阶段。

mod rapid;
mod recovery;

use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use crate::checkpoint::{Checkpoint, JsonCheckpointStore, MemoryCheckpointStore};
use crate::config::{TaskOptions, UploadConfig};
use crate::core::{
    BlockTransferFactory,
    CheckpointStore,
    CompletionHook,
    DriveApi,
    LocalFile,
    ProgressSink,
    Result,
    TaskId,
    TaskResult,
    UploadError,
    UploadPhase,
};
use crate::folder::{split_save_path, FolderProvisioner};
use crate::notify::{notify_all, FinishStatus, UploadFinished};
use crate::stats::{SpeedCounter, UploadStatistic};
use crate::transfer::MultiUploaderFactory;
use crate::utils::format_duration;

/// 一个文件的上传意图
#[derive(Debug, Clone)]
pub struct UploadTask {
    pub id: TaskId,
    pub local: LocalFile,
    pub drive_id: String,
    /// 网盘上的完整保存路径
    pub save_path: String,
    pub options: TaskOptions,
}

impl UploadTask {
    pub fn new(
        local: LocalFile,
        drive_id: impl Into<String>,
        save_path: impl Into<String>,
        options: TaskOptions,
    ) -> Self {
        Self {
            id: TaskId::new(),
            local,
            drive_id: drive_id.into(),
            save_path: save_path.into(),
            options,
        }
    }
}

/// 所有任务共享的服务
#[derive(Clone)]
pub struct UploadServices {
    pub api: Arc<dyn DriveApi>,
    pub folders: Arc<FolderProvisioner>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub transfers: Arc<dyn BlockTransferFactory>,
    pub speeds: Arc<SpeedCounter>,
    pub statistic: Arc<UploadStatistic>,
    pub progress: Option<Arc<dyn ProgressSink>>,
    pub hooks: Vec<Arc<dyn CompletionHook>>,
    pub config: UploadConfig,
}

impl UploadServices {
    pub fn builder(api: Arc<dyn DriveApi>) -> UploadServicesBuilder {
        UploadServicesBuilder::new(api)
    }
}

pub struct UploadServicesBuilder {
    api: Arc<dyn DriveApi>,
    folders: Option<Arc<FolderProvisioner>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    transfers: Option<Arc<dyn BlockTransferFactory>>,
    speeds: Option<Arc<SpeedCounter>>,
    statistic: Option<Arc<UploadStatistic>>,
    progress: Option<Arc<dyn ProgressSink>>,
    hooks: Vec<Arc<dyn CompletionHook>>,
    config: UploadConfig,
}

impl UploadServicesBuilder {
    pub fn new(api: Arc<dyn DriveApi>) -> Self {
        Self {
            api,
            folders: None,
            checkpoints: None,
            transfers: None,
            speeds: None,
            statistic: None,
            progress: None,
            hooks: Vec::new(),
            config: UploadConfig::default(),
        }
    }

    pub fn config(mut self, config: UploadConfig) -> Self {
        self.config = config;
        self
    }

    pub fn folders(mut self, folders: Arc<FolderProvisioner>) -> Self {
        self.folders = Some(folders);
        self
    }

    pub fn checkpoints(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn transfers(mut self, factory: Arc<dyn BlockTransferFactory>) -> Self {
        self.transfers = Some(factory);
        self
    }

    pub fn speeds(mut self, speeds: Arc<SpeedCounter>) -> Self {
        self.speeds = Some(speeds);
        self
    }

    pub fn statistic(mut self, statistic: Arc<UploadStatistic>) -> Self {
        self.statistic = Some(statistic);
        self
    }

    pub fn progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    pub fn hook(mut self, hook: Arc<dyn CompletionHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// 配置了 `checkpoint_file` 时，断点记录保存到该 JSON 文件
    pub async fn with_config_checkpoints(mut self) -> Result<Self> {
        if let Some(path) = &self.config.checkpoint_file {
            let store = JsonCheckpointStore::open(path.clone()).await?;
            self.checkpoints = Some(Arc::new(store));
        }
        Ok(self)
    }

    pub fn build(self) -> UploadServices {
        let api = self.api;
        let folder_check_delay = self.config.folder_check_delay;

        UploadServices {
            folders: self.folders.unwrap_or_else(|| {
                Arc::new(FolderProvisioner::new(api.clone()).with_check_delay(folder_check_delay))
            }),
            checkpoints: self
                .checkpoints
                .unwrap_or_else(|| Arc::new(MemoryCheckpointStore::new()) as Arc<dyn CheckpointStore>),
            transfers: self
                .transfers
                .unwrap_or_else(|| Arc::new(MultiUploaderFactory::new(api.clone())) as Arc<dyn BlockTransferFactory>),
            speeds: self.speeds.unwrap_or_default(),
            statistic: self.statistic.unwrap_or_default(),
            progress: self.progress,
            hooks: self.hooks,
            config: self.config,
            api,
        }
    }
}

/// 阶段执行结果
pub(crate) enum Step {
    /// 进入下一个阶段
    Next(UploadPhase),
    /// 任务结束
    Done(TaskResult),
}

/// 阶段内的终止性错误，附带给用户看的说明
pub(crate) struct StepError {
    message: String,
    err: UploadError,
}

impl StepError {
    pub(crate) fn new(message: impl Into<String>, err: impl Into<UploadError>) -> Self {
        Self {
            message: message.into(),
            err: err.into(),
        }
    }

    fn into_result(self) -> TaskResult {
        TaskResult::failure(self.message, self.err)
    }
}

pub(crate) type StepResult = std::result::Result<Step, StepError>;

/// 给错误加上说明
pub(crate) trait StepContext<T> {
    fn step_err(self, message: impl Into<String>) -> std::result::Result<T, StepError>;
}

impl<T, E> StepContext<T> for std::result::Result<T, E>
where
    E: Into<UploadError>,
{
    fn step_err(self, message: impl Into<String>) -> std::result::Result<T, StepError> {
        self.map_err(|err| StepError::new(message, err))
    }
}

/// 根据断点记录和已缓存的会话决定从哪个阶段开始
pub fn initial_phase(task: &UploadTask, checkpoint: Option<&Checkpoint>) -> UploadPhase {
    if checkpoint.is_some() {
        return UploadPhase::Upload;
    }

    match (&task.local.session, task.options.rapid_upload) {
        (None, _) => UploadPhase::PrepareUpload,
        (Some(_), true) => UploadPhase::RapidUpload,
        (Some(_), false) => UploadPhase::Upload,
    }
}

/// 单个任务的上传编排器，同一时刻只能被一个调用方驱动
pub struct UploadOrchestrator {
    task: UploadTask,
    services: UploadServices,
    cancel: CancellationToken,
    phase: UploadPhase,
    checkpoint: Option<Checkpoint>,
    remote_dir: String,
    remote_name: String,
    amend_attempts: u32,
    session_restarts: u32,
}

impl UploadOrchestrator {
    pub fn new(task: UploadTask, services: UploadServices) -> Self {
        let (remote_dir, remote_name) = split_save_path(&task.save_path);

        Self {
            task,
            services,
            cancel: CancellationToken::new(),
            phase: UploadPhase::PrepareUpload,
            checkpoint: None,
            remote_dir,
            remote_name,
            amend_attempts: 0,
            session_restarts: 0,
        }
    }

    /// 用外部的取消令牌
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn task(&self) -> &UploadTask {
        &self.task
    }

    pub fn phase(&self) -> UploadPhase {
        self.phase
    }

    pub fn checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoint.as_ref()
    }

    /// 网盘上的完整目标路径
    pub fn drive_path(&self) -> String {
        if self.remote_dir == "/" {
            format!("/{}", self.remote_name)
        } else {
            format!("{}/{}", self.remote_dir, self.remote_name)
        }
    }

    /// 运行一次，返回终止结果
    pub async fn run(&mut self) -> TaskResult {
        let started = Instant::now();

        if let Err(err) = self.task.local.ensure_readable().await {
            let result = TaskResult::failure(
                format!("local file is not readable: {}", self.task.local.path.display()),
                err,
            );
            info!(task = %self.task.id, "{result}");
            return result;
        }

        info!(
            task = %self.task.id,
            "preparing upload: {} => {}",
            self.task.local.path.display(),
            self.task.save_path
        );

        self.amend_attempts = 0;
        self.session_restarts = 0;
        self.restore().await;

        let result = self.drive().await;
        info!(
            task = %self.task.id,
            elapsed = %format_duration(started.elapsed()),
            "upload finished: {result}"
        );
        result
    }

    /// 查找断点记录并决定初始阶段
    async fn restore(&mut self) {
        let fingerprint = self.task.local.fingerprint();
        self.checkpoint = self.services.checkpoints.find(&fingerprint).await;

        if let Some(checkpoint) = &self.checkpoint {
            let cached_matches = self
                .task
                .local
                .session
                .as_ref()
                .is_some_and(|session| checkpoint.matches(session));
            if !cached_matches {
                self.task.local.session = Some(checkpoint.session.to_session());
            }
            self.task.local.parent_folder_id = Some(checkpoint.session.parent_file_id.clone());
            debug!(task = %self.task.id, upload_id = %checkpoint.session.upload_id, "resuming from checkpoint");
        }

        self.phase = initial_phase(&self.task, self.checkpoint.as_ref());
    }

    /// 阶段调度
    async fn drive(&mut self) -> TaskResult {
        loop {
            if self.cancel.is_cancelled() {
                return TaskResult::cancelled();
            }

            debug!(task = %self.task.id, phase = %self.phase, "entering phase");
            let step = match self.phase {
                UploadPhase::PrepareUpload => self.prepare_upload().await,
                UploadPhase::RapidUpload => self.rapid_upload(),
                UploadPhase::Upload => self.upload().await,
            };

            match step {
                Ok(Step::Next(phase)) => self.phase = phase,
                Ok(Step::Done(result)) => return result,
                Err(err) => return err.into_result(),
            }
        }
    }

    fn finished(&self, status: FinishStatus) -> UploadFinished {
        UploadFinished {
            task_id: self.task.id,
            status,
            local_path: self.task.local.path.clone(),
            local_name: self.task.local.file_name(),
            size: self.task.local.size,
            modified_at: self.task.local.modified_at(),
            content_hash: self.task.local.content_hash.clone(),
            drive_id: self.task.drive_id.clone(),
            drive_path: self.drive_path(),
        }
    }

    pub async fn on_success(&self, _result: &TaskResult) {
        notify_all(&self.services.hooks, &self.finished(FinishStatus::Success)).await;
    }

    pub async fn on_failed(&self, _result: &TaskResult) {
        notify_all(&self.services.hooks, &self.finished(FinishStatus::Fail)).await;
    }

    pub async fn on_cancel(&self, _result: &TaskResult) {
        info!(task = %self.task.id, "upload cancelled, checkpoint kept for resume");
    }

    pub fn on_retry(&self, result: &TaskResult, attempt: u32, max_retries: u32) {
        info!(task = %self.task.id, "{}, retry {}/{}", result, attempt, max_retries);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::SessionIds;
    use crate::core::RemoteUploadSession;

    fn task(session: Option<RemoteUploadSession>, rapid_upload: bool) -> UploadTask {
        let local = LocalFile {
            path: "/tmp/a.bin".into(),
            size: 10,
            mod_time: 0,
            content_hash: None,
            session,
            parent_folder_id: None,
        };
        let options = TaskOptions {
            rapid_upload,
            ..Default::default()
        };
        UploadTask::new(local, "drive", "/backup/a.bin", options)
    }

    fn session() -> RemoteUploadSession {
        SessionIds {
            drive_id: "drive".to_string(),
            file_id: "file".to_string(),
            parent_file_id: "root".to_string(),
            upload_id: "upload".to_string(),
            block_size: 4,
            content_hash: None,
        }
        .to_session()
    }

    #[test]
    fn test_initial_phase() {
        let checkpoint = Checkpoint::new(&session(), 10, 4);

        assert_eq!(initial_phase(&task(None, true), None), UploadPhase::PrepareUpload);
        assert_eq!(initial_phase(&task(None, false), None), UploadPhase::PrepareUpload);
        assert_eq!(initial_phase(&task(Some(session()), true), None), UploadPhase::RapidUpload);
        assert_eq!(initial_phase(&task(Some(session()), false), None), UploadPhase::Upload);
        assert_eq!(initial_phase(&task(None, true), Some(&checkpoint)), UploadPhase::Upload);
    }

    #[test]
    fn test_step_context() {
        let failed: std::result::Result<(), UploadError> = Err(UploadError::NoSuchUpload);
        let err = failed.step_err("create upload failed").err().unwrap();

        let result = err.into_result();
        assert!(!result.succeed);
        assert!(result.need_retry);
        assert_eq!(result.message, "create upload failed");
    }
}
