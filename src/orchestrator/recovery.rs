use tokio::sync::mpsc;
use tracing::{info, warn};
use crate::core::{
    LocalFileFingerprint,
    TaskResult,
    TransferEvent,
    TransferRequest,
    UploadError,
    UploadOutcome,
    UploadPhase,
};
use crate::hash;
use crate::utils::ProgressReport;
use super::{Step, StepContext, StepError, StepResult, UploadOrchestrator};

impl UploadOrchestrator {
    /// 上传阶段：驱动传输引擎并处理可恢复的错误
    pub(super) async fn upload(&mut self) -> StepResult {
        let Some(session) = self.task.local.session.clone() else {
            return Ok(Step::Next(UploadPhase::PrepareUpload));
        };

        let fingerprint = self.task.local.fingerprint();
        let block_size = if session.block_size > 0 {
            session.block_size
        } else {
            hash::resize_block_size(self.task.local.size, self.task.options.block_size)
        };

        let request = TransferRequest {
            session,
            file_path: self.task.local.path.clone(),
            file_size: self.task.local.size,
            config: self.services.config.transfer_config(&self.task.options, block_size),
            checkpoint: self.checkpoint.clone(),
            speeds: self.services.speeds.clone(),
        };
        let mut engine = self.services.transfers.create(request);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = self.cancel.clone();
        let (result, ()) = tokio::join!(
            engine.execute(events_tx, cancel),
            self.consume_events(events_rx, &fingerprint),
        );
        let latest = engine.checkpoint();

        let err = match result {
            Ok(()) => return Ok(self.upload_succeeded(&fingerprint).await),
            Err(err) => err,
        };

        if err.is_session_expired() {
            return self.restart_session(&fingerprint, err).await;
        }

        // 只保存服务端已确认的分片
        self.services.checkpoints.upsert(&fingerprint, latest.clone()).await;
        self.persist_checkpoints().await;
        self.checkpoint = Some(latest);

        if matches!(err, UploadError::Cancelled) {
            return Ok(Step::Done(TaskResult::cancelled()));
        }
        if err.is_part_not_sequential() {
            return self.amend_part_order(&fingerprint, err).await;
        }

        Err(StepError::new("upload failed", err))
    }

    /// 持久化断点并转发进度
    async fn consume_events(
        &self,
        mut events: mpsc::UnboundedReceiver<TransferEvent>,
        fingerprint: &LocalFileFingerprint,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                TransferEvent::Status(status) => {
                    if !self.task.options.show_progress {
                        continue;
                    }
                    if let Some(sink) = &self.services.progress {
                        let aggregate = self.services.speeds.speed().await;
                        sink.on_progress(self.task.id, &ProgressReport::from_status(&status, aggregate));
                    }
                }
                TransferEvent::Checkpoint(checkpoint) => {
                    self.services.checkpoints.upsert(fingerprint, checkpoint).await;
                    self.persist_checkpoints().await;
                }
            }
        }
    }

    async fn persist_checkpoints(&self) {
        if let Err(err) = self.services.checkpoints.persist().await {
            warn!(task = %self.task.id, error = %err, "failed to persist checkpoints");
        }
    }

    async fn upload_succeeded(&mut self, fingerprint: &LocalFileFingerprint) -> Step {
        self.services.statistic.add_total_size(self.task.local.size);
        self.services.checkpoints.delete(fingerprint).await;
        self.persist_checkpoints().await;
        self.checkpoint = None;

        let drive_path = self.drive_path();
        info!(task = %self.task.id, "upload succeeded, saved to {drive_path}");
        Step::Done(TaskResult::success(
            UploadOutcome::Uploaded,
            format!("saved to {drive_path}"),
        ))
    }

    /// 会话失效：清掉会话与断点，重新准备
    async fn restart_session(
        &mut self,
        fingerprint: &LocalFileFingerprint,
        err: UploadError,
    ) -> StepResult {
        // 引擎最后一次上报的断点仍指向失效的会话，无论是否重建都要清掉
        self.task.local.session = None;
        self.checkpoint = None;
        self.services.checkpoints.delete(fingerprint).await;
        self.persist_checkpoints().await;

        self.session_restarts += 1;
        if self.session_restarts > self.services.config.max_session_restarts {
            return Err(StepError::new("upload session keeps expiring", err));
        }

        info!(task = %self.task.id, error = %err, "upload session no longer exists, creating a new one");
        Ok(Step::Next(UploadPhase::PrepareUpload))
    }

    /// 分片乱序：以服务端已确认的分片为准修正断点，再继续上传
    async fn amend_part_order(
        &mut self,
        fingerprint: &LocalFileFingerprint,
        err: UploadError,
    ) -> StepResult {
        const GIVE_UP: &str = "cannot repair the uploaded part order, upload the file again";

        self.amend_attempts += 1;
        if self.amend_attempts > self.services.config.max_amend_attempts {
            warn!(task = %self.task.id, error = %err, "parts still out of order");
            return Err(StepError::new(
                GIVE_UP,
                UploadError::corrupt_resume_state(format!(
                    "parts still out of order after {} amendments",
                    self.services.config.max_amend_attempts
                )),
            ));
        }

        let (Some(session), Some(checkpoint)) = (&self.task.local.session, self.checkpoint.as_mut()) else {
            return Err(StepError::new(
                GIVE_UP,
                UploadError::corrupt_resume_state("no session to amend"),
            ));
        };

        info!(task = %self.task.id, "parts were acknowledged out of order, amending");
        let parts = self
            .services
            .api
            .list_uploaded_parts(&session.drive_id, &session.file_id, &session.upload_id)
            .await
            .map_err(|err| {
                StepError::new(
                    GIVE_UP,
                    UploadError::corrupt_resume_state(format!("cannot list uploaded parts: {err}")),
                )
            })?;

        let last_part = checkpoint.amend(&parts).step_err(GIVE_UP)?;
        let amended = checkpoint.clone();
        info!(task = %self.task.id, last_part, "part order amended");

        self.services.checkpoints.upsert(fingerprint, amended).await;
        self.persist_checkpoints().await;

        Ok(Step::Next(UploadPhase::Upload))
    }
}
