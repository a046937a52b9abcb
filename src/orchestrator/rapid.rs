use std::time::Duration;
use tracing::{debug, info, warn};
use crate::core::{
    ApiError,
    ApiErrorCode,
    CheckNameMode,
    CreateUploadParam,
    PreHashParam,
    RemoteFile,
    TaskResult,
    UploadError,
    UploadOutcome,
    UploadPhase,
};
use crate::hash::{self, CONTENT_HASH_NAME, EMPTY_CONTENT_HASH, PRE_HASH_THRESHOLD, PROOF_VERSION};
use crate::utils::format_bytes;
use super::{Step, StepContext, StepError, StepResult, UploadOrchestrator};

/// 秒传需要提交的哈希与持有证明
struct RapidProof {
    content_hash: String,
    proof_code: String,
}

/// 在阻塞线程池里跑哈希计算
async fn blocking<T, F>(f: F) -> Result<T, UploadError>
where
    F: FnOnce() -> std::io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => Ok(result?),
        Err(err) => Err(anyhow::Error::new(err).context("hash worker panicked").into()),
    }
}

async fn pause(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

fn same_content(remote: &RemoteFile, local_hash: Option<&str>) -> bool {
    match (remote.content_hash.as_deref(), local_hash) {
        (Some(remote), Some(local)) => remote.eq_ignore_ascii_case(local),
        _ => false,
    }
}

impl UploadOrchestrator {
    /// 准备阶段：目录、同名检测、哈希、创建上传会话
    pub(super) async fn prepare_upload(&mut self) -> StepResult {
        let api = self.services.api.clone();
        let drive_id = self.task.drive_id.clone();
        let options = self.task.options.clone();
        let drive_path = self.drive_path();

        info!(task = %self.task.id, dir = %self.remote_dir, "checking remote folder");
        let parent_id = self
            .services
            .folders
            .resolve(&drive_id, &self.remote_dir)
            .await
            .step_err(format!("failed to create remote folder {}", self.remote_dir))?;
        pause(self.services.config.post_prepare_delay).await;

        // 覆盖或跳过同名文件时，先检查目标路径
        let existing = if options.overwrite || options.skip_same_name {
            match api.file_by_path(&drive_id, &drive_path).await {
                Ok(file) => file,
                Err(err) if err.is_not_found() => None,
                Err(err) => return Err(StepError::new("failed to check same name file", err)),
            }
        } else {
            None
        };

        let existing = match existing {
            Some(file) if options.skip_same_name => {
                info!(task = %self.task.id, "same name file exists, skipped: {drive_path}");
                let result = TaskResult::success(
                    UploadOutcome::SkippedSameName,
                    format!("same name file exists, skipped: {drive_path}"),
                );
                return Ok(Step::Done(result.with_extra(file)));
            }
            other => other,
        };

        let proof = if options.rapid_upload {
            self.rapid_proof(&parent_id).await?
        } else {
            info!(task = %self.task.id, "rapid upload disabled, uploading directly");
            None
        };

        if let Some(existing) = existing.filter(|_| options.overwrite) {
            let local_hash = proof.as_ref().map(|proof| proof.content_hash.as_str());
            if same_content(&existing, local_hash) {
                info!(task = %self.task.id, "identical file already exists: {drive_path}");
                let result = TaskResult::success(
                    UploadOutcome::IdenticalExists,
                    format!("identical file already exists: {drive_path}"),
                );
                return Ok(Step::Done(result.with_extra(existing)));
            }

            let deleted = api
                .batch_delete(&existing.drive_id, std::slice::from_ref(&existing.file_id))
                .await
                .step_err("failed to delete the existing file, try again later")?;
            if !deleted {
                return Err(StepError::new(
                    "failed to delete the existing file, try again later",
                    ApiError::new(
                        ApiErrorCode::Other("DeleteFailed".to_string()),
                        format!("file {} was not moved to trash", existing.file_id),
                    ),
                ));
            }
            pause(self.services.config.delete_settle_delay).await;
            info!(task = %self.task.id, "different file with the same name moved to trash: {drive_path}");
        }

        let block_size = hash::resize_block_size(self.task.local.size, options.block_size);
        if block_size != options.block_size {
            debug!(task = %self.task.id, "resize upload block size to {}", format_bytes(block_size));
        }

        let modified_at = self.task.local.modified_at();
        let mut param = CreateUploadParam {
            drive_id: drive_id.clone(),
            parent_file_id: parent_id.clone(),
            name: self.remote_name.clone(),
            size: self.task.local.size,
            block_size,
            check_name_mode: CheckNameMode::AutoRename,
            content_hash: None,
            content_hash_name: None,
            proof_code: None,
            proof_version: None,
            local_created_at: modified_at,
            local_modified_at: modified_at,
        };
        if let Some(proof) = proof {
            param.content_hash = Some(proof.content_hash);
            param.content_hash_name = Some(CONTENT_HASH_NAME.to_string());
            param.proof_code = Some(proof.proof_code);
            param.proof_version = Some(PROOF_VERSION.to_string());
        }

        let session = match api.create_upload(&param).await {
            Ok(session) => session,
            Err(err) if err.code == ApiErrorCode::PayloadTooLarge => {
                warn!(task = %self.task.id, "file size exceeds the account limit");
                return Err(StepError::new(
                    "file size exceeds the account limit, a storage upgrade is required to upload large files",
                    err,
                ));
            }
            Err(err) => {
                let message = format!("failed to create upload: {err}");
                return Err(StepError::new(message, err));
            }
        };

        debug!(
            task = %self.task.id,
            upload_id = %session.upload_id,
            rapid = session.rapid_upload,
            "upload session created"
        );
        self.task.local.session = Some(session);
        self.task.local.parent_folder_id = Some(parent_id);

        let next = if options.rapid_upload {
            UploadPhase::RapidUpload
        } else {
            UploadPhase::Upload
        };
        Ok(Step::Next(next))
    }

    /// 计算秒传所需的哈希
    ///
    /// 大文件先用预哈希试探，服务端认为不可能命中时不计算完整哈希。
    async fn rapid_proof(&mut self, parent_id: &str) -> Result<Option<RapidProof>, StepError> {
        let api = self.services.api.clone();
        let path = self.task.local.path.clone();
        let size = self.task.local.size;

        if size >= PRE_HASH_THRESHOLD && self.task.local.content_hash.is_none() {
            let pre_hash = {
                let path = path.clone();
                blocking(move || hash::pre_hash(&path))
                    .await
                    .step_err("failed to compute pre hash")?
            };

            let param = PreHashParam {
                drive_id: self.task.drive_id.clone(),
                parent_file_id: parent_id.to_string(),
                name: self.remote_name.clone(),
                size,
                pre_hash,
            };
            // 检测接口出错时按可能命中处理
            let plausible = match api.check_pre_hash(&param).await {
                Ok(plausible) => plausible,
                Err(err) => {
                    debug!(task = %self.task.id, error = %err, "pre hash check failed");
                    true
                }
            };
            if !plausible {
                info!(task = %self.task.id, "pre hash not matched, uploading directly");
                return Ok(None);
            }
        }

        let content_hash = match self.task.local.content_hash.clone() {
            Some(hash) => hash,
            None if size == 0 => EMPTY_CONTENT_HASH.to_string(),
            None => {
                info!(task = %self.task.id, "computing sha1: {}", path.display());
                let path = path.clone();
                blocking(move || hash::content_hash(&path))
                    .await
                    .step_err("failed to compute content hash")?
            }
        };
        self.task.local.content_hash = Some(content_hash.clone());

        let token = api.access_token();
        let proof_code = blocking(move || hash::proof_code(&token, &path, size))
            .await
            .step_err("failed to compute proof code")?;

        Ok(Some(RapidProof {
            content_hash,
            proof_code,
        }))
    }

    /// 秒传判定：会话创建时服务端已有相同内容则直接成功
    pub(super) fn rapid_upload(&mut self) -> StepResult {
        let Some(session) = &self.task.local.session else {
            return Ok(Step::Next(UploadPhase::PrepareUpload));
        };

        if session.rapid_upload {
            info!(task = %self.task.id, "rapid upload succeeded: {}", self.drive_path());
            return Ok(Step::Done(TaskResult::success(
                UploadOutcome::RapidUploaded,
                format!("rapid upload succeeded: {}", self.drive_path()),
            )));
        }

        info!(task = %self.task.id, "rapid upload missed, uploading normally");
        Ok(Step::Next(UploadPhase::Upload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(hash: Option<&str>) -> RemoteFile {
        RemoteFile {
            drive_id: "drive".to_string(),
            file_id: "file".to_string(),
            parent_file_id: "root".to_string(),
            name: "a.bin".to_string(),
            size: 1,
            content_hash: hash.map(str::to_string),
        }
    }

    #[test]
    fn test_same_content_ignores_case() {
        assert!(same_content(&remote(Some("abcdef")), Some("ABCDEF")));
        assert!(!same_content(&remote(Some("abcdef")), Some("ABCDE0")));
        assert!(!same_content(&remote(None), Some("ABCDEF")));
        assert!(!same_content(&remote(Some("abcdef")), None));
    }
}
