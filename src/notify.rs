use std::path::{Path, PathBuf};
use std::sync::Arc;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};
use crate::core::{CompletionHook, ProgressSink, TaskId};
use crate::utils::ProgressReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishStatus {
    Success,
    Fail,
}

/// 上传结束时发给插件、上传记录的信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadFinished {
    pub task_id: TaskId,
    pub status: FinishStatus,
    pub local_path: PathBuf,
    pub local_name: String,
    pub size: u64,
    pub modified_at: DateTime<Utc>,
    pub content_hash: Option<String>,
    pub drive_id: String,
    /// 网盘上的完整路径
    pub drive_path: String,
}

/// 依次通知所有回调，回调失败只记录日志
pub async fn notify_all(hooks: &[Arc<dyn CompletionHook>], finished: &UploadFinished) {
    for hook in hooks {
        match hook.on_upload_finished(finished).await {
            Ok(()) => debug!(task = %finished.task_id, "completion hook succeeded"),
            Err(err) => debug!(task = %finished.task_id, error = %err, "completion hook failed"),
        }
    }
}

/// 上传记录的一行
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FileRecordItem {
    pub time: DateTime<Utc>,
    pub status: FinishStatus,
    pub file_size: u64,
    pub file_path: PathBuf,
    pub drive_path: String,
}

/// 把上传结果逐行追加到记录文件（JSON Lines）
pub struct FileRecorder {
    path: PathBuf,
    only_success: bool,
    write_lock: Mutex<()>,
}

impl FileRecorder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            only_success: true,
            write_lock: Mutex::new(()),
        }
    }

    /// 同时记录失败的上传
    pub fn record_failures(mut self) -> Self {
        self.only_success = false;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, item: &FileRecordItem) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(item)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        Ok(())
    }
}

#[async_trait]
impl CompletionHook for FileRecorder {
    async fn on_upload_finished(&self, finished: &UploadFinished) -> anyhow::Result<()> {
        if self.only_success && finished.status != FinishStatus::Success {
            return Ok(());
        }

        self.append(&FileRecordItem {
            time: Utc::now(),
            status: finished.status,
            file_size: finished.size,
            file_path: finished.local_path.clone(),
            drive_path: finished.drive_path.clone(),
        })
        .await
    }
}

/// 把进度写到日志里
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgressSink;

impl ProgressSink for LogProgressSink {
    fn on_progress(&self, task_id: TaskId, report: &ProgressReport) {
        info!(task = %task_id, "{report}");
    }
}
