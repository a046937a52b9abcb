#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;
use ferry::checkpoint::Checkpoint;
use ferry::core::{
    ApiError,
    ApiErrorCode,
    BlockTransfer,
    BlockTransferFactory,
    CompletionHook,
    CreateUploadParam,
    DriveApi,
    LocalFile,
    PartUploadUrl,
    PreHashParam,
    ProgressSink,
    RemoteFile,
    RemoteUploadSession,
    Result,
    TaskId,
    TransferEvent,
    TransferRequest,
    TransferStatus,
    UploadError,
    UploadedPart,
};
use ferry::notify::UploadFinished;
use ferry::utils::ProgressReport;

pub fn remote_file(path: &str, hash: Option<&str>) -> RemoteFile {
    let name = path.rsplit('/').next().unwrap_or_default().to_string();
    RemoteFile {
        drive_id: "drive".to_string(),
        file_id: format!("existing:{path}"),
        parent_file_id: "parent".to_string(),
        name,
        size: 1,
        content_hash: hash.map(str::to_string),
    }
}

/// 可配置的网盘接口，记录所有调用
pub struct FakeState {
    pub files: HashMap<String, RemoteFile>,
    pub folders: HashMap<String, String>,
    pub lookup_error: Option<ApiError>,
    pub pre_hash_match: bool,
    pub pre_hash_error: bool,
    pub rapid_hit: bool,
    pub delete_ok: bool,
    pub create_error: Option<ApiError>,
    pub uploaded_parts: Vec<UploadedPart>,
    pub list_parts_error: Option<ApiError>,
    pub created: Vec<CreateUploadParam>,
    pub deleted: Vec<String>,
    pub calls: Vec<String>,
    next_id: u32,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            files: HashMap::new(),
            folders: HashMap::new(),
            lookup_error: None,
            pre_hash_match: true,
            pre_hash_error: false,
            rapid_hit: false,
            delete_ok: true,
            create_error: None,
            uploaded_parts: Vec::new(),
            list_parts_error: None,
            created: Vec::new(),
            deleted: Vec::new(),
            calls: Vec::new(),
            next_id: 0,
        }
    }
}

#[derive(Default)]
pub struct FakeDriveApi {
    state: Mutex<FakeState>,
}

impl FakeDriveApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn configure(self, f: impl FnOnce(&mut FakeState)) -> Self {
        f(&mut self.state.lock().unwrap());
        self
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn calls(&self, name: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|call| call.as_str() == name)
            .count()
    }

    pub fn created(&self) -> Vec<CreateUploadParam> {
        self.state().created.clone()
    }

    fn record(&self, name: &str) {
        self.state().calls.push(name.to_string());
    }
}

#[async_trait]
impl DriveApi for FakeDriveApi {
    fn access_token(&self) -> String {
        "fake-access-token".to_string()
    }

    async fn file_by_path(&self, drive_id: &str, path: &str) -> Result<Option<RemoteFile>, ApiError> {
        self.record("file_by_path");
        tokio::task::yield_now().await;

        let state = self.state();
        if let Some(err) = state.lookup_error.clone() {
            return Err(err);
        }
        if let Some(folder_id) = state.folders.get(path) {
            return Ok(Some(RemoteFile {
                drive_id: drive_id.to_string(),
                file_id: folder_id.clone(),
                parent_file_id: "root".to_string(),
                name: path.to_string(),
                size: 0,
                content_hash: None,
            }));
        }
        match state.files.get(path) {
            Some(file) => Ok(Some(file.clone())),
            None => Err(ApiError::new(ApiErrorCode::FileNotFound, "file not found")),
        }
    }

    async fn mkdir_by_full_path(&self, _drive_id: &str, path: &str) -> Result<String, ApiError> {
        self.record("mkdir_by_full_path");
        tokio::task::yield_now().await;

        let mut state = self.state();
        state.next_id += 1;
        let folder_id = format!("folder-{}", state.next_id);
        state.folders.insert(path.to_string(), folder_id.clone());
        Ok(folder_id)
    }

    async fn batch_delete(&self, _drive_id: &str, file_ids: &[String]) -> Result<bool, ApiError> {
        self.record("batch_delete");

        let mut state = self.state();
        state.deleted.extend(file_ids.iter().cloned());
        if state.delete_ok {
            state.files.retain(|_, file| !file_ids.contains(&file.file_id));
        }
        Ok(state.delete_ok)
    }

    async fn check_pre_hash(&self, _param: &PreHashParam) -> Result<bool, ApiError> {
        self.record("check_pre_hash");

        let state = self.state();
        if state.pre_hash_error {
            return Err(ApiError::new(ApiErrorCode::BadGateway, "gateway"));
        }
        Ok(state.pre_hash_match)
    }

    async fn create_upload(&self, param: &CreateUploadParam) -> Result<RemoteUploadSession, ApiError> {
        self.record("create_upload");

        let mut state = self.state();
        state.created.push(param.clone());
        if let Some(err) = state.create_error.clone() {
            return Err(err);
        }

        state.next_id += 1;
        Ok(RemoteUploadSession {
            drive_id: param.drive_id.clone(),
            file_id: format!("file-{}", state.next_id),
            parent_file_id: param.parent_file_id.clone(),
            upload_id: format!("upload-{}", state.next_id),
            block_size: param.block_size,
            content_hash: param.content_hash.clone(),
            rapid_upload: state.rapid_hit && param.content_hash.is_some(),
            part_urls: Vec::new(),
        })
    }

    async fn list_uploaded_parts(
        &self,
        _drive_id: &str,
        _file_id: &str,
        _upload_id: &str,
    ) -> Result<Vec<UploadedPart>, ApiError> {
        self.record("list_uploaded_parts");

        let state = self.state();
        match state.list_parts_error.clone() {
            Some(err) => Err(err),
            None => Ok(state.uploaded_parts.clone()),
        }
    }

    async fn get_upload_urls(
        &self,
        session: &RemoteUploadSession,
        part_numbers: &[u32],
    ) -> Result<Vec<PartUploadUrl>, ApiError> {
        self.record("get_upload_urls");

        Ok(part_numbers
            .iter()
            .filter_map(|number| {
                let url = format!("https://upload.example.com/{}/{}", session.upload_id, number);
                Url::parse(&url).ok().map(|upload_url| PartUploadUrl {
                    part_number: *number,
                    upload_url,
                })
            })
            .collect())
    }

    async fn complete_upload(&self, session: &RemoteUploadSession) -> Result<RemoteFile, ApiError> {
        self.record("complete_upload");

        Ok(RemoteFile {
            drive_id: session.drive_id.clone(),
            file_id: session.file_id.clone(),
            parent_file_id: session.parent_file_id.clone(),
            name: String::new(),
            size: 0,
            content_hash: session.content_hash.clone(),
        })
    }
}

pub fn uploaded_parts(numbers: impl IntoIterator<Item = u32>) -> Vec<UploadedPart> {
    numbers
        .into_iter()
        .map(|part_number| UploadedPart {
            part_number,
            size: 10,
            etag: None,
        })
        .collect()
}

/// 传输引擎的脚本化行为
#[derive(Debug, Clone)]
pub enum Script {
    Succeed,
    /// 把给定分片标记为完成后报告分片乱序
    PartNotSequential(Vec<u32>),
    NoSuchUpload,
    /// 上报给定分片的断点后报告会话失效
    ExpireAfter(Vec<u32>),
    Fail(ApiErrorCode),
    /// 标记分片后一直等到被取消
    WaitForCancel(Vec<u32>),
}

/// 引擎创建时收到的请求
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub session: RemoteUploadSession,
    pub checkpoint: Option<Checkpoint>,
    pub block_size: u64,
    pub parallel: usize,
}

#[derive(Default)]
pub struct FakeTransferFactory {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl FakeTransferFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scripted(scripts: impl IntoIterator<Item = Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl BlockTransferFactory for FakeTransferFactory {
    fn create(&self, request: TransferRequest) -> Box<dyn BlockTransfer> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Script::Succeed);

        self.requests.lock().unwrap().push(RecordedRequest {
            session: request.session.clone(),
            checkpoint: request.checkpoint.clone(),
            block_size: request.config.block_size,
            parallel: request.config.parallel,
        });

        let checkpoint = match request.checkpoint {
            Some(checkpoint) if checkpoint.matches(&request.session) => checkpoint,
            _ => Checkpoint::new(&request.session, request.file_size, request.config.block_size),
        };

        Box::new(FakeTransfer { script, checkpoint })
    }
}

struct FakeTransfer {
    script: Script,
    checkpoint: Checkpoint,
}

impl FakeTransfer {
    fn mark(&mut self, indexes: &[u32]) {
        for index in indexes {
            self.checkpoint.mark_done(*index);
        }
    }
}

#[async_trait]
impl BlockTransfer for FakeTransfer {
    async fn execute(
        &mut self,
        events: mpsc::UnboundedSender<TransferEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        match self.script.clone() {
            Script::Succeed => {
                let indexes: Vec<u32> = self.checkpoint.blocks.iter().map(|b| b.index).collect();
                self.mark(&indexes);
                let total = self.checkpoint.total_bytes();
                let _ = events.send(TransferEvent::Status(TransferStatus {
                    uploaded: total,
                    total,
                    speed: 0,
                    elapsed: Duration::from_millis(10),
                    time_left: None,
                }));
                let _ = events.send(TransferEvent::Checkpoint(self.checkpoint.clone()));
                Ok(())
            }
            Script::PartNotSequential(indexes) => {
                self.mark(&indexes);
                Err(UploadError::PartNotSequential)
            }
            Script::NoSuchUpload => Err(UploadError::NoSuchUpload),
            Script::ExpireAfter(indexes) => {
                self.mark(&indexes);
                let _ = events.send(TransferEvent::Checkpoint(self.checkpoint.clone()));
                Err(UploadError::NoSuchUpload)
            }
            Script::Fail(code) => Err(ApiError::new(code, "scripted failure").into()),
            Script::WaitForCancel(indexes) => {
                self.mark(&indexes);
                let _ = events.send(TransferEvent::Checkpoint(self.checkpoint.clone()));
                cancel.cancelled().await;
                Err(UploadError::Cancelled)
            }
        }
    }

    fn checkpoint(&self) -> Checkpoint {
        self.checkpoint.clone()
    }
}

/// 记录所有进度
#[derive(Default)]
pub struct RecordingSink {
    pub reports: Mutex<Vec<(TaskId, ProgressReport)>>,
}

impl ProgressSink for RecordingSink {
    fn on_progress(&self, task_id: TaskId, report: &ProgressReport) {
        self.reports.lock().unwrap().push((task_id, report.clone()));
    }
}

/// 记录所有结束通知
#[derive(Default)]
pub struct RecordingHook {
    pub finished: Mutex<Vec<UploadFinished>>,
}

#[async_trait]
impl CompletionHook for RecordingHook {
    async fn on_upload_finished(&self, finished: &UploadFinished) -> anyhow::Result<()> {
        self.finished.lock().unwrap().push(finished.clone());
        Ok(())
    }
}

/// 写入指定内容的本地文件
pub async fn write_file(dir: &Path, name: &str, content: &[u8]) -> LocalFile {
    let path = dir.join(name);
    tokio::fs::write(&path, content).await.unwrap();
    LocalFile::open(&path).await.unwrap()
}

/// 稀疏文件，只占用很少的磁盘空间
pub async fn sparse_file(dir: &Path, name: &str, size: u64) -> LocalFile {
    let path: PathBuf = dir.join(name);
    let file = std::fs::File::create(&path).unwrap();
    file.set_len(size).unwrap();
    drop(file);
    LocalFile::open(&path).await.unwrap()
}
