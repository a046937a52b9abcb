//! 分片上传引擎
//!
//! 分片严格按顺序逐个 PUT 到服务端下发的上传地址。读取文件在独立任务中进行，
//! 最多预读 `parallel` 个分片。

mod progress_stream;

pub use progress_stream::{chunked_body, CountingStream, STREAM_CHUNK_SIZE};

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;
use crate::checkpoint::{Block, Checkpoint};
use crate::core::{
    ApiError,
    ApiErrorCode,
    BlockTransfer,
    BlockTransferFactory,
    DriveApi,
    RemoteUploadSession,
    Result,
    TransferConfig,
    TransferEvent,
    TransferRequest,
    TransferStatus,
    UploadError,
};
use crate::stats::SpeedCounter;
use crate::utils::{RetryBuilder, RetryStrategy, SpeedCalculator};

/// 一次最多申请的上传地址数
const URL_BATCH: usize = 20;

/// 分片请求的处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartResponse {
    Accepted,
    /// 上传地址过期，需要刷新
    UrlExpired,
    NotSequential,
    NoSuchUpload,
    Rejected { code: String, message: String },
}

/// 从 `<Code>xxx</Code>` 风格的响应体中取值
fn xml_value<'a>(body: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    Some(body[start..end].trim())
}

/// 根据状态码和响应体判断分片是否上传成功
pub fn classify_part_response(status: StatusCode, body: &str) -> PartResponse {
    if status.is_success() {
        return PartResponse::Accepted;
    }

    let code = xml_value(body, "Code").unwrap_or_default();
    let message = xml_value(body, "Message").unwrap_or(body).to_string();

    match code {
        // 服务端已有该分片
        "PartAlreadyExist" => PartResponse::Accepted,
        "PartNotSequential" => PartResponse::NotSequential,
        "NoSuchUpload" => PartResponse::NoSuchUpload,
        "AccessDenied" if message.to_ascii_lowercase().contains("expired") => PartResponse::UrlExpired,
        "" => PartResponse::Rejected {
            code: format!("Http{}", status.as_u16()),
            message,
        },
        other => PartResponse::Rejected {
            code: other.to_string(),
            message,
        },
    }
}

/// 创建 [`MultiUploader`]
pub struct MultiUploaderFactory {
    api: Arc<dyn DriveApi>,
    client: Client,
}

impl MultiUploaderFactory {
    pub fn new(api: Arc<dyn DriveApi>) -> Self {
        Self::with_client(api, Client::new())
    }

    pub fn with_client(api: Arc<dyn DriveApi>, client: Client) -> Self {
        Self { api, client }
    }
}

impl BlockTransferFactory for MultiUploaderFactory {
    fn create(&self, request: TransferRequest) -> Box<dyn BlockTransfer> {
        Box::new(MultiUploader::new(self.api.clone(), self.client.clone(), request))
    }
}

/// 顺序分片上传器
pub struct MultiUploader {
    api: Arc<dyn DriveApi>,
    client: Client,
    session: RemoteUploadSession,
    file_path: PathBuf,
    config: TransferConfig,
    checkpoint: Checkpoint,
    speeds: Arc<SpeedCounter>,
    urls: HashMap<u32, Url>,
}

impl MultiUploader {
    pub fn new(api: Arc<dyn DriveApi>, client: Client, request: TransferRequest) -> Self {
        let TransferRequest {
            session,
            file_path,
            file_size,
            config,
            checkpoint,
            speeds,
        } = request;

        // 断点记录不属于当前会话时从头开始
        let checkpoint = match checkpoint {
            Some(checkpoint)
                if checkpoint.matches(&session) && checkpoint.total_bytes() == file_size =>
            {
                checkpoint
            }
            Some(_) => {
                warn!(upload_id = %session.upload_id, "discarding checkpoint of another session");
                Checkpoint::new(&session, file_size, config.block_size)
            }
            None => Checkpoint::new(&session, file_size, config.block_size),
        };

        let urls = session
            .part_urls
            .iter()
            .map(|part| (part.part_number, part.upload_url.clone()))
            .collect();

        Self {
            api,
            client,
            session,
            file_path,
            config,
            checkpoint,
            speeds,
            urls,
        }
    }

    async fn part_url(&mut self, part_number: u32) -> Result<Url> {
        if let Some(url) = self.urls.get(&part_number) {
            return Ok(url.clone());
        }

        let mut wanted: Vec<u32> = self
            .checkpoint
            .pending_blocks()
            .map(Block::part_number)
            .filter(|number| *number >= part_number)
            .take(URL_BATCH)
            .collect();
        if wanted.is_empty() {
            wanted.push(part_number);
        }

        debug!(upload_id = %self.session.upload_id, parts = ?wanted, "requesting upload urls");
        let fresh = self.api.get_upload_urls(&self.session, &wanted).await?;
        for part in fresh {
            self.urls.insert(part.part_number, part.upload_url);
        }

        self.urls.get(&part_number).cloned().ok_or_else(|| {
            ApiError::new(
                ApiErrorCode::Other("MissingUploadUrl".to_string()),
                format!("no upload url returned for part {part_number}"),
            )
            .into()
        })
    }

    /// 上传一个分片，上传地址过期时刷新一次
    async fn upload_block(
        &mut self,
        block: &Block,
        data: Bytes,
        in_flight: &Arc<AtomicU64>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let part_number = block.part_number();
        let mut refreshed = false;

        loop {
            let url = self.part_url(part_number).await?;
            let client = &self.client;
            let speeds = &self.speeds;

            let send = RetryBuilder::new()
                .max_attempts(3)
                .strategy(RetryStrategy::Fixed(Duration::from_secs(1)))
                .should_retry(|err| matches!(err, UploadError::Http(_)))
                .run(|| {
                    // 上一次失败的尝试不计入总量
                    speeds.retract(in_flight.swap(0, Ordering::Relaxed));
                    let body = chunked_body(data.clone(), in_flight.clone(), speeds.clone());
                    let request = client
                        .put(url.clone())
                        .body(reqwest::Body::wrap_stream(body));
                    async move { Ok(request.send().await?) }
                });

            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                response = send => response,
            };
            let response = match response {
                Ok(response) => response,
                Err(err) => {
                    self.discard_in_flight(in_flight);
                    return Err(err);
                }
            };

            let status = response.status();
            let body = if status.is_success() {
                String::new()
            } else {
                response.text().await.unwrap_or_default()
            };

            let outcome = classify_part_response(status, &body);
            if outcome != PartResponse::Accepted {
                self.discard_in_flight(in_flight);
            }

            match outcome {
                PartResponse::Accepted => return Ok(()),
                PartResponse::UrlExpired if !refreshed => {
                    debug!(part_number, "upload url expired, refreshing");
                    self.urls.remove(&part_number);
                    refreshed = true;
                }
                PartResponse::UrlExpired => {
                    return Err(ApiError::new(
                        ApiErrorCode::Other("AccessDenied".to_string()),
                        format!("upload url for part {part_number} expired again"),
                    )
                    .into());
                }
                PartResponse::NotSequential => return Err(UploadError::PartNotSequential),
                PartResponse::NoSuchUpload => return Err(UploadError::NoSuchUpload),
                PartResponse::Rejected { code, message } => {
                    return Err(ApiError::new(ApiErrorCode::from_code(&code), message).into());
                }
            }
        }
    }

    fn discard_in_flight(&self, in_flight: &AtomicU64) {
        self.speeds.retract(in_flight.swap(0, Ordering::Relaxed));
    }

    async fn throttle(&self, started: Instant, sent: u64, cancel: &CancellationToken) -> Result<()> {
        let Some(rate) = self.config.max_rate.filter(|rate| *rate > 0) else {
            return Ok(());
        };

        let expected = Duration::from_secs_f64(sent as f64 / rate as f64);
        let actual = started.elapsed();
        if expected > actual {
            tokio::select! {
                _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                _ = tokio::time::sleep(expected - actual) => {}
            }
        }
        Ok(())
    }

    async fn send_blocks(
        &mut self,
        blocks: &mut mpsc::Receiver<Result<(Block, Bytes)>>,
        events: &mpsc::UnboundedSender<TransferEvent>,
        cancel: &CancellationToken,
        confirmed: &Arc<AtomicU64>,
        in_flight: &Arc<AtomicU64>,
    ) -> Result<()> {
        let started = Instant::now();
        let mut sent = 0u64;
        let mut last_checkpoint = Instant::now();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                next = blocks.recv() => next,
            };
            let Some(item) = next else {
                break;
            };
            let (block, data) = item?;

            self.upload_block(&block, data, in_flight, cancel).await?;

            in_flight.store(0, Ordering::Relaxed);
            confirmed.fetch_add(block.len, Ordering::Relaxed);
            self.checkpoint.mark_done(block.index);
            sent += block.len;
            debug!(part_number = block.part_number(), "part uploaded");

            if last_checkpoint.elapsed() >= self.config.checkpoint_interval {
                let _ = events.send(TransferEvent::Checkpoint(self.checkpoint.clone()));
                last_checkpoint = Instant::now();
            }

            self.throttle(started, sent, cancel).await?;
        }

        Ok(())
    }

    async fn upload_pending(
        &mut self,
        events: &mpsc::UnboundedSender<TransferEvent>,
        cancel: &CancellationToken,
        confirmed: &Arc<AtomicU64>,
        in_flight: &Arc<AtomicU64>,
    ) -> Result<()> {
        let pending: Vec<Block> = self.checkpoint.pending_blocks().cloned().collect();

        if !pending.is_empty() {
            let (tx, mut rx) = mpsc::channel(self.config.parallel.max(1));
            let reader_stop = cancel.child_token();
            let reader = tokio::spawn(read_blocks(
                self.file_path.clone(),
                pending,
                tx,
                reader_stop.clone(),
            ));

            let result = self
                .send_blocks(&mut rx, events, cancel, confirmed, in_flight)
                .await;

            reader_stop.cancel();
            drop(rx);
            let _ = reader.await;
            result?;
        }

        if !self.checkpoint.is_complete() {
            return Err(UploadError::corrupt_resume_state(
                "file reader stopped before all parts were uploaded",
            ));
        }

        self.api.complete_upload(&self.session).await?;
        Ok(())
    }
}

#[async_trait]
impl BlockTransfer for MultiUploader {
    async fn execute(
        &mut self,
        events: mpsc::UnboundedSender<TransferEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let total = self.checkpoint.total_bytes();
        let confirmed = Arc::new(AtomicU64::new(self.checkpoint.uploaded_bytes()));
        let in_flight = Arc::new(AtomicU64::new(0));

        let reporter_stop = cancel.child_token();
        let reporter = tokio::spawn(report_status(
            events.clone(),
            confirmed.clone(),
            in_flight.clone(),
            total,
            self.config.progress_interval,
            reporter_stop.clone(),
        ));

        let result = self
            .upload_pending(&events, &cancel, &confirmed, &in_flight)
            .await;

        reporter_stop.cancel();
        let _ = reporter.await;
        let _ = events.send(TransferEvent::Checkpoint(self.checkpoint.clone()));

        result
    }

    fn checkpoint(&self) -> Checkpoint {
        self.checkpoint.clone()
    }
}

async fn read_block(file: &mut File, offset: u64, len: usize) -> std::io::Result<Bytes> {
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buffer = vec![0u8; len];
    file.read_exact(&mut buffer).await?;
    Ok(Bytes::from(buffer))
}

/// 按顺序读取分片，通道容量即预读深度
async fn read_blocks(
    path: PathBuf,
    blocks: Vec<Block>,
    tx: mpsc::Sender<Result<(Block, Bytes)>>,
    stop: CancellationToken,
) {
    let mut file = match open_for_read(&path).await {
        Ok(file) => file,
        Err(err) => {
            let _ = tx.send(Err(err)).await;
            return;
        }
    };

    for block in blocks {
        let item = tokio::select! {
            _ = stop.cancelled() => return,
            data = read_block(&mut file, block.offset, block.len as usize) => {
                data.map(|data| (block.clone(), data)).map_err(UploadError::from)
            }
        };
        let failed = item.is_err();

        tokio::select! {
            _ = stop.cancelled() => return,
            sent = tx.send(item) => {
                if sent.is_err() || failed {
                    return;
                }
            }
        }
    }
}

async fn open_for_read(path: &Path) -> Result<File> {
    Ok(File::open(path).await?)
}

/// 周期性上报传输状态
async fn report_status(
    events: mpsc::UnboundedSender<TransferEvent>,
    confirmed: Arc<AtomicU64>,
    in_flight: Arc<AtomicU64>,
    total: u64,
    interval: Duration,
    stop: CancellationToken,
) {
    let started = Instant::now();
    let calculator = SpeedCalculator::new(Duration::from_secs(5));
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(100)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let uploaded = (confirmed.load(Ordering::Relaxed) + in_flight.load(Ordering::Relaxed)).min(total);
        calculator.add_data_point(uploaded).await;
        let speed = calculator.calculate_speed().await as u64;
        let time_left = calculator.estimate_eta(total - uploaded).await;

        let status = TransferStatus {
            uploaded,
            total,
            speed,
            elapsed: started.elapsed(),
            time_left,
        };
        if events.send(TransferEvent::Status(status)).is_err() {
            break;
        }
    }
}
