//! 断点续传状态
//!
//! 记录上传会话标识以及每个分片是否已被服务端确认。

mod store;

pub use store::{JsonCheckpointStore, MemoryCheckpointStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::core::{RemoteUploadSession, Result, UploadError, UploadedPart};

/// 会话标识，恢复上传时据此重建会话
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SessionIds {
    pub drive_id: String,
    pub file_id: String,
    pub parent_file_id: String,
    pub upload_id: String,
    pub block_size: u64,
    pub content_hash: Option<String>,
}

impl From<&RemoteUploadSession> for SessionIds {
    fn from(session: &RemoteUploadSession) -> Self {
        Self {
            drive_id: session.drive_id.clone(),
            file_id: session.file_id.clone(),
            parent_file_id: session.parent_file_id.clone(),
            upload_id: session.upload_id.clone(),
            block_size: session.block_size,
            content_hash: session.content_hash.clone(),
        }
    }
}

impl SessionIds {
    /// 重建会话，分片上传地址需由传输引擎重新获取
    pub fn to_session(&self) -> RemoteUploadSession {
        RemoteUploadSession {
            drive_id: self.drive_id.clone(),
            file_id: self.file_id.clone(),
            parent_file_id: self.parent_file_id.clone(),
            upload_id: self.upload_id.clone(),
            block_size: self.block_size,
            content_hash: self.content_hash.clone(),
            rapid_upload: false,
            part_urls: Vec::new(),
        }
    }
}

/// 分片
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Block {
    /// 从 0 开始，对应分片号 index + 1
    pub index: u32,
    pub offset: u64,
    pub len: u64,
    /// 只有服务端确认后才能置为 true
    pub done: bool,
}

impl Block {
    pub fn part_number(&self) -> u32 {
        self.index + 1
    }

    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Checkpoint {
    pub session: SessionIds,
    pub blocks: Vec<Block>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    /// 按文件大小与分片大小划分分片
    pub fn new(session: &RemoteUploadSession, file_size: u64, block_size: u64) -> Self {
        let block_size = block_size.max(1);
        let mut blocks = Vec::new();
        let mut offset = 0;
        let mut index = 0;

        while offset < file_size {
            let len = block_size.min(file_size - offset);
            blocks.push(Block {
                index,
                offset,
                len,
                done: false,
            });
            offset += len;
            index += 1;
        }

        // 空文件也要上传一个空分片
        if blocks.is_empty() {
            blocks.push(Block {
                index: 0,
                offset: 0,
                len: 0,
                done: false,
            });
        }

        Self {
            session: SessionIds::from(session),
            blocks,
            updated_at: Utc::now(),
        }
    }

    /// 已确认的字节数
    pub fn uploaded_bytes(&self) -> u64 {
        self.blocks
            .iter()
            .filter(|block| block.done)
            .map(|block| block.len)
            .sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.blocks.iter().map(|block| block.len).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.blocks.iter().all(|block| block.done)
    }

    pub fn pending_blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter().filter(|block| !block.done)
    }

    pub fn mark_done(&mut self, index: u32) {
        if let Some(block) = self.blocks.iter_mut().find(|block| block.index == index) {
            block.done = true;
            self.updated_at = Utc::now();
        }
    }

    /// 断点记录是否属于给定会话
    pub fn matches(&self, session: &RemoteUploadSession) -> bool {
        self.session.upload_id == session.upload_id && self.session.file_id == session.file_id
    }

    /// 以服务端已确认的分片为准修正本地分片状态
    ///
    /// 分片号从 1 开始；取最大的已确认分片号 N，index < N 的分片置为完成，
    /// 其余置为未完成。返回 N。
    pub fn amend(&mut self, uploaded: &[UploadedPart]) -> Result<u32> {
        let last_part = uploaded
            .iter()
            .map(|part| part.part_number)
            .max()
            .ok_or_else(|| UploadError::corrupt_resume_state("uploaded parts list is empty"))?;

        for block in self.blocks.iter_mut() {
            block.done = block.index < last_part;
        }
        self.updated_at = Utc::now();

        Ok(last_part)
    }
}
