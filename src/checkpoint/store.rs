use std::collections::HashMap;
use std::path::{Path, PathBuf};
use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;
use crate::core::{CheckpointStore, LocalFileFingerprint, Result};
use super::Checkpoint;

/// 仅保存在内存中的断点记录
#[derive(Default)]
pub struct MemoryCheckpointStore {
    entries: RwLock<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn find(&self, fingerprint: &LocalFileFingerprint) -> Option<Checkpoint> {
        self.entries.read().await.get(&fingerprint.key()).cloned()
    }

    async fn upsert(&self, fingerprint: &LocalFileFingerprint, checkpoint: Checkpoint) {
        self.entries.write().await.insert(fingerprint.key(), checkpoint);
    }

    async fn delete(&self, fingerprint: &LocalFileFingerprint) {
        self.entries.write().await.remove(&fingerprint.key());
    }

    async fn persist(&self) -> Result<()> {
        Ok(())
    }
}

/// 以单个 JSON 文件保存全部断点记录
pub struct JsonCheckpointStore {
    path: PathBuf,
    entries: RwLock<HashMap<String, Checkpoint>>,
    /// 整体写文件时串行化
    save_lock: Mutex<()>,
}

impl JsonCheckpointStore {
    /// 打开（不存在时新建）断点记录文件
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = if tokio::fs::try_exists(&path).await? {
            let data = tokio::fs::read_to_string(&path).await?;
            if data.trim().is_empty() {
                HashMap::new()
            } else {
                serde_json::from_str(&data)?
            }
        } else {
            HashMap::new()
        };

        debug!(path = %path.display(), entries = entries.len(), "checkpoint store loaded");

        Ok(Self {
            path,
            entries: RwLock::new(entries),
            save_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CheckpointStore for JsonCheckpointStore {
    async fn find(&self, fingerprint: &LocalFileFingerprint) -> Option<Checkpoint> {
        self.entries.read().await.get(&fingerprint.key()).cloned()
    }

    async fn upsert(&self, fingerprint: &LocalFileFingerprint, checkpoint: Checkpoint) {
        self.entries.write().await.insert(fingerprint.key(), checkpoint);
    }

    async fn delete(&self, fingerprint: &LocalFileFingerprint) {
        self.entries.write().await.remove(&fingerprint.key());
    }

    async fn persist(&self) -> Result<()> {
        let _guard = self.save_lock.lock().await;

        let data = {
            let entries = self.entries.read().await;
            serde_json::to_string_pretty(&*entries)?
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        // 先写临时文件再替换，避免写一半的文件
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        Ok(())
    }
}
