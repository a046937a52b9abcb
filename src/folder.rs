use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use crate::core::{DriveApi, Result};

/// 根目录的 ID
pub const ROOT_FOLDER_ID: &str = "root";

/// 网盘目录解析与创建
///
/// 同一个网盘的"查询-创建"整个过程互斥，避免多个任务同时创建出重复目录。
pub struct FolderProvisioner {
    api: Arc<dyn DriveApi>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    check_delay: Duration,
}

impl FolderProvisioner {
    pub fn new(api: Arc<dyn DriveApi>) -> Self {
        Self {
            api,
            locks: Mutex::new(HashMap::new()),
            check_delay: Duration::ZERO,
        }
    }

    /// 查询目录之后的等待时间
    pub fn with_check_delay(mut self, delay: Duration) -> Self {
        self.check_delay = delay;
        self
    }

    async fn drive_lock(&self, drive_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(drive_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// 返回目录 ID，不存在时逐级创建
    pub async fn resolve(&self, drive_id: &str, dir: &str) -> Result<String> {
        if is_root(dir) {
            return Ok(ROOT_FOLDER_ID.to_string());
        }

        let lock = self.drive_lock(drive_id).await;
        let _guard = lock.lock().await;

        debug!(drive = drive_id, dir, "checking remote folder");
        let existing = match self.api.file_by_path(drive_id, dir).await {
            Ok(file) => file,
            Err(err) if err.is_not_found() => None,
            Err(err) => {
                // 查询失败时直接尝试创建，已存在的目录会返回原 ID
                warn!(drive = drive_id, dir, error = %err, "folder lookup failed, creating it anyway");
                None
            }
        };
        if !self.check_delay.is_zero() {
            tokio::time::sleep(self.check_delay).await;
        }

        if let Some(folder) = existing {
            return Ok(folder.file_id);
        }

        debug!(drive = drive_id, dir, "creating remote folder");
        let folder_id = self.api.mkdir_by_full_path(drive_id, dir).await?;
        if folder_id.is_empty() {
            return Err(anyhow::anyhow!("remote folder was created without an id: {dir}").into());
        }

        debug!(drive = drive_id, dir, folder_id = %folder_id, "remote folder created");
        Ok(folder_id)
    }
}

fn is_root(dir: &str) -> bool {
    dir.is_empty() || dir.trim_end_matches('/').is_empty()
}

/// 把网盘路径拆成 (目录, 文件名)
pub fn split_save_path(save_path: &str) -> (String, String) {
    let trimmed = save_path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => ("/".to_string(), trimmed[1..].to_string()),
        Some(idx) => (clean_dir(&trimmed[..idx]), trimmed[idx + 1..].to_string()),
        None => ("/".to_string(), trimmed.to_string()),
    }
}

fn clean_dir(dir: &str) -> String {
    let parts: Vec<&str> = dir
        .split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect();
    format!("/{}", parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_save_path() {
        assert_eq!(split_save_path("/a.txt"), ("/".to_string(), "a.txt".to_string()));
        assert_eq!(
            split_save_path("/backup/2024/a.txt"),
            ("/backup/2024".to_string(), "a.txt".to_string())
        );
        assert_eq!(
            split_save_path("/backup//./docs/a.txt"),
            ("/backup/docs".to_string(), "a.txt".to_string())
        );
        assert_eq!(split_save_path("a.txt"), ("/".to_string(), "a.txt".to_string()));
    }

    #[test]
    fn test_root_detection() {
        assert!(is_root("/"));
        assert!(is_root(""));
        assert!(!is_root("/docs"));
    }
}
