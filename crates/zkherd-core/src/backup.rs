//! Read access to archived server data.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::SystemTime;
use zkherd_common::protocol::error::{Result, ZkherdError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupEntry {
    pub name: String,
    pub modified: SystemTime,
}

/// Somewhere backups can be listed and read from.
#[async_trait]
pub trait BackupSource: Send + Sync {
    /// Available entries, newest first.
    async fn list(&self) -> Result<Vec<BackupEntry>>;

    async fn open(&self, name: &str) -> Result<Vec<u8>>;
}

/// Backups stored as plain files in one directory.
#[derive(Debug, Clone)]
pub struct FileSystemBackupSource {
    dir: PathBuf,
}

impl FileSystemBackupSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl BackupSource for FileSystemBackupSource {
    async fn list(&self) -> Result<Vec<BackupEntry>> {
        let mut entries = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = dir.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            entries.push(BackupEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                modified: metadata.modified()?,
            });
        }

        entries.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| a.name.cmp(&b.name)));
        Ok(entries)
    }

    async fn open(&self, name: &str) -> Result<Vec<u8>> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(ZkherdError::InvalidConfig(format!("bad backup name: {}", name)));
        }
        Ok(tokio::fs::read(self.dir.join(name)).await?)
    }
}
