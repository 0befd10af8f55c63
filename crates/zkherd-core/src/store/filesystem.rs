use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::debug;
use zkherd_common::protocol::error::{Result, ZkherdError};

use super::StoreOutcome;
use crate::config::{properties, ConfigCollection, LoadedConfig};
use crate::lock::LockBackend;

const CONFIG_FILE: &str = "zkherd.properties";
const HEARTBEAT_DIR: &str = "heartbeats";
const HEARTBEAT_PREFIX: &str = "heartbeat-";
const LOCK_DIR: &str = "locks";

/// Store rooted at a directory every instance can reach (NFS, a shared
/// volume, or simply a local path for single-host ensembles).
///
/// Writes are not atomic across processes on their own; callers serialise
/// them with the pseudo-lock, and the version check catches anything that
/// slips through.
#[derive(Debug, Clone)]
pub struct FileSystemConfigStore {
    root: PathBuf,
}

impl FileSystemConfigStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    fn heartbeat_path(&self, hostname: &str) -> PathBuf {
        self.root
            .join(HEARTBEAT_DIR)
            .join(format!("{}{}", HEARTBEAT_PREFIX, encode_hostname(hostname)))
    }

    pub(super) async fn load_config(&self) -> Result<LoadedConfig> {
        match tokio::fs::read_to_string(self.config_path()).await {
            Ok(text) => properties::decode(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(LoadedConfig {
                collection: ConfigCollection::default(),
                version: 0,
            }),
            Err(e) => Err(unavailable(&self.config_path(), e)),
        }
    }

    pub(super) async fn store_config(
        &self,
        collection: &ConfigCollection,
        expected_version: u64,
    ) -> Result<StoreOutcome> {
        let current = self.load_config().await?;
        if current.version != expected_version {
            return Ok(StoreOutcome::Conflict {
                current_version: current.version,
            });
        }

        let version = current.version + 1;
        let text = properties::encode(collection, version);

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| unavailable(&self.root, e))?;
        let temp = self
            .root
            .join(format!(".{}.{}.tmp", CONFIG_FILE, rand::random::<u32>()));
        tokio::fs::write(&temp, text)
            .await
            .map_err(|e| unavailable(&temp, e))?;
        tokio::fs::rename(&temp, self.config_path())
            .await
            .map_err(|e| unavailable(&self.config_path(), e))?;

        debug!("Stored config version {} in {}", version, self.root.display());
        Ok(StoreOutcome::Stored(LoadedConfig {
            collection: collection.clone(),
            version,
        }))
    }

    pub(super) async fn write_heartbeat(&self, hostname: &str) -> Result<()> {
        let path = self.heartbeat_path(hostname);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| unavailable(parent, e))?;
        }
        let stamp = crate::lock::now_ms().to_string();
        tokio::fs::write(&path, stamp)
            .await
            .map_err(|e| unavailable(&path, e))
    }

    pub(super) async fn last_heartbeat(&self, hostname: &str) -> Result<Option<SystemTime>> {
        let path = self.heartbeat_path(hostname);
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(Some(meta.modified().map_err(|e| unavailable(&path, e))?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(unavailable(&path, e)),
        }
    }

    pub(super) async fn clean_heartbeats(&self, max_age: Duration) -> Result<usize> {
        let dir = self.root.join(HEARTBEAT_DIR);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(unavailable(&dir, e)),
        };

        let now = SystemTime::now();
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await.map_err(|e| unavailable(&dir, e))? {
            let is_heartbeat = entry
                .file_name()
                .to_str()
                .map(|n| n.starts_with(HEARTBEAT_PREFIX))
                .unwrap_or(false);
            if !is_heartbeat {
                continue;
            }
            let modified = entry.metadata().await.and_then(|m| m.modified());
            let stale = match modified {
                Ok(at) => now.duration_since(at).map(|age| age > max_age).unwrap_or(false),
                Err(_) => false,
            };
            if stale && tokio::fs::remove_file(entry.path()).await.is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub(super) fn lock_backend(&self) -> LockBackend {
        LockBackend::FileSystem(self.root.join(LOCK_DIR))
    }
}

fn unavailable(path: &Path, e: std::io::Error) -> ZkherdError {
    ZkherdError::StoreUnavailable(format!("{}: {}", path.display(), e))
}

/// Percent-encodes anything outside `[A-Za-z0-9._-]` so a hostname is always
/// a single safe file name.
fn encode_hostname(hostname: &str) -> String {
    let mut out = String::with_capacity(hostname.len());
    for byte in hostname.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'-' | b'_' => out.push(byte as char),
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}
