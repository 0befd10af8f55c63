//! Persistence for the shared configuration, heartbeats and lock keys.
//!
//! [`ConfigStore`] dispatches to one of the concrete stores. The memory store
//! is local to one process; the filesystem store is shared by every instance
//! that mounts the same directory.

mod filesystem;
mod memory;

pub use filesystem::FileSystemConfigStore;
pub use memory::MemoryConfigStore;

use std::time::{Duration, SystemTime};
use zkherd_common::protocol::error::Result;

use crate::config::{ConfigCollection, LoadedConfig};
use crate::lock::{LockPolicy, PseudoLock};

/// Outcome of a compare-and-store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
    /// Written; carries the collection as stored and its new version
    Stored(LoadedConfig),
    /// The store moved past the expected version
    Conflict { current_version: u64 },
}

/// Config store, dispatched by backing medium.
#[derive(Debug, Clone)]
pub enum ConfigStore {
    Memory(MemoryConfigStore),
    FileSystem(FileSystemConfigStore),
}

impl ConfigStore {
    /// Whether other instances see what this store writes.
    pub fn is_shared(&self) -> bool {
        match self {
            ConfigStore::Memory(_) => false,
            ConfigStore::FileSystem(_) => true,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            ConfigStore::Memory(_) => "memory".to_string(),
            ConfigStore::FileSystem(store) => format!("filesystem:{}", store.root().display()),
        }
    }

    /// Reads the current collection and its version.
    ///
    /// An empty store yields a default collection at version 0.
    pub async fn load_config(&self) -> Result<LoadedConfig> {
        match self {
            ConfigStore::Memory(store) => store.load_config(),
            ConfigStore::FileSystem(store) => store.load_config().await,
        }
    }

    /// Writes `collection` if the store is still at `expected_version`.
    pub async fn store_config(
        &self,
        collection: &ConfigCollection,
        expected_version: u64,
    ) -> Result<StoreOutcome> {
        match self {
            ConfigStore::Memory(store) => store.store_config(collection, expected_version),
            ConfigStore::FileSystem(store) => {
                store.store_config(collection, expected_version).await
            }
        }
    }

    pub async fn write_heartbeat(&self, hostname: &str) -> Result<()> {
        match self {
            ConfigStore::Memory(store) => {
                store.set_heartbeat(hostname, SystemTime::now());
                Ok(())
            }
            ConfigStore::FileSystem(store) => store.write_heartbeat(hostname).await,
        }
    }

    pub async fn last_heartbeat(&self, hostname: &str) -> Result<Option<SystemTime>> {
        match self {
            ConfigStore::Memory(store) => Ok(store.last_heartbeat(hostname)),
            ConfigStore::FileSystem(store) => store.last_heartbeat(hostname).await,
        }
    }

    /// `Some(true)` if `hostname` wrote a heartbeat within `dead_period`,
    /// `Some(false)` if its last heartbeat is older, `None` if it never wrote
    /// one.
    pub async fn is_heartbeat_alive(
        &self,
        hostname: &str,
        dead_period: Duration,
    ) -> Result<Option<bool>> {
        let last = self.last_heartbeat(hostname).await?;
        Ok(last.map(|at| {
            SystemTime::now()
                .duration_since(at)
                .map(|age| age <= dead_period)
                .unwrap_or(true)
        }))
    }

    /// Deletes heartbeats older than `max_age`. Returns how many were removed.
    pub async fn clean_heartbeats(&self, max_age: Duration) -> Result<usize> {
        match self {
            ConfigStore::Memory(store) => Ok(store.clean_heartbeats(max_age)),
            ConfigStore::FileSystem(store) => store.clean_heartbeats(max_age).await,
        }
    }

    pub fn new_pseudo_lock(&self, prefix: &str, policy: LockPolicy) -> PseudoLock {
        let backend = match self {
            ConfigStore::Memory(store) => store.lock_backend(),
            ConfigStore::FileSystem(store) => store.lock_backend(),
        };
        PseudoLock::new(backend, prefix, policy)
    }
}

impl From<MemoryConfigStore> for ConfigStore {
    fn from(store: MemoryConfigStore) -> Self {
        ConfigStore::Memory(store)
    }
}

impl From<FileSystemConfigStore> for ConfigStore {
    fn from(store: FileSystemConfigStore) -> Self {
        ConfigStore::FileSystem(store)
    }
}
