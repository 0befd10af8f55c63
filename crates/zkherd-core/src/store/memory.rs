use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use zkherd_common::protocol::error::{Result, ZkherdError};

use super::StoreOutcome;
use crate::config::{ConfigCollection, LoadedConfig};
use crate::lock::LockBackend;

#[derive(Debug)]
struct MemoryState {
    collection: ConfigCollection,
    version: u64,
    heartbeats: HashMap<String, SystemTime>,
    available: bool,
}

/// In-process store. Clones share the same state, so several supervisors in
/// one test can act as separate instances against a common store.
#[derive(Debug, Clone)]
pub struct MemoryConfigStore {
    state: Arc<Mutex<MemoryState>>,
    lock_keys: Arc<Mutex<BTreeSet<String>>>,
}

impl Default for MemoryConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                collection: ConfigCollection::default(),
                version: 0,
                heartbeats: HashMap::new(),
                available: true,
            })),
            lock_keys: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    /// Creates a store already holding `collection` at version 1.
    pub fn with_collection(collection: ConfigCollection) -> Self {
        let store = Self::new();
        {
            let mut state = store.state.lock();
            state.collection = collection;
            state.version = 1;
        }
        store
    }

    /// Simulates an outage: while unavailable, config reads and writes fail.
    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
    }

    pub fn set_heartbeat(&self, hostname: &str, at: SystemTime) {
        self.state.lock().heartbeats.insert(hostname.to_string(), at);
    }

    pub(super) fn load_config(&self) -> Result<LoadedConfig> {
        let state = self.state.lock();
        if !state.available {
            return Err(ZkherdError::StoreUnavailable("memory store offline".into()));
        }
        Ok(LoadedConfig {
            collection: state.collection.clone(),
            version: state.version,
        })
    }

    pub(super) fn store_config(
        &self,
        collection: &ConfigCollection,
        expected_version: u64,
    ) -> Result<StoreOutcome> {
        let mut state = self.state.lock();
        if !state.available {
            return Err(ZkherdError::StoreUnavailable("memory store offline".into()));
        }
        if state.version != expected_version {
            return Ok(StoreOutcome::Conflict {
                current_version: state.version,
            });
        }

        state.version += 1;
        state.collection = collection.clone();
        Ok(StoreOutcome::Stored(LoadedConfig {
            collection: collection.clone(),
            version: state.version,
        }))
    }

    pub fn last_heartbeat(&self, hostname: &str) -> Option<SystemTime> {
        self.state.lock().heartbeats.get(hostname).copied()
    }

    pub(super) fn clean_heartbeats(&self, max_age: Duration) -> usize {
        let now = SystemTime::now();
        let mut state = self.state.lock();
        let before = state.heartbeats.len();
        state.heartbeats.retain(|_, at| {
            now.duration_since(*at)
                .map(|age| age <= max_age)
                .unwrap_or(true)
        });
        before - state.heartbeats.len()
    }

    pub(super) fn lock_backend(&self) -> LockBackend {
        LockBackend::Memory(self.lock_keys.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outage_blocks_reads_and_writes() {
        let store = MemoryConfigStore::new();
        store.set_available(false);
        assert!(matches!(
            store.load_config(),
            Err(ZkherdError::StoreUnavailable(_))
        ));
        assert!(store.store_config(&ConfigCollection::default(), 0).is_err());

        store.set_available(true);
        assert_eq!(store.load_config().unwrap().version, 0);
    }

    #[test]
    fn test_clones_share_state() {
        let a = MemoryConfigStore::new();
        let b = a.clone();
        a.store_config(&ConfigCollection::default(), 0).unwrap();
        assert_eq!(b.load_config().unwrap().version, 1);
    }
}
