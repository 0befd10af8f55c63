//! Polling mutual exclusion over a store without native locks.
//!
//! Each contender writes a timestamped key under a shared prefix and then
//! polls the key listing. The oldest key wins, but only after it has aged
//! past the settling period, which gives slow-to-appear competing keys a
//! chance to show up. Abandoned keys are reaped once they exceed the lock
//! timeout.

pub mod policy;

pub use policy::{LockKey, LockPolicy};

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use zkherd_common::protocol::error::{Result, ZkherdError};

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Where lock keys live.
#[derive(Debug, Clone)]
pub enum LockBackend {
    /// Keys in a set shared between handles of the same in-process store
    Memory(Arc<Mutex<BTreeSet<String>>>),
    /// One empty file per key in a shared directory
    FileSystem(PathBuf),
}

impl LockBackend {
    async fn create(&self, key: &str) -> Result<()> {
        match self {
            LockBackend::Memory(keys) => {
                keys.lock().insert(key.to_string());
                Ok(())
            }
            LockBackend::FileSystem(dir) => {
                tokio::fs::create_dir_all(dir).await.map_err(store_error)?;
                tokio::fs::write(dir.join(key), b"").await.map_err(store_error)
            }
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        match self {
            LockBackend::Memory(keys) => Ok(keys
                .lock()
                .iter()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect()),
            LockBackend::FileSystem(dir) => {
                let mut entries = match tokio::fs::read_dir(dir).await {
                    Ok(entries) => entries,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                    Err(e) => return Err(store_error(e)),
                };
                let mut keys = Vec::new();
                while let Some(entry) = entries.next_entry().await.map_err(store_error)? {
                    if let Some(name) = entry.file_name().to_str() {
                        if name.starts_with(prefix) {
                            keys.push(name.to_string());
                        }
                    }
                }
                Ok(keys)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match self {
            LockBackend::Memory(keys) => {
                keys.lock().remove(key);
                Ok(())
            }
            LockBackend::FileSystem(dir) => match tokio::fs::remove_file(dir.join(key)).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(store_error(e)),
            },
        }
    }
}

fn store_error(e: std::io::Error) -> ZkherdError {
    ZkherdError::StoreUnavailable(format!("lock storage: {}", e))
}

/// A pseudo-lock handle for one key prefix.
///
/// A handle holds at most one key at a time. Dropping a held handle does not
/// release the key; call [`PseudoLock::unlock`] (or let it expire).
pub struct PseudoLock {
    backend: LockBackend,
    prefix: String,
    policy: LockPolicy,
    held: Mutex<Option<LockKey>>,
}

impl PseudoLock {
    pub fn new(backend: LockBackend, prefix: impl Into<String>, policy: LockPolicy) -> Self {
        Self {
            backend,
            prefix: prefix.into(),
            policy,
            held: Mutex::new(None),
        }
    }

    pub fn policy(&self) -> &LockPolicy {
        &self.policy
    }

    pub fn is_held(&self) -> bool {
        self.held.lock().is_some()
    }

    /// Attempts to acquire the lock, waiting at most `max_wait`.
    ///
    /// # Returns
    /// - `Ok(true)` - lock acquired (or already held by this handle)
    /// - `Ok(false)` - someone else held it for the whole wait
    /// - `Err(InvalidConfig)` - `max_wait` is shorter than the settling period
    /// - `Err(StoreUnavailable)` - storage failed, or our own key vanished
    pub async fn lock(&self, max_wait: Duration) -> Result<bool> {
        self.policy.validate_wait(max_wait)?;
        if self.is_held() {
            return Ok(true);
        }

        let ours = LockKey::new(self.prefix.clone(), now_ms(), rand::random::<u64>());
        let ours_raw = ours.to_string();
        self.backend.create(&ours_raw).await?;
        debug!("Created lock key {}", ours_raw);

        let started = Instant::now();
        let mut missing_since: Option<Instant> = None;

        loop {
            match self.poll_once(&ours, &mut missing_since).await {
                Ok(true) => {
                    *self.held.lock() = Some(ours);
                    return Ok(true);
                }
                Ok(false) => {}
                Err(e) => {
                    if let Err(cleanup) = self.backend.delete(&ours_raw).await {
                        warn!("Could not delete lock key {}: {}", ours_raw, cleanup);
                    }
                    return Err(e);
                }
            }

            if started.elapsed() >= max_wait {
                debug!("Timed out waiting for lock {}", self.prefix);
                self.backend.delete(&ours_raw).await?;
                return Ok(false);
            }

            tokio::time::sleep(self.policy.polling).await;
        }
    }

    async fn poll_once(&self, ours: &LockKey, missing_since: &mut Option<Instant>) -> Result<bool> {
        let now = now_ms();
        let mut live = Vec::new();

        for raw in self.backend.list(&self.prefix).await? {
            let Some(key) = LockKey::parse(&self.prefix, &raw) else {
                continue;
            };
            if key != *ours && self.policy.is_expired(&key, now) {
                info!("Deleting abandoned lock key {}", raw);
                self.backend.delete(&raw).await?;
                continue;
            }
            live.push(key);
        }

        if !live.contains(ours) {
            let since = missing_since.get_or_insert_with(Instant::now);
            if since.elapsed() > self.policy.missing_key_limit() {
                warn!("Lock key {} has been missing for {:?}", ours, since.elapsed());
                return Err(ZkherdError::StoreUnavailable(format!(
                    "lock key {} disappeared from the store",
                    ours
                )));
            }
            return Ok(false);
        }
        *missing_since = None;

        Ok(self.policy.owns(ours, &live, now))
    }

    /// Releases the lock. Does nothing if this handle does not hold it.
    pub async fn unlock(&self) -> Result<()> {
        let key = self.held.lock().take();
        if let Some(key) = key {
            self.backend.delete(&key.to_string()).await?;
            debug!("Released lock key {}", key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_backend() -> LockBackend {
        LockBackend::Memory(Arc::new(Mutex::new(BTreeSet::new())))
    }

    fn settling_policy() -> LockPolicy {
        LockPolicy {
            settling: Duration::from_millis(100),
            timeout: Duration::from_secs(60),
            polling: Duration::from_millis(10),
            missing_key_factor: 10,
        }
    }

    #[tokio::test]
    async fn test_lock_and_unlock() {
        let lock = PseudoLock::new(memory_backend(), "cfg", LockPolicy::immediate());
        assert!(lock.lock(Duration::from_secs(1)).await.unwrap());
        assert!(lock.is_held());
        // re-entry on the same handle
        assert!(lock.lock(Duration::from_secs(1)).await.unwrap());
        lock.unlock().await.unwrap();
        assert!(!lock.is_held());
    }

    #[tokio::test]
    async fn test_second_contender_times_out_then_succeeds_after_unlock() {
        let backend = memory_backend();
        let first = PseudoLock::new(backend.clone(), "cfg", settling_policy());
        let second = PseudoLock::new(backend.clone(), "cfg", settling_policy());

        assert!(first.lock(Duration::from_secs(1)).await.unwrap());
        assert!(!second.lock(Duration::from_millis(300)).await.unwrap());

        first.unlock().await.unwrap();
        assert!(second.lock(Duration::from_secs(1)).await.unwrap());
        second.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_contenders_exclusive() {
        let backend = memory_backend();
        let a = Arc::new(PseudoLock::new(backend.clone(), "cfg", settling_policy()));
        let b = Arc::new(PseudoLock::new(backend.clone(), "cfg", settling_policy()));

        let (ra, rb) = tokio::join!(
            a.lock(Duration::from_millis(500)),
            b.lock(Duration::from_millis(500))
        );
        let winners = [ra.unwrap(), rb.unwrap()].iter().filter(|w| **w).count();
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_different_prefixes_do_not_contend() {
        let backend = memory_backend();
        let a = PseudoLock::new(backend.clone(), "alpha", LockPolicy::immediate());
        let b = PseudoLock::new(backend.clone(), "beta", LockPolicy::immediate());
        assert!(a.lock(Duration::from_millis(100)).await.unwrap());
        assert!(b.lock(Duration::from_millis(100)).await.unwrap());
    }

    #[tokio::test]
    async fn test_abandoned_key_is_reaped() {
        let backend = memory_backend();
        if let LockBackend::Memory(keys) = &backend {
            keys.lock().insert(LockKey::new("cfg", 1, 1).to_string());
        }
        let lock = PseudoLock::new(backend.clone(), "cfg", LockPolicy::immediate());
        assert!(lock.lock(Duration::from_millis(500)).await.unwrap());

        let remaining = backend.list("cfg").await.unwrap();
        assert_eq!(remaining.len(), 1);
    }

    #[tokio::test]
    async fn test_vanished_key_fails_the_attempt() {
        let backend = memory_backend();
        let policy = LockPolicy {
            settling: Duration::from_millis(200),
            timeout: Duration::from_secs(60),
            polling: Duration::from_millis(10),
            missing_key_factor: 1,
        };
        let lock = PseudoLock::new(backend.clone(), "cfg", policy);

        let wiper = {
            let backend = backend.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                if let LockBackend::Memory(keys) = &backend {
                    keys.lock().clear();
                }
            })
        };

        let err = lock.lock(Duration::from_secs(2)).await.unwrap_err();
        wiper.await.unwrap();
        assert!(matches!(err, ZkherdError::StoreUnavailable(_)));
        assert!(!lock.is_held());
        assert!(backend.list("cfg").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wait_shorter_than_settling_is_rejected() {
        let lock = PseudoLock::new(memory_backend(), "cfg", settling_policy());
        let err = lock.lock(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, ZkherdError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_filesystem_backend_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LockBackend::FileSystem(dir.path().join("locks"));
        let first = PseudoLock::new(backend.clone(), "cfg", settling_policy());
        let second = PseudoLock::new(backend.clone(), "cfg", settling_policy());

        assert!(first.lock(Duration::from_secs(1)).await.unwrap());
        assert!(!second.lock(Duration::from_millis(250)).await.unwrap());
        first.unlock().await.unwrap();
        assert!(backend.list("cfg").await.unwrap().is_empty());
    }
}
