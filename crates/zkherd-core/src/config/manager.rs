//! In-memory view of the shared config and the rolling change protocol.
//!
//! [`ConfigManager`] caches the last collection read from the store and is
//! the only writer to it. Every write happens while holding both an
//! in-process mutex and the store's pseudo-lock, and is a compare-and-store
//! against the version this manager last observed, so a concurrent writer on
//! another instance makes the write fail instead of being overwritten.
//!
//! A rolling change stages a new config together with an ordered list of
//! hosts. Hosts up to the cursor run the staged config. The monitor calls
//! [`ConfigManager::check_rolling_config`] every cycle; once the host under
//! the cursor reports that it is serving with the staged membership, the
//! cursor moves on, and after the last host the staged config becomes the
//! root.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use zkherd_common::protocol::error::{Result, ZkherdError};
use zkherd_common::protocol::ClusterMethod;

use super::collection::{ConfigCollection, LoadedConfig, RollingConfig, RollingConfigState};
use super::instance::InstanceConfig;
use super::keys::{IntConfig, StringConfig};
use super::rolling::rolling_host_sequence;
use crate::lock::{LockPolicy, PseudoLock};
use crate::remote::RemoteInstanceRequest;
use crate::server_list::ServerList;
use crate::state::InstanceStateType;
use crate::store::{ConfigStore, StoreOutcome};

const CONFIG_LOCK_PREFIX: &str = "zkherd-config";

/// Receives every newly installed config, in registration order.
///
/// Called synchronously from whichever task installed the config, so
/// implementations must return quickly. A panicking listener is logged and
/// does not stop the others.
pub trait ConfigListener: Send + Sync {
    fn config_changed(&self, config: &LoadedConfig);
}

impl<F> ConfigListener for F
where
    F: Fn(&LoadedConfig) + Send + Sync,
{
    fn config_changed(&self, config: &LoadedConfig) {
        self(config)
    }
}

/// How to end a rolling change early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CancelMode {
    /// Discard the staged config and keep the root
    Rollback,
    /// Promote the staged config to root, skipping the remaining hosts
    ForceCommit,
}

impl fmt::Display for CancelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelMode::Rollback => f.write_str("rollback"),
            CancelMode::ForceCommit => f.write_str("force-commit"),
        }
    }
}

impl FromStr for CancelMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "rollback" => Ok(CancelMode::Rollback),
            "force-commit" => Ok(CancelMode::ForceCommit),
            other => Err(format!("unknown cancel mode: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigManagerOptions {
    /// Longest a mutation waits for the locks before failing with
    /// `LockTimeout`
    pub lock_wait: Duration,
    pub lock_policy: LockPolicy,
}

impl Default for ConfigManagerOptions {
    fn default() -> Self {
        Self {
            lock_wait: Duration::from_secs(10),
            lock_policy: LockPolicy::default(),
        }
    }
}

/// Proof that the caller holds both mutation locks.
///
/// Must be given back through [`MutationGuard::release`]; the pseudo-lock
/// key is not removed on drop.
pub struct MutationGuard<'a> {
    _update: tokio::sync::MutexGuard<'a, ()>,
    lock: &'a PseudoLock,
}

impl MutationGuard<'_> {
    pub async fn release(self) {
        if let Err(e) = self.lock.unlock().await {
            warn!("Failed to release config lock: {}", e);
        }
    }
}

/// Consecutive non-converged checks against one rolling target.
#[derive(Debug, Clone, PartialEq, Eq)]
struct AdvanceAttempt {
    hostname: String,
    version: u64,
    count: u32,
}

pub struct ConfigManager {
    hostname: String,
    store: ConfigStore,
    options: ConfigManagerOptions,
    current: RwLock<Arc<LoadedConfig>>,
    listeners: Mutex<Vec<Arc<dyn ConfigListener>>>,
    update_lock: tokio::sync::Mutex<()>,
    lock: PseudoLock,
    attempts: Mutex<Option<AdvanceAttempt>>,
    poll_trigger: Arc<Notify>,
}

impl ConfigManager {
    /// Creates a manager and performs the initial load.
    ///
    /// # Errors
    /// `StoreUnavailable` if the store cannot be read.
    pub async fn new(
        hostname: impl Into<String>,
        store: ConfigStore,
        options: ConfigManagerOptions,
    ) -> Result<Self> {
        let loaded = store.load_config().await?;
        let lock = store.new_pseudo_lock(CONFIG_LOCK_PREFIX, options.lock_policy.clone());
        let hostname = hostname.into();
        info!(
            "Loaded config version {} from {} for {}",
            loaded.version,
            store.describe(),
            hostname
        );

        Ok(Self {
            hostname,
            store,
            options,
            current: RwLock::new(Arc::new(loaded)),
            listeners: Mutex::new(Vec::new()),
            update_lock: tokio::sync::Mutex::new(()),
            lock,
            attempts: Mutex::new(None),
            poll_trigger: Arc::new(Notify::new()),
        })
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    /// Wakes the poll task early, for `config_changed` notifications.
    pub fn poll_trigger(&self) -> Arc<Notify> {
        self.poll_trigger.clone()
    }

    /// The cached collection and the version it was read at.
    pub fn loaded(&self) -> Arc<LoadedConfig> {
        self.current.read().clone()
    }

    /// The config this host should be running right now.
    pub fn config(&self) -> InstanceConfig {
        self.loaded()
            .collection
            .config_for_host(&self.hostname)
            .clone()
    }

    pub fn is_rolling(&self) -> bool {
        self.loaded().collection.is_rolling()
    }

    pub fn rolling_config_state(&self) -> RollingConfigState {
        self.loaded().collection.rolling_state()
    }

    pub fn add_listener(&self, listener: Arc<dyn ConfigListener>) {
        self.listeners.lock().push(listener);
    }

    /// Takes the in-process mutation mutex and then the pseudo-lock.
    ///
    /// Returns `Ok(None)` if either could not be taken within `wait`. The
    /// pseudo-lock is always given at least its settling period.
    pub async fn acquire_mutation(&self, wait: Duration) -> Result<Option<MutationGuard<'_>>> {
        let started = Instant::now();
        let update = match tokio::time::timeout(wait, self.update_lock.lock()).await {
            Ok(guard) => guard,
            Err(_) => return Ok(None),
        };

        let remaining = wait
            .saturating_sub(started.elapsed())
            .max(self.options.lock_policy.settling);
        if !self.lock.lock(remaining).await? {
            return Ok(None);
        }

        Ok(Some(MutationGuard {
            _update: update,
            lock: &self.lock,
        }))
    }

    async fn acquire_or_timeout(&self) -> Result<MutationGuard<'_>> {
        self.acquire_mutation(self.options.lock_wait)
            .await?
            .ok_or_else(|| {
                warn!("Could not acquire config lock within {:?}", self.options.lock_wait);
                ZkherdError::LockTimeout(self.options.lock_wait.as_millis() as u64)
            })
    }

    /// Replaces the root config.
    ///
    /// # Returns
    /// - `Ok(true)` - stored
    /// - `Ok(false)` - a rolling change is in progress, or the store moved
    ///   past the version this manager last saw
    pub async fn update_config(&self, config: InstanceConfig) -> Result<bool> {
        let guard = self.acquire_or_timeout().await?;
        let result = self.update_config_locked(&guard, config).await;
        guard.release().await;
        result
    }

    pub async fn update_config_locked(
        &self,
        _guard: &MutationGuard<'_>,
        config: InstanceConfig,
    ) -> Result<bool> {
        let loaded = self.loaded();
        if loaded.collection.is_rolling() {
            warn!("Not updating config: a rolling change is in progress");
            return Ok(false);
        }
        validate(&config)?;

        self.internal_store(ConfigCollection::committed(config), loaded.version)
            .await
    }

    /// Stages `config` and starts applying it host by host.
    ///
    /// `leader` is the hostname of the current leader, if known; it is moved
    /// to the end of the sequence. When the sequence comes out empty the
    /// config is committed directly.
    pub async fn start_rolling_config(
        &self,
        config: InstanceConfig,
        leader: Option<&str>,
    ) -> Result<bool> {
        let guard = self.acquire_or_timeout().await?;
        let result = self.start_rolling_config_locked(&guard, config, leader).await;
        guard.release().await;
        result
    }

    pub async fn start_rolling_config_locked(
        &self,
        _guard: &MutationGuard<'_>,
        config: InstanceConfig,
        leader: Option<&str>,
    ) -> Result<bool> {
        let loaded = self.loaded();
        if loaded.collection.is_rolling() {
            warn!("Not starting rolling config: one is already in progress");
            return Ok(false);
        }
        validate(&config)?;

        let sequence = rolling_host_sequence(
            &loaded.collection.root.server_list(),
            &config.server_list(),
            leader,
        );
        for warning in &sequence.warnings {
            warn!("{}", warning);
        }

        let collection = match RollingConfig::new(config.clone(), sequence.hosts, 0) {
            Some(rolling) => {
                info!(
                    "Starting rolling config to {:?} over hosts {:?}",
                    config.string(StringConfig::ServersSpec),
                    rolling.hosts
                );
                ConfigCollection {
                    root: loaded.collection.root.clone(),
                    rolling: Some(rolling),
                }
            }
            None => {
                info!("Rolling config has no hosts to visit, committing directly");
                ConfigCollection::committed(config)
            }
        };

        self.reset_attempts();
        self.internal_store(collection, loaded.version).await
    }

    /// Ends the in-flight rolling change.
    ///
    /// Returns `Ok(false)` if nothing is rolling once the store is re-read.
    pub async fn cancel_rolling_config(&self, mode: CancelMode) -> Result<bool> {
        let guard = self.acquire_or_timeout().await?;
        let result = self.cancel_rolling_config_locked(&guard, mode).await;
        guard.release().await;
        result
    }

    pub async fn cancel_rolling_config_locked(
        &self,
        _guard: &MutationGuard<'_>,
        mode: CancelMode,
    ) -> Result<bool> {
        let loaded = self.refresh_locked().await?;
        let Some(rolling) = loaded.collection.rolling.as_ref() else {
            debug!("Cancel requested but no rolling config is in progress");
            return Ok(false);
        };

        let root = match mode {
            CancelMode::Rollback => loaded.collection.root.clone(),
            CancelMode::ForceCommit => loaded.collection.target_config().clone(),
        };
        info!(
            "Cancelling rolling config ({}) at host {} of {:?}",
            mode,
            rolling.current_host(),
            rolling.hosts
        );

        self.reset_attempts();
        self.internal_store(ConfigCollection::committed(root), loaded.version)
            .await
    }

    /// Moves the cursor past `expected_host`, or commits if it is the last.
    ///
    /// The stored collection is re-read first; if its version or cursor no
    /// longer match what was checked, nothing is written.
    async fn advance_rolling_config(
        &self,
        expected_version: u64,
        expected_index: usize,
        expected_host: &str,
    ) -> Result<bool> {
        let guard = self.acquire_or_timeout().await?;
        let result = async {
            let loaded = self.refresh_locked().await?;
            let Some(rolling) = loaded.collection.rolling.as_ref() else {
                return Ok(false);
            };
            if loaded.version != expected_version
                || rolling.index != expected_index
                || rolling.current_host() != expected_host
            {
                info!(
                    "Rolling config moved while {} was being checked, not advancing",
                    expected_host
                );
                return Ok(false);
            }

            let collection = if rolling.is_last() {
                info!("Rolling config reached every host, committing");
                ConfigCollection::committed(rolling.config.clone())
            } else {
                let next = RollingConfig::new(
                    rolling.config.clone(),
                    rolling.hosts.clone(),
                    rolling.index + 1,
                );
                ConfigCollection {
                    root: loaded.collection.root.clone(),
                    rolling: next,
                }
            };
            self.internal_store(collection, loaded.version).await
        }
        .await;
        guard.release().await;
        result
    }

    /// One convergence check of the in-flight rolling change.
    ///
    /// Asks the host under the cursor for its state (answered in-process
    /// when that host is this one). If it is serving with the staged
    /// membership the change advances and the next host is told to re-read
    /// the config. Otherwise the check is counted, and after
    /// `rolling-max-attempts` checks against the same host the change is
    /// rolled back.
    pub async fn check_rolling_config(&self, remote: &RemoteInstanceRequest) -> Result<()> {
        let loaded = self.loaded();
        let Some(rolling) = loaded.collection.rolling.as_ref() else {
            self.reset_attempts();
            return Ok(());
        };

        let target = rolling.current_host().to_string();
        let staged = rolling.config.server_list();
        let status = remote.state_of(&target).await;
        let converged = status.state == InstanceStateType::Serving
            && ServerList::parse(&status.server_spec) == staged;

        if !converged {
            let count = self.record_attempt(&target, loaded.version);
            let max_attempts = loaded.collection.root.uint(IntConfig::RollingMaxAttempts) as u32;
            debug!(
                "Rolling target {} not converged ({}, check {} of {})",
                target,
                status.description,
                count,
                max_attempts
            );
            if max_attempts > 0 && count >= max_attempts {
                warn!(
                    "Rolling target {} did not converge after {} checks, rolling back",
                    target, count
                );
                self.cancel_rolling_config(CancelMode::Rollback).await?;
            }
            return Ok(());
        }

        self.reset_attempts();
        if !self
            .advance_rolling_config(loaded.version, rolling.index, &target)
            .await?
        {
            return Ok(());
        }

        if let Some(next) = self.loaded().collection.rolling.as_ref() {
            let next_host = next.current_host().to_string();
            let response = remote
                .invoke(&next_host, ClusterMethod::ConfigChanged, json!({}))
                .await;
            if let Some(error) = response.error_message {
                warn!("Could not notify {} of rolling config: {}", next_host, error);
            }
        }
        Ok(())
    }

    /// Seeds an empty store with `defaults`. Returns whether it wrote.
    pub async fn seed_if_empty(&self, defaults: InstanceConfig) -> Result<bool> {
        let guard = self.acquire_or_timeout().await?;
        let result = async {
            let loaded = self.refresh_locked().await?;
            if loaded.version != 0 {
                return Ok(false);
            }
            validate(&defaults)?;
            info!("Seeding empty config store with defaults");
            self.internal_store(ConfigCollection::committed(defaults), 0)
                .await
        }
        .await;
        guard.release().await;
        result
    }

    /// Re-reads the store and installs the result if its version changed.
    pub async fn poll(&self) -> Result<bool> {
        let _update = self.update_lock.lock().await;
        let before = self.loaded().version;
        let after = self.refresh_locked().await?.version;
        Ok(before != after)
    }

    async fn refresh_locked(&self) -> Result<Arc<LoadedConfig>> {
        let loaded = self.store.load_config().await?;
        let cached = self.loaded();
        if loaded.version == cached.version {
            return Ok(cached);
        }
        info!(
            "Config version changed {} -> {}",
            cached.version, loaded.version
        );
        Ok(self.install(loaded))
    }

    async fn internal_store(&self, collection: ConfigCollection, expected_version: u64) -> Result<bool> {
        match self.store.store_config(&collection, expected_version).await? {
            StoreOutcome::Stored(loaded) => {
                debug!("Stored config version {}", loaded.version);
                self.install(loaded);
                Ok(true)
            }
            StoreOutcome::Conflict { current_version } => {
                warn!(
                    "Config store moved to version {} (expected {}), change not applied",
                    current_version, expected_version
                );
                Ok(false)
            }
        }
    }

    /// Swaps in `loaded` and notifies listeners. The listener list lock is
    /// held for the whole swap so notifications never interleave.
    fn install(&self, loaded: LoadedConfig) -> Arc<LoadedConfig> {
        let loaded = Arc::new(loaded);
        let listeners = self.listeners.lock();
        *self.current.write() = loaded.clone();

        for listener in listeners.iter() {
            let outcome = catch_unwind(AssertUnwindSafe(|| listener.config_changed(&loaded)));
            if outcome.is_err() {
                error!("Config listener panicked on version {}", loaded.version);
            }
        }
        loaded
    }

    fn record_attempt(&self, hostname: &str, version: u64) -> u32 {
        let mut attempts = self.attempts.lock();
        match attempts.as_mut() {
            Some(a) if a.hostname == hostname && a.version == version => {
                a.count += 1;
                a.count
            }
            _ => {
                *attempts = Some(AdvanceAttempt {
                    hostname: hostname.to_string(),
                    version,
                    count: 1,
                });
                1
            }
        }
    }

    fn reset_attempts(&self) {
        *self.attempts.lock() = None;
    }
}

fn validate(config: &InstanceConfig) -> Result<()> {
    config.validate()
}
