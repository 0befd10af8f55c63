//! Automatic instance management.
//!
//! When `auto-manage-instances` is on, every instance periodically writes a
//! heartbeat to the shared store, adds itself to the server list if it is
//! missing, and removes members whose heartbeat went stale. Changes go out as
//! rolling config changes under the config lock, so only one instance edits
//! membership at a time.
//!
//! Membership is only edited while the ensemble has a leader and its status
//! has stayed unchanged for `auto-manage-instances-settling-period-ms`.

mod policy;

pub use policy::{plan, AutoManagePolicy, MemberHealth, Plan, PlanInput};

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zkherd_common::protocol::error::Result;

use crate::activity::Activity;
use crate::cluster::{cluster_status, ClusterStatus, DEFAULT_FAN_OUT};
use crate::config::{ConfigManager, InstanceConfig, IntConfig, MutationGuard};
use crate::remote::RemoteInstanceRequest;
use crate::server_list::ServerList;
use crate::state::{InstanceStateType, SharedInstanceState};

#[derive(Debug, Clone)]
pub struct AutoManageConfig {
    /// Time between passes. The config lock is waited for half of it.
    pub period: Duration,
    pub fan_out: usize,
}

impl Default for AutoManageConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(60),
            fan_out: DEFAULT_FAN_OUT,
        }
    }
}

/// What one pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoManageOutcome {
    /// `auto-manage-instances` is off
    Disabled,
    /// Another instance held the config lock for the whole wait
    LockUnavailable,
    /// Membership is left alone while a rolling change is in flight
    RollingInProgress,
    NoChange,
    /// Fixed-size ensemble is full and no member is stale
    NoRoom,
    /// Nobody reports being leader; waiting for quorum
    NotInQuorum,
    /// Cluster status changed within the settling period
    NotSettled,
    /// A rolling change to `servers` was started
    Changed { servers: String, reason: String },
    /// The store moved under us; the next pass retries
    NotApplied,
}

/// Remembers the last cluster status seen and since when it has held.
struct Settling {
    last: Option<ClusterStatus>,
    since: Instant,
}

impl Settling {
    fn new() -> Self {
        Self {
            last: None,
            since: Instant::now(),
        }
    }

    fn observe(&mut self, status: &ClusterStatus) {
        if self.last.as_ref() != Some(status) {
            self.last = Some(status.clone());
            self.since = Instant::now();
        }
    }

    fn is_settled(&self, period: Duration) -> bool {
        self.since.elapsed() >= period
    }
}

fn is_in_quorum(status: &ClusterStatus) -> bool {
    status.members.is_empty() || status.has_leader
}

pub struct AutomaticInstanceManagement {
    manager: Arc<ConfigManager>,
    shared: Arc<SharedInstanceState>,
    remote: RemoteInstanceRequest,
    settings: AutoManageConfig,
    settling: Mutex<Settling>,
}

impl AutomaticInstanceManagement {
    pub fn new(
        manager: Arc<ConfigManager>,
        shared: Arc<SharedInstanceState>,
        remote: RemoteInstanceRequest,
        settings: AutoManageConfig,
    ) -> Self {
        Self {
            manager,
            shared,
            remote,
            settings,
            settling: Mutex::new(Settling::new()),
        }
    }

    /// Runs one pass: heartbeat, then a membership change if one is due.
    pub async fn call(&self) -> Result<AutoManageOutcome> {
        let config = self.manager.config();
        if config.int(IntConfig::AutoManageInstances) == 0 {
            return Ok(AutoManageOutcome::Disabled);
        }

        self.manager
            .store()
            .write_heartbeat(self.manager.hostname())
            .await?;

        let Some(guard) = self.manager.acquire_mutation(self.settings.period / 2).await? else {
            debug!("Config lock busy, skipping automatic instance management pass");
            return Ok(AutoManageOutcome::LockUnavailable);
        };
        let result = self.do_work(&guard).await;
        guard.release().await;
        result
    }

    async fn do_work(&self, guard: &MutationGuard<'_>) -> Result<AutoManageOutcome> {
        let loaded = self.manager.loaded();
        let root = &loaded.collection.root;
        let servers = root.server_list();
        let hostname = self.manager.hostname();

        let ready = self
            .shared
            .get()
            .map(|s| s.state != InstanceStateType::Latent)
            .unwrap_or(false);
        let dead_period = Duration::from_millis(root.uint(IntConfig::DeadInstancePeriodMs));
        let mut members = self.member_health(&servers, hostname, dead_period).await?;

        // peers are only asked when someone might be dead or we might join
        let needs_status = (ready && !servers.contains(hostname))
            || members.iter().any(|m| m.heartbeat_alive == Some(false));
        let status = if needs_status {
            let status = cluster_status(&self.remote, &servers, self.settings.fan_out).await;
            let settled = {
                let mut settling = self.settling.lock();
                settling.observe(&status);
                settling.is_settled(Duration::from_millis(
                    root.uint(IntConfig::AutoManageInstancesSettlingPeriodMs),
                ))
            };
            if !is_in_quorum(&status) {
                info!("Ensemble is not currently in quorum, automatic instance management will wait for quorum");
                return Ok(AutoManageOutcome::NotInQuorum);
            }
            if !settled {
                info!("Ensemble state is not yet stable, automatic instance management will wait for stability");
                return Ok(AutoManageOutcome::NotSettled);
            }
            for member in &mut members {
                member.serving = status.is_serving(&member.hostname);
            }
            Some(status)
        } else {
            None
        };

        let planned = plan(&PlanInput {
            servers: &servers,
            hostname,
            ready,
            members: &members,
            policy: AutoManagePolicy::from_config(root),
            observer_threshold: root.uint(IntConfig::ObserverThreshold) as usize,
        });

        let (new_servers, reason) = match planned {
            Plan::NoChange => return Ok(AutoManageOutcome::NoChange),
            Plan::NoRoom => {
                info!(
                    "Fixed-size ensemble is full and no member is stale, not adding {}",
                    hostname
                );
                return Ok(AutoManageOutcome::NoRoom);
            }
            Plan::Change { servers, reason } => (servers, reason),
        };

        if loaded.collection.is_rolling() {
            info!(
                "Temporarily skipping automatic instance management while a rolling config is in progress: {}",
                reason
            );
            return Ok(AutoManageOutcome::RollingInProgress);
        }

        let spec = new_servers.to_spec_string();
        let new_config = adjusted(root, &new_servers);
        let leader = status.as_ref().and_then(ClusterStatus::leader);
        if self
            .manager
            .start_rolling_config_locked(guard, new_config, leader)
            .await?
        {
            info!("{}", reason);
            *self.settling.lock() = Settling::new();
            Ok(AutoManageOutcome::Changed {
                servers: spec,
                reason,
            })
        } else {
            warn!("Could not apply automatic instance management change: {}", reason);
            Ok(AutoManageOutcome::NotApplied)
        }
    }

    async fn member_health(
        &self,
        servers: &ServerList,
        hostname: &str,
        dead_period: Duration,
    ) -> Result<Vec<MemberHealth>> {
        let store = self.manager.store();
        let mut members = Vec::with_capacity(servers.len());
        for member in servers.hostnames().into_iter().filter(|h| h != hostname) {
            let last_heartbeat = store.last_heartbeat(&member).await?;
            let heartbeat_alive = store.is_heartbeat_alive(&member, dead_period).await?;
            members.push(MemberHealth {
                hostname: member,
                last_heartbeat,
                heartbeat_alive,
                serving: false,
            });
        }
        Ok(members)
    }

    /// Runs [`Self::call`] every period.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let period = self.settings.period;
        Activity::new("automatic instance management").spawn(
            cancel,
            move || period,
            move || {
                let management = self.clone();
                async move { management.call().await.map(|_| ()) }
            },
        )
    }
}

fn adjusted(root: &InstanceConfig, servers: &ServerList) -> InstanceConfig {
    root.builder().server_list(servers).build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CancelMode, ConfigCollection, ConfigManagerOptions, StringConfig};
    use crate::lock::LockPolicy;
    use crate::remote::testing::FakePeers;
    use crate::remote::LocalInstance;
    use crate::state::{InstanceState, InstanceStatus, ProbeResult};
    use crate::store::{ConfigStore, MemoryConfigStore};
    use std::time::SystemTime;
    use tokio::sync::Notify;

    struct Fixture {
        management: AutomaticInstanceManagement,
        manager: Arc<ConfigManager>,
        store: MemoryConfigStore,
        peers: Arc<FakePeers>,
        shared: Arc<SharedInstanceState>,
    }

    fn config(spec: &str) -> InstanceConfig {
        InstanceConfig::default()
            .builder()
            .string(StringConfig::ZookeeperInstallDirectory, "/opt/zk")
            .string(StringConfig::ZookeeperDataDirectory, "/var/zk")
            .string(StringConfig::ServersSpec, spec)
            .int(IntConfig::AutoManageInstances, 1)
            .int(IntConfig::AutoManageInstancesSettlingPeriodMs, 0)
            .build()
    }

    async fn fixture(hostname: &str, config: InstanceConfig) -> Fixture {
        let store = MemoryConfigStore::with_collection(ConfigCollection::committed(config));
        let manager = Arc::new(
            ConfigManager::new(
                hostname,
                ConfigStore::from(store.clone()),
                ConfigManagerOptions {
                    lock_wait: Duration::from_millis(500),
                    lock_policy: LockPolicy::immediate(),
                },
            )
            .await
            .unwrap(),
        );
        let peers = Arc::new(FakePeers::default());
        let shared = Arc::new(SharedInstanceState::new());
        let local = Arc::new(LocalInstance::new(hostname, shared.clone(), Arc::new(Notify::new())));
        let remote = RemoteInstanceRequest::new(hostname, peers.clone(), local);

        Fixture {
            management: AutomaticInstanceManagement::new(
                manager.clone(),
                shared.clone(),
                remote,
                AutoManageConfig {
                    period: Duration::from_millis(200),
                    fan_out: 4,
                },
            ),
            manager,
            store,
            peers,
            shared,
        }
    }

    fn set_local_state(shared: &SharedInstanceState, spec: &str, state: InstanceStateType) {
        shared.set(InstanceState {
            server_list: ServerList::parse(spec),
            connect_port: 2888,
            election_port: 3888,
            server_id: None,
            state,
            probe: ProbeResult::Skipped,
            restart_config: InstanceConfig::default().restart_significant(),
        });
    }

    fn serving(peers: &FakePeers, hostname: &str, leader: bool) {
        peers.respond(
            hostname,
            serde_json::to_value(InstanceStatus::new(
                hostname,
                InstanceStateType::Serving,
                leader,
                String::new(),
            ))
            .unwrap(),
        );
    }

    fn staged_spec(manager: &ConfigManager) -> String {
        manager
            .loaded()
            .collection
            .rolling
            .as_ref()
            .unwrap()
            .config
            .string(StringConfig::ServersSpec)
            .to_string()
    }

    #[tokio::test]
    async fn test_disabled_does_nothing() {
        let f = fixture("a", config("1:a").builder().int(IntConfig::AutoManageInstances, 0).build()).await;
        assert_eq!(f.management.call().await.unwrap(), AutoManageOutcome::Disabled);
        assert!(f.store.last_heartbeat("a").is_none());
    }

    #[tokio::test]
    async fn test_no_change_when_everyone_is_alive() {
        let f = fixture("a", config("1:a,2:b,3:c")).await;
        set_local_state(&f.shared, "1:a,2:b,3:c", InstanceStateType::Serving);
        f.store.set_heartbeat("b", SystemTime::now());
        f.store.set_heartbeat("c", SystemTime::now());

        assert_eq!(f.management.call().await.unwrap(), AutoManageOutcome::NoChange);
        assert!(f.store.last_heartbeat("a").is_some());
        assert!(!f.manager.is_rolling());
        assert!(f.peers.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_stale_member_removed() {
        let f = fixture("a", config("1:a,2:b,3:c")).await;
        set_local_state(&f.shared, "1:a,2:b,3:c", InstanceStateType::Serving);
        f.store
            .set_heartbeat("b", SystemTime::now() - Duration::from_secs(2 * 60 * 60));
        f.store.set_heartbeat("c", SystemTime::now());
        f.peers.fail("b", "connection refused");
        serving(&f.peers, "c", true);

        let outcome = f.management.call().await.unwrap();
        assert_eq!(
            outcome,
            AutoManageOutcome::Changed {
                servers: "1:a,3:c".into(),
                reason: "Removing stale instance(s) from servers list: b".into(),
            }
        );
        assert_eq!(staged_spec(&f.manager), "1:a,3:c");

        // leader goes last
        let hosts = f.manager.loaded().collection.rolling.as_ref().unwrap().hosts.clone();
        assert_eq!(hosts, vec!["a".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn test_adds_itself_to_empty_ensemble() {
        let f = fixture("new", config("")).await;
        set_local_state(&f.shared, "", InstanceStateType::DownBecauseUnlisted);

        let outcome = f.management.call().await.unwrap();
        assert!(matches!(outcome, AutoManageOutcome::Changed { ref servers, .. } if servers == "1:new"));
        assert_eq!(staged_spec(&f.manager), "1:new");

        // idempotent once committed
        assert!(f.manager.cancel_rolling_config(CancelMode::ForceCommit).await.unwrap());
        set_local_state(&f.shared, "1:new", InstanceStateType::Serving);
        assert_eq!(f.management.call().await.unwrap(), AutoManageOutcome::NoChange);
    }

    #[tokio::test]
    async fn test_latent_instance_does_not_register() {
        let f = fixture("new", config("1:a")).await;
        assert_eq!(f.management.call().await.unwrap(), AutoManageOutcome::NoChange);

        set_local_state(&f.shared, "1:a", InstanceStateType::Latent);
        assert_eq!(f.management.call().await.unwrap(), AutoManageOutcome::NoChange);
    }

    #[tokio::test]
    async fn test_fixed_ensemble_adds_observer() {
        let base = config("1:a,2:b,3:c")
            .builder()
            .int(IntConfig::AutoManageInstancesFixedEnsembleSize, 4)
            .int(IntConfig::ObserverThreshold, 3)
            .build();
        let f = fixture("new", base).await;
        set_local_state(&f.shared, "1:a,2:b,3:c", InstanceStateType::DownBecauseUnlisted);
        for host in ["a", "b", "c"] {
            f.store.set_heartbeat(host, SystemTime::now());
            serving(&f.peers, host, host == "a");
        }

        let outcome = f.management.call().await.unwrap();
        assert!(matches!(outcome, AutoManageOutcome::Changed { .. }));
        assert!(staged_spec(&f.manager).contains("O:4:new"));
    }

    #[tokio::test]
    async fn test_repeat_pass_while_rolling_is_skipped() {
        let f = fixture("a", config("1:a,2:b,3:c")).await;
        set_local_state(&f.shared, "1:a,2:b,3:c", InstanceStateType::Serving);
        f.store
            .set_heartbeat("b", SystemTime::now() - Duration::from_secs(2 * 60 * 60));
        f.store.set_heartbeat("c", SystemTime::now());
        f.peers.fail("b", "down");
        serving(&f.peers, "c", true);

        assert!(matches!(
            f.management.call().await.unwrap(),
            AutoManageOutcome::Changed { .. }
        ));
        let version = f.manager.loaded().version;

        assert_eq!(
            f.management.call().await.unwrap(),
            AutoManageOutcome::RollingInProgress
        );
        assert_eq!(f.manager.loaded().version, version);
    }

    #[tokio::test]
    async fn test_stale_but_serving_member_is_kept() {
        let f = fixture("a", config("1:a,2:b,3:c")).await;
        set_local_state(&f.shared, "1:a,2:b,3:c", InstanceStateType::Serving);
        f.store
            .set_heartbeat("b", SystemTime::now() - Duration::from_secs(2 * 60 * 60));
        f.store.set_heartbeat("c", SystemTime::now());
        serving(&f.peers, "b", false);
        serving(&f.peers, "c", true);

        assert_eq!(f.management.call().await.unwrap(), AutoManageOutcome::NoChange);
        assert_eq!(f.peers.calls_to(zkherd_common::protocol::ClusterMethod::State).len(), 2);
    }

    #[tokio::test]
    async fn test_waits_for_quorum() {
        let f = fixture("a", config("1:a,2:b,3:c")).await;
        set_local_state(&f.shared, "1:a,2:b,3:c", InstanceStateType::Serving);
        f.store
            .set_heartbeat("b", SystemTime::now() - Duration::from_secs(2 * 60 * 60));
        f.store.set_heartbeat("c", SystemTime::now());
        f.peers.fail("b", "down");
        serving(&f.peers, "c", false);

        assert_eq!(f.management.call().await.unwrap(), AutoManageOutcome::NotInQuorum);
        assert!(!f.manager.is_rolling());

        // a leader shows up
        serving(&f.peers, "c", true);
        assert!(matches!(
            f.management.call().await.unwrap(),
            AutoManageOutcome::Changed { .. }
        ));
    }

    #[tokio::test]
    async fn test_waits_for_status_to_settle() {
        let base = config("1:a,2:b,3:c")
            .builder()
            .int(IntConfig::AutoManageInstancesSettlingPeriodMs, 100)
            .build();
        let f = fixture("new", base).await;
        set_local_state(&f.shared, "1:a,2:b,3:c", InstanceStateType::DownBecauseUnlisted);
        for host in ["a", "b", "c"] {
            f.store.set_heartbeat(host, SystemTime::now());
            serving(&f.peers, host, host == "a");
        }

        assert_eq!(f.management.call().await.unwrap(), AutoManageOutcome::NotSettled);

        // a change in status restarts the clock
        tokio::time::sleep(Duration::from_millis(150)).await;
        f.peers.fail("c", "restarting");
        assert_eq!(f.management.call().await.unwrap(), AutoManageOutcome::NotSettled);

        tokio::time::sleep(Duration::from_millis(150)).await;
        let outcome = f.management.call().await.unwrap();
        assert!(matches!(outcome, AutoManageOutcome::Changed { ref servers, .. } if servers == "1:a,2:b,3:c,4:new"));
        assert_eq!(staged_spec(&f.manager), "1:a,2:b,3:c,4:new");
    }

    #[tokio::test]
    async fn test_lock_held_elsewhere_skips_pass() {
        let f = fixture("a", config("1:a")).await;
        let other = ConfigStore::from(f.store.clone()).new_pseudo_lock("zkherd-config", LockPolicy::immediate());
        assert!(other.lock(Duration::from_millis(100)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(
            f.management.call().await.unwrap(),
            AutoManageOutcome::LockUnavailable
        );
        // heartbeat is written regardless
        assert!(f.store.last_heartbeat("a").is_some());
        other.unlock().await.unwrap();
    }
}
