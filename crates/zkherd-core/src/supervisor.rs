use parking_lot::Mutex;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use zkherd_client::ClientConfig;
use zkherd_common::protocol::error::{Result, ZkherdError};

use crate::activity::Activity;
use crate::automanage::{AutoManageConfig, AutomaticInstanceManagement};
use crate::backup::{BackupEntry, BackupSource, FileSystemBackupSource};
use crate::cleanup::Cleanup;
use crate::cluster::{cluster_status, ClusterStatus, DEFAULT_FAN_OUT};
use crate::config::{
    CancelMode, ConfigManager, ConfigManagerOptions, InstanceConfig, IntConfig,
    RollingConfigState,
};
use crate::monitor::{tcp_status_protocol, MonitorConfig, MonitorRunningInstance, StatusProtocolFactory};
use crate::process::{ProcessOperations, StandardProcessOperations};
use crate::remote::{
    HttpRemoteInstanceClient, LocalInstance, RemoteInstanceRequest, RemoteInstanceRequestClient,
};
use crate::state::{ControlPanel, ControlPanelSwitch, FourLetterWord, InstanceStatus, SharedInstanceState};
use crate::store::ConfigStore;

/// Default port every instance serves JSON-RPC on.
pub const DEFAULT_PEER_PORT: u16 = 8181;

/// Process-level settings for one supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// This instance's hostname, as it appears in the server list
    pub hostname: String,
    /// Port peers serve JSON-RPC on
    ///
    /// Default: 8181
    pub peer_port: u16,
    /// Client settings for peer requests
    pub client: ClientConfig,
    pub config_manager: ConfigManagerOptions,
    pub monitor: MonitorConfig,
    pub automanage: AutoManageConfig,
    /// Upper bound on concurrent peer requests for cluster status
    pub fan_out: usize,
    /// Directory holding backups, if any
    pub backup_dir: Option<PathBuf>,
}

impl SupervisorConfig {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            peer_port: DEFAULT_PEER_PORT,
            client: ClientConfig::default(),
            config_manager: ConfigManagerOptions::default(),
            monitor: MonitorConfig::default(),
            automanage: AutoManageConfig::default(),
            fan_out: DEFAULT_FAN_OUT,
            backup_dir: None,
        }
    }
}

/// The collaborators a supervisor drives. Replaced with fakes in tests.
pub struct Collaborators {
    pub process: Arc<dyn ProcessOperations>,
    pub protocols: StatusProtocolFactory,
    pub peers: Arc<dyn RemoteInstanceRequestClient>,
}

impl Collaborators {
    /// Shell scripts, four-letter words over TCP and HTTP to peers.
    pub fn standard(settings: &SupervisorConfig) -> Self {
        Self {
            process: Arc::new(StandardProcessOperations::new(settings.hostname.clone())),
            protocols: tcp_status_protocol(),
            peers: Arc::new(HttpRemoteInstanceClient::new(
                settings.peer_port,
                settings.client.clone(),
            )),
        }
    }
}

/// Supervises one ZooKeeper server and takes part in ensemble coordination.
///
/// The supervisor owns every component of an instance and the background
/// tasks that drive them:
///
/// 1. **Config poll**: re-reads the shared store every `check-ms`, or at once
///    when a peer sends `config_changed`
/// 2. **Monitor**: classifies the local server, restarts it when needed and
///    advances rolling config changes
/// 3. **Automatic instance management**: heartbeats, self-registration and
///    stale member eviction
/// 4. **Cleanup**: the server's snapshot/log cleanup and stale heartbeats
///
/// It is also the target of every JSON-RPC method; the HTTP layer only
/// decodes parameters and forwards here.
///
/// # Example
/// ```no_run
/// # use zkherd_core::{Supervisor, SupervisorConfig, MemoryConfigStore};
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let supervisor = Supervisor::new(
///     SupervisorConfig::new("zk1"),
///     MemoryConfigStore::new().into(),
/// ).await?;
/// supervisor.start();
/// // ...
/// supervisor.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct Supervisor {
    hostname: String,
    settings: SupervisorConfig,
    manager: Arc<ConfigManager>,
    panel: Arc<ControlPanel>,
    shared: Arc<SharedInstanceState>,
    remote: RemoteInstanceRequest,
    protocols: StatusProtocolFactory,
    monitor: Arc<MonitorRunningInstance>,
    automanage: Arc<AutomaticInstanceManagement>,
    cleanup: Arc<Cleanup>,
    backups: Option<Arc<dyn BackupSource>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Supervisor {
    /// Creates a supervisor with the standard collaborators.
    ///
    /// # Errors
    /// `StoreUnavailable` if the initial config load fails.
    pub async fn new(settings: SupervisorConfig, store: ConfigStore) -> Result<Self> {
        let collaborators = Collaborators::standard(&settings);
        Self::with_collaborators(settings, store, collaborators).await
    }

    pub async fn with_collaborators(
        settings: SupervisorConfig,
        store: ConfigStore,
        collaborators: Collaborators,
    ) -> Result<Self> {
        let hostname = settings.hostname.clone();
        if hostname.trim().is_empty() {
            return Err(ZkherdError::InvalidConfig("hostname must not be empty".into()));
        }

        let manager = Arc::new(
            ConfigManager::new(hostname.clone(), store, settings.config_manager.clone()).await?,
        );
        let panel = Arc::new(ControlPanel::default());
        let shared = Arc::new(SharedInstanceState::new());
        let local = Arc::new(LocalInstance::new(
            hostname.clone(),
            shared.clone(),
            manager.poll_trigger(),
        ));
        let remote = RemoteInstanceRequest::new(hostname.clone(), collaborators.peers, local);

        let monitor = Arc::new(MonitorRunningInstance::new(
            manager.clone(),
            panel.clone(),
            collaborators.process.clone(),
            collaborators.protocols.clone(),
            shared.clone(),
            remote.clone(),
            settings.monitor.clone(),
        ));
        let automanage = Arc::new(AutomaticInstanceManagement::new(
            manager.clone(),
            shared.clone(),
            remote.clone(),
            settings.automanage.clone(),
        ));
        let cleanup = Arc::new(Cleanup::new(
            manager.clone(),
            panel.clone(),
            collaborators.process,
        ));
        let backups = settings
            .backup_dir
            .clone()
            .map(|dir| Arc::new(FileSystemBackupSource::new(dir)) as Arc<dyn BackupSource>);

        Ok(Self {
            hostname,
            settings,
            manager,
            panel,
            shared,
            remote,
            protocols: collaborators.protocols,
            monitor,
            automanage,
            cleanup,
            backups,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawns the background tasks. Calling it twice has no effect.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        info!(
            "Starting supervisor for {} (store: {})",
            self.hostname,
            self.manager.store().describe()
        );

        let manager = self.manager.clone();
        let period_source = self.manager.clone();
        tasks.push(
            Activity::new("config poll")
                .nudged_by(self.manager.poll_trigger())
                .delay_first_run()
                .spawn(
                    self.cancel.clone(),
                    move || check_period(&period_source.config()),
                    move || {
                        let manager = manager.clone();
                        async move { manager.poll().await.map(|_| ()) }
                    },
                ),
        );
        tasks.push(self.monitor.clone().spawn(self.cancel.clone()));
        tasks.push(self.automanage.clone().spawn(self.cancel.clone()));
        tasks.extend(self.cleanup.clone().spawn(self.cancel.clone()));
    }

    /// Stops every background task and waits for them to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!("Supervisor for {} stopped", self.hostname);
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn config_manager(&self) -> &Arc<ConfigManager> {
        &self.manager
    }

    pub fn control_panel(&self) -> &Arc<ControlPanel> {
        &self.panel
    }

    pub fn shared_state(&self) -> &Arc<SharedInstanceState> {
        &self.shared
    }

    pub fn remote(&self) -> &RemoteInstanceRequest {
        &self.remote
    }

    pub fn monitor(&self) -> &Arc<MonitorRunningInstance> {
        &self.monitor
    }

    pub fn automatic_instance_management(&self) -> &Arc<AutomaticInstanceManagement> {
        &self.automanage
    }

    /// This instance's state as peers see it.
    pub fn state(&self) -> InstanceStatus {
        self.shared.status(&self.hostname)
    }

    /// Asks the poll task to re-read the store now.
    pub fn config_changed(&self) {
        self.manager.poll_trigger().notify_one();
    }

    pub fn get_config(&self) -> Value {
        let loaded = self.manager.loaded();
        json!({
            "hostname": self.hostname,
            "version": loaded.version,
            "store": self.manager.store().describe(),
            "shared": self.manager.store().is_shared(),
            "config": loaded.collection.to_json(),
            "rolling_state": loaded.collection.rolling_state(),
            "control_panel": self.panel.to_json(),
        })
    }

    /// Applies `overrides` to the root config and commits it directly.
    pub async fn update_config(&self, overrides: &Value) -> Result<bool> {
        let config = self.manager.loaded().collection.root.with_overrides(overrides)?;
        self.manager.update_config(config).await
    }

    /// Applies `overrides` to the root config and rolls it out host by host,
    /// leader last.
    pub async fn start_rolling_config(&self, overrides: &Value) -> Result<bool> {
        let root = self.manager.loaded().collection.root.clone();
        let config = root.with_overrides(overrides)?;
        let status = cluster_status(&self.remote, &root.server_list(), self.settings.fan_out).await;
        self.manager
            .start_rolling_config(config, status.leader())
            .await
    }

    pub async fn cancel_rolling_config(&self, mode: CancelMode) -> Result<bool> {
        self.manager.cancel_rolling_config(mode).await
    }

    pub fn rolling_state(&self) -> RollingConfigState {
        self.manager.rolling_config_state()
    }

    /// State of every member of the server list this host is running with.
    pub async fn cluster_status(&self) -> ClusterStatus {
        cluster_status(
            &self.remote,
            &self.manager.config().server_list(),
            self.settings.fan_out,
        )
        .await
    }

    /// Sends `word` to the local server and returns its raw answer.
    pub async fn four_letter_word(&self, word: FourLetterWord) -> String {
        let config = self.manager.config();
        (self.protocols)(&config).send(word).await
    }

    pub fn set_control_panel(&self, switch: ControlPanelSwitch, value: bool) {
        info!("Control panel: {:?} set to {}", switch, value);
        self.panel.set(switch, value);
    }

    pub async fn backups(&self) -> Result<Vec<BackupEntry>> {
        match &self.backups {
            Some(source) => source.list().await,
            None => Ok(Vec::new()),
        }
    }

    /// Reads one backup entry in full.
    pub async fn open_backup(&self, name: &str) -> Result<Vec<u8>> {
        match &self.backups {
            Some(source) => source.open(name).await,
            None => Err(ZkherdError::InvalidConfig(
                "no backup directory is configured".to_string(),
            )),
        }
    }

    pub fn info(&self) -> Value {
        json!({
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "hostname": self.hostname,
            "store": self.manager.store().describe(),
            "peer_port": self.settings.peer_port,
        })
    }
}

fn check_period(config: &InstanceConfig) -> Duration {
    Duration::from_millis(config.uint(IntConfig::CheckMs).max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigCollection, StringConfig};
    use crate::lock::LockPolicy;
    use crate::process::testing::FakeProcess;
    use crate::remote::testing::FakePeers;
    use crate::state::four_letter_word::testing::ScriptedProtocol;
    use crate::state::{InstanceStateType, StatusProtocol};
    use crate::store::MemoryConfigStore;

    fn settings(hostname: &str) -> SupervisorConfig {
        let mut settings = SupervisorConfig::new(hostname);
        settings.config_manager = ConfigManagerOptions {
            lock_wait: Duration::from_millis(500),
            lock_policy: LockPolicy::immediate(),
        };
        settings
    }

    async fn supervisor(store: &MemoryConfigStore, peers: Arc<FakePeers>) -> (Supervisor, Arc<FakeProcess>) {
        let process = Arc::new(FakeProcess::default());
        let protocol = Arc::new(ScriptedProtocol::new("imok", "Mode: follower\n"));
        let collaborators = Collaborators {
            process: process.clone(),
            protocols: Arc::new(move |_: &InstanceConfig| -> Arc<dyn StatusProtocol> { protocol.clone() }),
            peers,
        };
        let supervisor = Supervisor::with_collaborators(settings("a"), store.clone().into(), collaborators)
            .await
            .unwrap();
        (supervisor, process)
    }

    fn committed(spec: &str) -> MemoryConfigStore {
        MemoryConfigStore::with_collection(ConfigCollection::committed(
            InstanceConfig::default()
                .builder()
                .string(StringConfig::ServersSpec, spec)
                .build(),
        ))
    }

    #[tokio::test]
    async fn test_empty_hostname_rejected() {
        let result = Supervisor::with_collaborators(
            settings(" "),
            MemoryConfigStore::new().into(),
            Collaborators {
                process: Arc::new(FakeProcess::default()),
                protocols: tcp_status_protocol(),
                peers: Arc::new(FakePeers::default()),
            },
        )
        .await;
        assert!(matches!(result, Err(ZkherdError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_update_config_merges_overrides() {
        let store = committed("1:a");
        let (supervisor, _) = supervisor(&store, Arc::new(FakePeers::default())).await;

        assert!(supervisor
            .update_config(&json!({"check-ms": 1000}))
            .await
            .unwrap());
        let config = supervisor.config_manager().config();
        assert_eq!(config.int(IntConfig::CheckMs), 1000);
        assert_eq!(config.string(StringConfig::ServersSpec), "1:a");
        assert_eq!(supervisor.get_config()["version"], 2);
    }

    #[tokio::test]
    async fn test_start_rolling_puts_leader_last() {
        let store = committed("1:a,2:b,3:c");
        let peers = Arc::new(FakePeers::default());
        peers.respond(
            "b",
            serde_json::to_value(InstanceStatus::new("b", InstanceStateType::Serving, true, "1:a,2:b,3:c".into()))
                .unwrap(),
        );
        peers.fail("c", "down");
        let (supervisor, _) = supervisor(&store, peers).await;

        assert!(supervisor
            .start_rolling_config(&json!({"client-port": 2182}))
            .await
            .unwrap());
        let state = supervisor.rolling_state();
        assert_eq!(state.hosts, vec!["a", "c", "b"]);
        assert_eq!(state.status, "Applying to \"a\" (next will be \"c\")");

        assert!(supervisor
            .cancel_rolling_config(CancelMode::Rollback)
            .await
            .unwrap());
        assert_eq!(supervisor.rolling_state().status, "n/a");
    }

    #[tokio::test]
    async fn test_four_letter_word_and_control_panel() {
        let store = committed("1:a");
        let (supervisor, _) = supervisor(&store, Arc::new(FakePeers::default())).await;

        assert_eq!(supervisor.four_letter_word(FourLetterWord::Ruok).await, "imok");

        supervisor.set_control_panel(ControlPanelSwitch::Restarts, false);
        assert!(!supervisor.control_panel().is_set(ControlPanelSwitch::Restarts));
        assert_eq!(supervisor.get_config()["control_panel"]["restarts"], false);
    }

    #[tokio::test]
    async fn test_state_before_first_check_is_unknown() {
        let store = committed("1:a");
        let (supervisor, _) = supervisor(&store, Arc::new(FakePeers::default())).await;
        let state = supervisor.state();
        assert_eq!(state.hostname, "a");
        assert_eq!(state.state, InstanceStateType::Unknown);
        assert!(supervisor.backups().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_backup() {
        let store = committed("1:a");
        let (supervisor, _) = supervisor(&store, Arc::new(FakePeers::default())).await;
        assert!(matches!(
            supervisor.open_backup("snapshot.1").await,
            Err(ZkherdError::InvalidConfig(_))
        ));

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("snapshot.1"), b"zk").unwrap();
        let mut with_backups = settings("a");
        with_backups.backup_dir = Some(dir.path().to_path_buf());
        let supervisor = Supervisor::with_collaborators(
            with_backups,
            store.clone().into(),
            Collaborators {
                process: Arc::new(FakeProcess::default()),
                protocols: tcp_status_protocol(),
                peers: Arc::new(FakePeers::default()),
            },
        )
        .await
        .unwrap();

        let names: Vec<String> = supervisor
            .backups()
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.name)
            .collect();
        assert_eq!(names, vec!["snapshot.1"]);
        assert_eq!(supervisor.open_backup("snapshot.1").await.unwrap(), b"zk");
        assert!(supervisor.open_backup("../snapshot.1").await.is_err());
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let store = committed("1:a");
        let (supervisor, _) = supervisor(&store, Arc::new(FakePeers::default())).await;
        supervisor.start();
        supervisor.start();
        assert_eq!(supervisor.tasks.lock().len(), 5);

        supervisor.shutdown().await;
        assert!(supervisor.tasks.lock().is_empty());
    }

    #[tokio::test]
    async fn test_config_changed_wakes_poll() {
        let store = committed("1:a");
        let (supervisor, _) = supervisor(&store, Arc::new(FakePeers::default())).await;
        supervisor.start();

        // another instance writes a new version
        let other = ConfigManager::new("b", store.clone().into(), settings("b").config_manager)
            .await
            .unwrap();
        assert!(other
            .update_config(
                InstanceConfig::default()
                    .builder()
                    .string(StringConfig::ServersSpec, "1:a,2:b")
                    .build()
            )
            .await
            .unwrap());

        supervisor.config_changed();
        let mut seen = false;
        for _ in 0..50 {
            if supervisor.config_manager().loaded().version == 2 {
                seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        supervisor.shutdown().await;
        assert!(seen);
    }
}
