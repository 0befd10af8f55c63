//! Reconciles the supervised server with the config it should be running.
//!
//! Every cycle classifies the local server and compares the result with the
//! previous cycle. A change to anything written into the server's own config
//! files (membership, ports, restart-significant settings) restarts the
//! server. Otherwise a not-serving or unknown server is restarted, after
//! which further restarts are held off for a while so a slow-starting server
//! is not restarted in a loop.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use zkherd_common::protocol::error::Result;

use crate::activity::Activity;
use crate::config::{ConfigManager, InstanceConfig, IntConfig};
use crate::process::ProcessOperations;
use crate::remote::RemoteInstanceRequest;
use crate::state::{
    Checker, ControlPanel, ControlPanelSwitch, InstanceState, InstanceStateType, ProbeResult,
    SharedInstanceState, StatusProtocol, TcpStatusProtocol,
};

/// Builds the status protocol for the config currently in force.
pub type StatusProtocolFactory = Arc<dyn Fn(&InstanceConfig) -> Arc<dyn StatusProtocol> + Send + Sync>;

/// Four-letter words over TCP to the local client port.
pub fn tcp_status_protocol() -> StatusProtocolFactory {
    Arc::new(|config: &InstanceConfig| -> Arc<dyn StatusProtocol> {
        Arc::new(TcpStatusProtocol::new(
            "localhost",
            config.port(IntConfig::ClientPort),
            Duration::from_millis(config.uint(IntConfig::ConnectionTimeoutMs)),
        ))
    })
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Restart hold-off, as a multiple of `check-ms`
    pub on_hold_factor: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self { on_hold_factor: 10 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    /// Membership or restart-significant config changed
    ConfigChanged,
    /// The server is not serving or did not answer
    NotServing,
}

/// What one monitor cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorAction {
    /// Nothing to do
    Steady,
    /// A restart was due but the hold-off window is open
    OnHold,
    /// A restart was due but the restart switch is off
    RestartsDisabled,
    /// This host left the server list; the server was stopped
    Stopped,
    Restarted(RestartReason),
    RestartFailed(RestartReason),
}

pub struct MonitorRunningInstance {
    hostname: String,
    config: Arc<ConfigManager>,
    checker: Checker,
    panel: Arc<ControlPanel>,
    process: Arc<dyn ProcessOperations>,
    protocols: StatusProtocolFactory,
    shared: Arc<SharedInstanceState>,
    remote: RemoteInstanceRequest,
    settings: MonitorConfig,
    last: Mutex<Option<InstanceState>>,
    hold_started: Mutex<Option<Instant>>,
}

impl MonitorRunningInstance {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<ConfigManager>,
        panel: Arc<ControlPanel>,
        process: Arc<dyn ProcessOperations>,
        protocols: StatusProtocolFactory,
        shared: Arc<SharedInstanceState>,
        remote: RemoteInstanceRequest,
        settings: MonitorConfig,
    ) -> Self {
        let hostname = config.hostname().to_string();
        Self {
            checker: Checker::new(hostname.clone()),
            hostname,
            config,
            panel,
            process,
            protocols,
            shared,
            remote,
            settings,
            last: Mutex::new(None),
            hold_started: Mutex::new(None),
        }
    }

    /// State recorded by the last cycle.
    pub fn current_state(&self) -> Option<InstanceState> {
        self.last.lock().clone()
    }

    /// Runs one reconciliation cycle.
    pub async fn do_work(&self) -> Result<MonitorAction> {
        let config = self.config.config();
        let protocol = (self.protocols)(&config);
        let state = self.checker.check(&config, &self.panel, protocol.as_ref()).await;

        let on_hold = self.update_hold(&config, state.state);
        let previous = self.last.lock().replace(state.clone());
        let changed = previous.as_ref() != Some(&state);
        if changed {
            info!("State: {}", state.state.description());
        }

        let config_changed = previous
            .as_ref()
            .map(|p| p.config_differs(&state))
            .unwrap_or(false);

        let action = if config_changed {
            info!("Server config has changed");
            self.on_config_changed(&config, &state).await
        } else if (changed || state.state == InstanceStateType::Unknown) && state.state.needs_restart() {
            if on_hold {
                info!("Start/restart is on hold");
                MonitorAction::OnHold
            } else {
                self.publish_restarting(&state);
                self.restart(&config, RestartReason::NotServing).await
            }
        } else {
            MonitorAction::Steady
        };

        if action == MonitorAction::Steady || action == MonitorAction::OnHold {
            self.shared.set(state);
            self.config.check_rolling_config(&self.remote).await?;
        }
        Ok(action)
    }

    /// Returns whether restarts are currently held off. Serving closes the
    /// window, as does its expiry.
    fn update_hold(&self, config: &InstanceConfig, state: InstanceStateType) -> bool {
        let mut hold = self.hold_started.lock();
        let Some(started) = *hold else {
            return false;
        };

        let window = Duration::from_millis(config.uint(IntConfig::CheckMs))
            .checked_mul(self.settings.on_hold_factor)
            .unwrap_or(Duration::MAX);
        if state == InstanceStateType::Serving || started.elapsed() >= window {
            *hold = None;
            return false;
        }
        true
    }

    async fn on_config_changed(&self, config: &InstanceConfig, state: &InstanceState) -> MonitorAction {
        if !self.panel.is_set(ControlPanelSwitch::Restarts) {
            warn!("Server config changed but restarts are turned off");
            self.shared.set(state.clone());
            return MonitorAction::RestartsDisabled;
        }

        match state.state {
            InstanceStateType::Latent => {
                self.shared.set(state.clone());
                MonitorAction::Steady
            }
            InstanceStateType::DownBecauseUnlisted => {
                info!("{} is no longer in the server list, stopping", self.hostname);
                self.publish_restarting(state);
                if let Err(e) = self.process.kill_instance(config).await {
                    error!("Could not stop server: {}", e);
                }
                MonitorAction::Stopped
            }
            _ => {
                self.publish_restarting(state);
                self.restart(config, RestartReason::ConfigChanged).await
            }
        }
    }

    /// Peers must not mistake the pre-restart server for a converged one.
    fn publish_restarting(&self, state: &InstanceState) {
        self.shared.set(InstanceState {
            state: InstanceStateType::Unknown,
            probe: ProbeResult::Skipped,
            ..state.clone()
        });
    }

    /// Kills then starts the server. Either way the hold-off window opens, so
    /// a server still booting on the next cycle is left alone.
    async fn restart(&self, config: &InstanceConfig, reason: RestartReason) -> MonitorAction {
        info!("Restarting server ({:?})", reason);
        *self.hold_started.lock() = Some(Instant::now());
        if let Err(e) = self.process.kill_instance(config).await {
            error!("Could not stop server, not starting it: {}", e);
            return MonitorAction::RestartFailed(reason);
        }
        match self.process.start_instance(config).await {
            Ok(()) => MonitorAction::Restarted(reason),
            Err(e) => {
                error!("Could not start server: {}", e);
                MonitorAction::RestartFailed(reason)
            }
        }
    }

    /// Runs [`Self::do_work`] every `check-ms`.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let config = self.config.clone();
        Activity::new("instance monitor").spawn(
            cancel,
            move || Duration::from_millis(config.config().uint(IntConfig::CheckMs).max(1)),
            move || {
                let monitor = self.clone();
                async move { monitor.do_work().await.map(|_| ()) }
            },
        )
    }
}
