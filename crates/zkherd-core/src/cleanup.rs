//! Periodic housekeeping: old snapshots/logs of the supervised server and
//! stale heartbeats in the shared store.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use zkherd_common::protocol::error::Result;

use crate::activity::Activity;
use crate::config::{ConfigManager, IntConfig};
use crate::process::ProcessOperations;
use crate::state::{ControlPanel, ControlPanelSwitch};

/// Heartbeats older than this are deleted from the store.
pub const HEARTBEAT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// How often stale heartbeats are swept.
pub const HEARTBEAT_CLEAN_PERIOD: Duration = Duration::from_secs(60 * 60);

pub struct Cleanup {
    config: Arc<ConfigManager>,
    panel: Arc<ControlPanel>,
    process: Arc<dyn ProcessOperations>,
}

impl Cleanup {
    pub fn new(
        config: Arc<ConfigManager>,
        panel: Arc<ControlPanel>,
        process: Arc<dyn ProcessOperations>,
    ) -> Self {
        Self {
            config,
            panel,
            process,
        }
    }

    /// Runs the server's cleanup script once.
    ///
    /// Returns `Ok(false)` when skipped: the switch is off or the server is
    /// not configured.
    pub async fn do_work(&self) -> Result<bool> {
        if !self.panel.is_set(ControlPanelSwitch::Cleanup) {
            debug!("Cleanup is turned off");
            return Ok(false);
        }
        let config = self.config.config();
        if !config.is_runnable() {
            return Ok(false);
        }

        self.process.cleanup_instance(&config).await?;
        Ok(true)
    }

    /// Removes heartbeats nobody has refreshed in [`HEARTBEAT_MAX_AGE`].
    pub async fn clean_heartbeats(&self) -> Result<usize> {
        let removed = self
            .config
            .store()
            .clean_heartbeats(HEARTBEAT_MAX_AGE)
            .await?;
        if removed > 0 {
            info!("Removed {} stale heartbeat(s)", removed);
        }
        Ok(removed)
    }

    /// Spawns the cleanup task (every `cleanup-period-ms`, first run after
    /// one period) and the heartbeat sweep.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let config = self.config.clone();
        let cleanup = self.clone();
        let instance = Activity::new("instance cleanup").delay_first_run().spawn(
            cancel.clone(),
            move || Duration::from_millis(config.config().uint(IntConfig::CleanupPeriodMs).max(1)),
            move || {
                let cleanup = cleanup.clone();
                async move { cleanup.do_work().await.map(|_| ()) }
            },
        );

        let heartbeats = Activity::new("heartbeat cleanup").spawn(
            cancel,
            || HEARTBEAT_CLEAN_PERIOD,
            move || {
                let cleanup = self.clone();
                async move { cleanup.clean_heartbeats().await.map(|_| ()) }
            },
        );

        vec![instance, heartbeats]
    }
}
