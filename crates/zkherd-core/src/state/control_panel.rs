//! Local administrative switches.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlPanelSwitch {
    /// Allow the monitor to restart the server
    Restarts,
    /// Treat this host as listed even when it is not in the server list
    UnlistedRestarts,
    /// Run the periodic log/snapshot cleanup
    Cleanup,
}

impl FromStr for ControlPanelSwitch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "restarts" => Ok(ControlPanelSwitch::Restarts),
            "unlisted_restarts" => Ok(ControlPanelSwitch::UnlistedRestarts),
            "cleanup" => Ok(ControlPanelSwitch::Cleanup),
            other => Err(format!("unknown control panel switch: {}", other)),
        }
    }
}

#[derive(Debug)]
pub struct ControlPanel {
    restarts: AtomicBool,
    unlisted_restarts: AtomicBool,
    cleanup: AtomicBool,
}

impl Default for ControlPanel {
    fn default() -> Self {
        Self {
            restarts: AtomicBool::new(true),
            unlisted_restarts: AtomicBool::new(false),
            cleanup: AtomicBool::new(true),
        }
    }
}

impl ControlPanel {
    fn switch(&self, switch: ControlPanelSwitch) -> &AtomicBool {
        match switch {
            ControlPanelSwitch::Restarts => &self.restarts,
            ControlPanelSwitch::UnlistedRestarts => &self.unlisted_restarts,
            ControlPanelSwitch::Cleanup => &self.cleanup,
        }
    }

    pub fn is_set(&self, switch: ControlPanelSwitch) -> bool {
        self.switch(switch).load(Ordering::SeqCst)
    }

    pub fn set(&self, switch: ControlPanelSwitch, value: bool) {
        self.switch(switch).store(value, Ordering::SeqCst);
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "restarts": self.is_set(ControlPanelSwitch::Restarts),
            "unlisted_restarts": self.is_set(ControlPanelSwitch::UnlistedRestarts),
            "cleanup": self.is_set(ControlPanelSwitch::Cleanup),
        })
    }
}
