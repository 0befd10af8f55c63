//! Names of the JSON-RPC methods every zkherd instance answers.

use std::fmt;
use std::str::FromStr;

/// Method exposed by a zkherd instance to its peers and to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterMethod {
    /// Local instance state (classified state, leadership, server list)
    State,
    /// Nudge the instance to re-poll the config store now
    ConfigChanged,
    /// Current config collection for this instance
    GetConfig,
    /// Commit a config change directly (no rolling)
    UpdateConfig,
    /// Start a rolling config change
    StartRollingConfig,
    /// Roll back or force-commit the in-flight rolling change
    CancelRollingConfig,
    /// Progress of the in-flight rolling change
    RollingState,
    /// Fan-out status of every ensemble member
    ClusterStatus,
    /// Proxy a four-letter word to the local server
    FourLetterWord,
    /// Toggle local control panel switches
    SetControlPanel,
    /// Contents of one backup entry
    GetBackup,
    /// Build and identity information
    Info,
}

impl ClusterMethod {
    pub const ALL: [ClusterMethod; 12] = [
        ClusterMethod::State,
        ClusterMethod::ConfigChanged,
        ClusterMethod::GetConfig,
        ClusterMethod::UpdateConfig,
        ClusterMethod::StartRollingConfig,
        ClusterMethod::CancelRollingConfig,
        ClusterMethod::RollingState,
        ClusterMethod::ClusterStatus,
        ClusterMethod::FourLetterWord,
        ClusterMethod::SetControlPanel,
        ClusterMethod::GetBackup,
        ClusterMethod::Info,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterMethod::State => "state",
            ClusterMethod::ConfigChanged => "config_changed",
            ClusterMethod::GetConfig => "get_config",
            ClusterMethod::UpdateConfig => "update_config",
            ClusterMethod::StartRollingConfig => "start_rolling_config",
            ClusterMethod::CancelRollingConfig => "cancel_rolling_config",
            ClusterMethod::RollingState => "rolling_state",
            ClusterMethod::ClusterStatus => "cluster_status",
            ClusterMethod::FourLetterWord => "four_letter_word",
            ClusterMethod::SetControlPanel => "set_control_panel",
            ClusterMethod::GetBackup => "get_backup",
            ClusterMethod::Info => "_info",
        }
    }
}

impl fmt::Display for ClusterMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClusterMethod {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ClusterMethod::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == s)
            .ok_or(())
    }
}
