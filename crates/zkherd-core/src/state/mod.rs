//! Observed state of the locally supervised server.

pub mod checker;
pub mod control_panel;
pub mod four_letter_word;

pub use checker::Checker;
pub use control_panel::{ControlPanel, ControlPanelSwitch};
pub use four_letter_word::{FourLetterWord, StatusMatcher, StatusProtocol, TcpStatusProtocol};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::RestartSignificantConfig;
use crate::server_list::ServerList;

/// Classification of the supervised server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStateType {
    /// No answer from the server, or not checked yet
    Unknown,
    /// Not configured well enough to run (install/data directory missing)
    Latent,
    /// Server answered but says it is not serving
    NotServing,
    /// Server is up and part of a working ensemble
    Serving,
    /// This host is not in the server list and unlisted restarts are off
    DownBecauseUnlisted,
    /// The restart switch is off and the server is not serving
    DownBecauseRestartsTurnedOff,
    /// Server is alive but has not settled into a mode yet
    Waiting,
}

impl InstanceStateType {
    pub fn code(&self) -> u8 {
        match self {
            InstanceStateType::Unknown => 0,
            InstanceStateType::Latent => 1,
            InstanceStateType::NotServing => 2,
            InstanceStateType::Serving => 3,
            InstanceStateType::DownBecauseUnlisted => 4,
            InstanceStateType::DownBecauseRestartsTurnedOff => 5,
            InstanceStateType::Waiting => 6,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            InstanceStateType::Unknown => "unknown",
            InstanceStateType::Latent => "latent",
            InstanceStateType::NotServing => "not serving",
            InstanceStateType::Serving => "serving",
            InstanceStateType::DownBecauseUnlisted => "down because unlisted",
            InstanceStateType::DownBecauseRestartsTurnedOff => "down because restarts turned off",
            InstanceStateType::Waiting => "waiting",
        }
    }

    /// States in which the monitor should try a restart.
    pub fn needs_restart(&self) -> bool {
        matches!(self, InstanceStateType::NotServing | InstanceStateType::Unknown)
    }
}

/// What the status protocol said, before switches were applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeResult {
    /// Classification was decided without asking the server
    Skipped,
    /// Liveness probe got no (or the wrong) answer
    NoResponse,
    /// Alive, but the status dump matched neither pattern
    Alive,
    NotServing,
    Serving { is_leader: bool },
}

impl ProbeResult {
    pub fn is_leader(&self) -> bool {
        matches!(self, ProbeResult::Serving { is_leader: true })
    }
}

/// Snapshot of everything the monitor compares between cycles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceState {
    pub server_list: ServerList,
    pub connect_port: u16,
    pub election_port: u16,
    /// Our id in `server_list`, if listed
    pub server_id: Option<u32>,
    pub state: InstanceStateType,
    pub probe: ProbeResult,
    pub restart_config: RestartSignificantConfig,
}

impl InstanceState {
    /// True when anything that ends up in the peer configuration file differs.
    pub fn config_differs(&self, other: &InstanceState) -> bool {
        self.server_list != other.server_list
            || self.connect_port != other.connect_port
            || self.election_port != other.election_port
            || self.server_id != other.server_id
            || self.restart_config != other.restart_config
    }
}

/// Wire form of an instance's state, as returned by the `state` method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub hostname: String,
    pub state: InstanceStateType,
    pub code: u8,
    pub description: String,
    pub is_leader: bool,
    /// Server list the instance is currently running with
    pub server_spec: String,
    /// Why the state could not be fetched, for remote lookups
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl InstanceStatus {
    pub fn new(hostname: &str, state: InstanceStateType, is_leader: bool, server_spec: String) -> Self {
        Self {
            hostname: hostname.to_string(),
            state,
            code: state.code(),
            description: state.description().to_string(),
            is_leader,
            server_spec,
            error: None,
        }
    }

    /// Status recorded for a peer that could not be asked.
    pub fn unreachable(hostname: &str, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(hostname, InstanceStateType::Unknown, false, String::new())
        }
    }
}

/// Latest observed state, written by the monitor and read by everyone else.
#[derive(Debug, Default)]
pub struct SharedInstanceState {
    current: RwLock<Option<InstanceState>>,
}

impl SharedInstanceState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, state: InstanceState) {
        *self.current.write() = Some(state);
    }

    pub fn get(&self) -> Option<InstanceState> {
        self.current.read().clone()
    }

    pub fn state_type(&self) -> InstanceStateType {
        self.current
            .read()
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(InstanceStateType::Unknown)
    }

    pub fn status(&self, hostname: &str) -> InstanceStatus {
        match self.current.read().as_ref() {
            Some(state) => InstanceStatus::new(
                hostname,
                state.state,
                state.probe.is_leader(),
                state.server_list.to_spec_string(),
            ),
            None => InstanceStatus::new(hostname, InstanceStateType::Unknown, false, String::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstanceConfig;

    fn state(spec: &str, state: InstanceStateType) -> InstanceState {
        InstanceState {
            server_list: ServerList::parse(spec),
            connect_port: 2888,
            election_port: 3888,
            server_id: Some(1),
            state,
            probe: ProbeResult::NoResponse,
            restart_config: InstanceConfig::default().restart_significant(),
        }
    }

    #[test]
    fn test_state_codes_and_descriptions() {
        assert_eq!(InstanceStateType::Serving.code(), 3);
        assert_eq!(InstanceStateType::NotServing.description(), "not serving");
        assert!(InstanceStateType::Unknown.needs_restart());
        assert!(!InstanceStateType::Waiting.needs_restart());
        assert!(!InstanceStateType::DownBecauseRestartsTurnedOff.needs_restart());
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&InstanceStateType::DownBecauseUnlisted).unwrap();
        assert_eq!(json, "\"down_because_unlisted\"");
    }

    #[test]
    fn test_config_differs() {
        let a = state("1:a,2:b", InstanceStateType::Serving);
        let b = state("1:a,2:b", InstanceStateType::NotServing);
        assert!(!a.config_differs(&b));

        let c = state("1:a,2:b,3:c", InstanceStateType::Serving);
        assert!(a.config_differs(&c));

        let mut d = a.clone();
        d.election_port = 3999;
        assert!(a.config_differs(&d));

        let e = state("1:a,2:b,O:3:c", InstanceStateType::Serving);
        assert!(a.config_differs(&e));
    }

    #[test]
    fn test_shared_state_status() {
        let shared = SharedInstanceState::new();
        assert_eq!(shared.status("a").state, InstanceStateType::Unknown);

        let mut s = state("1:a", InstanceStateType::Serving);
        s.probe = ProbeResult::Serving { is_leader: true };
        shared.set(s);

        let status = shared.status("a");
        assert_eq!(status.state, InstanceStateType::Serving);
        assert!(status.is_leader);
        assert_eq!(status.server_spec, "1:a");
    }

    #[test]
    fn test_unreachable_status_round_trips_error() {
        let status = InstanceStatus::unreachable("b", "connection refused");
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["error"], "connection refused");
        let back: InstanceStatus = serde_json::from_value(json).unwrap();
        assert_eq!(back, status);
    }
}
