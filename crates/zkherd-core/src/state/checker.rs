use super::control_panel::{ControlPanel, ControlPanelSwitch};
use super::four_letter_word::{FourLetterWord, StatusMatcher, StatusProtocol};
use super::{InstanceState, InstanceStateType, ProbeResult};
use crate::config::{InstanceConfig, IntConfig};

/// Switch positions that affect classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Switches {
    pub restarts: bool,
    pub unlisted_restarts: bool,
}

impl Switches {
    pub fn from_panel(panel: &ControlPanel) -> Self {
        Self {
            restarts: panel.is_set(ControlPanelSwitch::Restarts),
            unlisted_restarts: panel.is_set(ControlPanelSwitch::UnlistedRestarts),
        }
    }
}

/// Classifies the locally supervised server.
pub struct Checker {
    hostname: String,
    matcher: StatusMatcher,
}

impl Checker {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self::with_matcher(hostname, StatusMatcher::default())
    }

    pub fn with_matcher(hostname: impl Into<String>, matcher: StatusMatcher) -> Self {
        Self {
            hostname: hostname.into(),
            matcher,
        }
    }

    /// Probes the server and builds the full instance state.
    ///
    /// The status protocol is only used when the answer could change the
    /// classification: latent and unlisted instances are classified without
    /// contacting the server.
    pub async fn check(
        &self,
        config: &InstanceConfig,
        panel: &ControlPanel,
        protocol: &dyn StatusProtocol,
    ) -> InstanceState {
        let server_list = config.server_list();
        let us = server_list.find(&self.hostname);
        let switches = Switches::from_panel(panel);

        let (state, probe) = if !config.is_runnable() {
            (InstanceStateType::Latent, ProbeResult::Skipped)
        } else if us.is_none() && !switches.unlisted_restarts {
            (InstanceStateType::DownBecauseUnlisted, ProbeResult::Skipped)
        } else {
            let ruok = protocol.send(FourLetterWord::Ruok).await;
            let srvr = if self.matcher.is_alive(&ruok) {
                protocol.send(FourLetterWord::Srvr).await
            } else {
                String::new()
            };
            self.classify(us.is_some(), switches, &ruok, &srvr)
        };

        InstanceState {
            server_id: us.map(|s| s.server_id),
            server_list,
            connect_port: config.port(IntConfig::ConnectPort),
            election_port: config.port(IntConfig::ElectionPort),
            state,
            probe,
            restart_config: config.restart_significant(),
        }
    }

    /// Classification from its three inputs: membership, switches and the
    /// text the server returned for `ruok` and `srvr`.
    pub fn classify(
        &self,
        listed: bool,
        switches: Switches,
        ruok: &str,
        srvr: &str,
    ) -> (InstanceStateType, ProbeResult) {
        if !listed && !switches.unlisted_restarts {
            return (InstanceStateType::DownBecauseUnlisted, ProbeResult::Skipped);
        }

        let probe = if self.matcher.is_alive(ruok) {
            self.matcher.classify(srvr)
        } else {
            ProbeResult::NoResponse
        };

        let state = match probe {
            ProbeResult::Serving { .. } => InstanceStateType::Serving,
            ProbeResult::Alive => InstanceStateType::Waiting,
            ProbeResult::NotServing if switches.restarts => InstanceStateType::NotServing,
            ProbeResult::NoResponse | ProbeResult::Skipped if switches.restarts => {
                InstanceStateType::Unknown
            }
            _ => InstanceStateType::DownBecauseRestartsTurnedOff,
        };

        (state, probe)
    }
}
