//! Membership planning for automatic instance management.
//!
//! Planning is a pure function of the current server list and what is known
//! about each member, so every scenario can be tested without a store or
//! peers.

use std::time::SystemTime;

use crate::config::{InstanceConfig, IntConfig};
use crate::server_list::{ServerList, ServerSpec, ServerType};
use tracing::warn;

/// How the ensemble is allowed to grow and shrink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoManagePolicy {
    /// Any number of members. Stale members are evicted once the ensemble
    /// has at least `min_size` members.
    Elastic { min_size: usize },
    /// Exactly `size` members. A new instance joins only by replacing a
    /// stale member when the ensemble is full.
    Fixed { size: usize },
}

impl AutoManagePolicy {
    pub fn from_config(config: &InstanceConfig) -> Self {
        match config.uint(IntConfig::AutoManageInstancesFixedEnsembleSize) {
            0 => AutoManagePolicy::Elastic {
                min_size: config.uint(IntConfig::AutoManageInstancesMinSize) as usize,
            },
            size => AutoManagePolicy::Fixed {
                size: size as usize,
            },
        }
    }
}

/// What is known about one member other than this instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberHealth {
    pub hostname: String,
    /// `None` when the member never wrote a heartbeat
    pub last_heartbeat: Option<SystemTime>,
    /// Whether `last_heartbeat` is within the dead-instance period
    pub heartbeat_alive: Option<bool>,
    /// Whether the member itself reported serving
    pub serving: bool,
}

impl MemberHealth {
    /// Stale heartbeat and not serving. A member that never wrote a
    /// heartbeat has not been seen yet and is never stale.
    pub fn is_dead(&self) -> bool {
        self.heartbeat_alive == Some(false) && !self.serving
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    NoChange,
    /// Fixed ensemble is full and nobody can be replaced
    NoRoom,
    Change { servers: ServerList, reason: String },
}

/// Inputs for one planning pass.
#[derive(Debug, Clone)]
pub struct PlanInput<'a> {
    pub servers: &'a ServerList,
    pub hostname: &'a str,
    /// This instance is ready to join (has reported a non-latent state)
    pub ready: bool,
    pub members: &'a [MemberHealth],
    pub policy: AutoManagePolicy,
    /// Members at or past this 1-based position join as observers; 0 never
    pub observer_threshold: usize,
}

/// Decides the next server list.
///
/// An absent, ready instance registers itself first; eviction waits for a
/// later pass. The result is [`Plan::NoChange`] whenever the new list equals
/// the current one.
pub fn plan(input: &PlanInput<'_>) -> Plan {
    let needs_registration = input.ready && !input.servers.contains(input.hostname);

    let plan = match input.policy {
        AutoManagePolicy::Elastic { min_size } => {
            let registered = needs_registration
                .then(|| with_us(input.servers, input.hostname, input.observer_threshold))
                .flatten();
            if let Some(servers) = registered {
                Plan::Change {
                    servers,
                    reason: "Adding this instance to server list due to automatic instance management"
                        .to_string(),
                }
            } else if input.servers.len() >= min_size {
                evict_stale(input)
            } else {
                Plan::NoChange
            }
        }
        AutoManagePolicy::Fixed { size } => {
            if needs_registration {
                replace_for_us(input, size)
            } else {
                Plan::NoChange
            }
        }
    };

    match plan {
        Plan::Change { servers, .. } if servers == *input.servers => Plan::NoChange,
        other => other,
    }
}

fn evict_stale(input: &PlanInput<'_>) -> Plan {
    let removals: Vec<String> = input
        .servers
        .hostnames()
        .into_iter()
        .filter(|h| h != input.hostname && is_dead(input.members, h))
        .collect();

    if removals.is_empty() {
        return Plan::NoChange;
    }
    Plan::Change {
        servers: input.servers.without(&removals),
        reason: format!(
            "Removing stale instance(s) from servers list: {}",
            removals.join(", ")
        ),
    }
}

fn replace_for_us(input: &PlanInput<'_>, size: usize) -> Plan {
    if input.servers.len() < size {
        return match with_us(input.servers, input.hostname, input.observer_threshold) {
            Some(servers) => Plan::Change {
                servers,
                reason: "Adding this instance to fixed-size ensemble".to_string(),
            },
            None => Plan::NoChange,
        };
    }

    let needed = input.servers.len() + 1 - size;
    let mut dead: Vec<&MemberHealth> = input
        .members
        .iter()
        .filter(|m| m.is_dead() && input.servers.contains(&m.hostname))
        .collect();
    if dead.len() < needed {
        return Plan::NoRoom;
    }

    // oldest heartbeat goes first
    dead.sort_by(|a, b| {
        a.last_heartbeat
            .cmp(&b.last_heartbeat)
            .then_with(|| a.hostname.cmp(&b.hostname))
    });
    let removals: Vec<String> = dead
        .into_iter()
        .take(needed)
        .map(|m| m.hostname.clone())
        .collect();

    let remaining = input.servers.without(&removals);
    match with_us(&remaining, input.hostname, input.observer_threshold) {
        Some(servers) => Plan::Change {
            servers,
            reason: format!(
                "Replacing stale instance(s) {} with this instance",
                removals.join(", ")
            ),
        },
        None => Plan::NoChange,
    }
}

fn is_dead(members: &[MemberHealth], hostname: &str) -> bool {
    members
        .iter()
        .find(|m| m.hostname == hostname)
        .map(MemberHealth::is_dead)
        .unwrap_or(false)
}

/// `servers` plus this instance under the next free id, or `None` when the
/// ids are exhausted.
fn with_us(servers: &ServerList, hostname: &str, observer_threshold: usize) -> Option<ServerList> {
    let Some(server_id) = servers.max_server_id().checked_add(1) else {
        warn!(
            "No server id left above {} for {}, not adding it",
            servers.max_server_id(),
            hostname
        );
        return None;
    };
    let position = servers.len() + 1;
    let server_type = if observer_threshold > 0 && position >= observer_threshold {
        ServerType::Observer
    } else {
        ServerType::Standard
    };
    Some(servers.with_added(ServerSpec::new(hostname, server_id, server_type)))
}
