//! Ensemble-wide status, built by asking every member for its state.

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};

use crate::remote::RemoteInstanceRequest;
use crate::server_list::ServerList;
use crate::state::{InstanceStateType, InstanceStatus};

/// Upper bound on concurrent peer requests during a fan-out.
pub const DEFAULT_FAN_OUT: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStatus {
    /// One entry per member, in server list order
    pub members: Vec<InstanceStatus>,
    pub has_leader: bool,
    pub all_serving: bool,
}

impl ClusterStatus {
    pub fn member(&self, hostname: &str) -> Option<&InstanceStatus> {
        self.members.iter().find(|m| m.hostname == hostname)
    }

    pub fn leader(&self) -> Option<&str> {
        self.members
            .iter()
            .find(|m| m.is_leader)
            .map(|m| m.hostname.as_str())
    }

    pub fn is_serving(&self, hostname: &str) -> bool {
        self.member(hostname)
            .map(|m| m.state == InstanceStateType::Serving)
            .unwrap_or(false)
    }
}

/// Fetches the state of every member of `servers`.
///
/// Requests run concurrently, at most `fan_out` at a time. A member that
/// cannot be asked shows up as unknown with the reason attached; it never
/// fails the whole call.
pub async fn cluster_status(
    remote: &RemoteInstanceRequest,
    servers: &ServerList,
    fan_out: usize,
) -> ClusterStatus {
    let members: Vec<InstanceStatus> = stream::iter(servers.hostnames())
        .map(|hostname| async move { remote.state_of(&hostname).await })
        .buffered(fan_out.max(1))
        .collect()
        .await;

    let has_leader = members.iter().any(|m| m.is_leader);
    let all_serving = !members.is_empty()
        && members
            .iter()
            .all(|m| m.state == InstanceStateType::Serving);

    ClusterStatus {
        members,
        has_leader,
        all_serving,
    }
}
