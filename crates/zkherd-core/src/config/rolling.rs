//! Order in which hosts receive a staged config.

use std::collections::BTreeSet;

use crate::server_list::ServerList;

/// Computed rolling order plus any warnings raised while computing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollingHostSequence {
    pub hosts: Vec<String>,
    pub warnings: Vec<String>,
}

/// Computes the rolling order for moving from `root` to `target`.
///
/// New hosts come first so they are up before existing members restart
/// around them. Hosts present in both lists follow, with the current leader
/// (when known) moved to the very end so leadership changes at most once.
/// Hosts only in `root` are left out; they drop off when the final config
/// lands. Each group is sorted by hostname, so the order is stable.
///
/// # Arguments
/// * `root` - membership currently in force
/// * `target` - membership being rolled out
/// * `leader` - hostname of the current leader, if known
pub fn rolling_host_sequence(
    root: &ServerList,
    target: &ServerList,
    leader: Option<&str>,
) -> RollingHostSequence {
    let root_hosts = root.hostname_set();
    let target_hosts = target.hostname_set();

    let new_hosts: BTreeSet<&String> = target_hosts.difference(&root_hosts).collect();
    let mut unchanged: Vec<&String> = target_hosts.intersection(&root_hosts).collect();

    if let Some(leader) = leader {
        if let Some(pos) = unchanged.iter().position(|h| h.as_str() == leader) {
            let leader = unchanged.remove(pos);
            unchanged.push(leader);
        }
    }

    let mut warnings = Vec::new();
    if new_hosts.len() > 1 {
        warnings.push(format!(
            "Adding {} servers at once ({}) risks losing quorum during the transition",
            new_hosts.len(),
            new_hosts
                .iter()
                .map(|h| h.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }

    let hosts = new_hosts
        .into_iter()
        .chain(unchanged)
        .cloned()
        .collect();

    RollingHostSequence { hosts, warnings }
}
