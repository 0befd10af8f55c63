//! Ensemble membership: server specs and the delimited server list.
//!
//! The wire format is a comma separated list of `id:hostname` items, where
//! an item may carry a type prefix (`S:` standard, `O:` observer):
//!
//! ```text
//! 1:zk1,2:zk2,O:3:zk3
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::warn;
use zkherd_common::protocol::error::{Result, ZkherdError};

/// Role of a member in the ensemble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerType {
    /// Voting participant
    Standard,
    /// Replicates but does not vote
    Observer,
}

impl ServerType {
    pub fn code(&self) -> &'static str {
        match self {
            ServerType::Standard => "S",
            ServerType::Observer => "O",
        }
    }

    /// Prefix used when serialising a spec. Standard members carry none.
    pub fn spec_prefix(&self) -> &'static str {
        match self {
            ServerType::Standard => "",
            ServerType::Observer => "O:",
        }
    }

    /// Suffix appended to a `server.N` line in `zoo.cfg`.
    pub fn zoo_cfg_suffix(&self) -> &'static str {
        match self {
            ServerType::Standard => "",
            ServerType::Observer => ":observer",
        }
    }

    fn from_code(code: &str) -> Option<Self> {
        if code.eq_ignore_ascii_case("S") {
            Some(ServerType::Standard)
        } else if code.eq_ignore_ascii_case("O") {
            Some(ServerType::Observer)
        } else {
            None
        }
    }
}

/// One ensemble member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerSpec {
    pub hostname: String,
    pub server_id: u32,
    pub server_type: ServerType,
}

impl ServerSpec {
    pub fn new(hostname: impl Into<String>, server_id: u32, server_type: ServerType) -> Self {
        Self {
            hostname: hostname.into(),
            server_id,
            server_type,
        }
    }

    fn parse(item: &str) -> Option<Self> {
        let parts: Vec<&str> = item.split(':').map(str::trim).collect();
        let (server_type, id, hostname) = match parts.as_slice() {
            [id, hostname] => (ServerType::Standard, *id, *hostname),
            [code, id, hostname] => (ServerType::from_code(code)?, *id, *hostname),
            _ => return None,
        };

        let server_id = id.parse::<u32>().ok().filter(|id| *id > 0)?;
        if hostname.is_empty() {
            return None;
        }

        Some(Self::new(hostname, server_id, server_type))
    }
}

impl fmt::Display for ServerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}:{}",
            self.server_type.spec_prefix(),
            self.server_id,
            self.hostname
        )
    }
}

/// Ordered, immutable ensemble membership.
///
/// Equality is structural so two lists compare equal exactly when they would
/// produce the same peer configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerList {
    specs: Vec<ServerSpec>,
}

impl ServerList {
    /// Parses a server list, dropping items that cannot be used.
    ///
    /// Malformed items and items that repeat an id or hostname are logged
    /// and skipped, so a single bad entry never takes the ensemble down.
    pub fn parse(spec: &str) -> Self {
        let mut specs: Vec<ServerSpec> = Vec::new();

        for item in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let Some(parsed) = ServerSpec::parse(item) else {
                warn!("Ignoring unparseable server spec item: {}", item);
                continue;
            };

            if specs.iter().any(|s| s.server_id == parsed.server_id) {
                warn!("Ignoring server spec item with duplicate id: {}", item);
                continue;
            }
            if specs.iter().any(|s| s.hostname == parsed.hostname) {
                warn!("Ignoring server spec item with duplicate hostname: {}", item);
                continue;
            }

            specs.push(parsed);
        }

        Self { specs }
    }

    /// Parses a server list submitted by an operator.
    ///
    /// A blank string is an empty ensemble. A non-blank string that yields no
    /// entries at all is rejected.
    pub fn parse_strict(spec: &str) -> Result<Self> {
        let list = Self::parse(spec);
        if list.is_empty() && !spec.trim().is_empty() {
            return Err(ZkherdError::InvalidServerList(format!(
                "no parseable entries in '{}'",
                spec
            )));
        }
        Ok(list)
    }

    pub fn from_specs(specs: Vec<ServerSpec>) -> Self {
        Self { specs }
    }

    pub fn specs(&self) -> &[ServerSpec] {
        &self.specs
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn hostnames(&self) -> Vec<String> {
        self.specs.iter().map(|s| s.hostname.clone()).collect()
    }

    pub fn hostname_set(&self) -> BTreeSet<String> {
        self.specs.iter().map(|s| s.hostname.clone()).collect()
    }

    pub fn find(&self, hostname: &str) -> Option<&ServerSpec> {
        self.specs.iter().find(|s| s.hostname == hostname)
    }

    pub fn contains(&self, hostname: &str) -> bool {
        self.find(hostname).is_some()
    }

    pub fn max_server_id(&self) -> u32 {
        self.specs.iter().map(|s| s.server_id).max().unwrap_or(0)
    }

    /// Returns a new list with `spec` appended.
    pub fn with_added(&self, spec: ServerSpec) -> Self {
        let mut specs = self.specs.clone();
        specs.push(spec);
        Self { specs }
    }

    /// Returns a new list without the given hostnames.
    pub fn without(&self, hostnames: &[String]) -> Self {
        Self {
            specs: self
                .specs
                .iter()
                .filter(|s| !hostnames.contains(&s.hostname))
                .cloned()
                .collect(),
        }
    }

    /// Serialises back to the delimited wire format.
    pub fn to_spec_string(&self) -> String {
        self.specs
            .iter()
            .map(ServerSpec::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for ServerList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_spec_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_standard_and_observer() {
        let list = ServerList::parse("1:a, S:2:b ,O:3:c");
        assert_eq!(list.len(), 3);
        assert_eq!(list.specs()[0], ServerSpec::new("a", 1, ServerType::Standard));
        assert_eq!(list.specs()[1], ServerSpec::new("b", 2, ServerType::Standard));
        assert_eq!(list.specs()[2], ServerSpec::new("c", 3, ServerType::Observer));
        assert_eq!(list.to_spec_string(), "1:a,2:b,O:3:c");
    }

    #[test]
    fn test_parse_skips_garbage_and_duplicates() {
        let list = ServerList::parse("1:a,junk,X:2:b,2:b,2:c,3:a,0:z,4:");
        assert_eq!(list.to_spec_string(), "1:a,2:b");
    }

    #[test]
    fn test_parse_strict() {
        assert!(ServerList::parse_strict("").unwrap().is_empty());
        assert!(ServerList::parse_strict("   ").unwrap().is_empty());
        assert!(matches!(
            ServerList::parse_strict("foo,bar"),
            Err(ZkherdError::InvalidServerList(_))
        ));
        assert_eq!(ServerList::parse_strict("1:a").unwrap().len(), 1);
    }

    #[test]
    fn test_add_remove_and_lookup() {
        let list = ServerList::parse("1:a,2:b,3:c");
        assert_eq!(list.max_server_id(), 3);
        assert!(list.contains("b"));

        let grown = list.with_added(ServerSpec::new("d", 4, ServerType::Observer));
        assert_eq!(grown.to_spec_string(), "1:a,2:b,3:c,O:4:d");

        let shrunk = grown.without(&["b".to_string(), "d".to_string()]);
        assert_eq!(shrunk.to_spec_string(), "1:a,3:c");
        assert_eq!(ServerList::default().max_server_id(), 0);
    }

    #[test]
    fn test_observer_change_is_a_different_list() {
        let base = ServerList::parse("1:a,2:b,3:c");
        assert_ne!(base, ServerList::parse("1:a,2:b,3:c,O:4:d"));
        assert_ne!(base, ServerList::parse("1:a,2:b,O:3:c"));
        assert_eq!(base, ServerList::parse(" 1:a, S:2:b,3:c"));
    }
}
