//! Root config plus the optional in-flight rolling change.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use zkherd_common::protocol::error::{Result, ZkherdError};

use super::instance::InstanceConfig;

/// A staged config being applied host by host.
///
/// Invariant: `hosts` is non-empty and `index < hosts.len()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollingConfig {
    pub config: InstanceConfig,
    pub hosts: Vec<String>,
    pub index: usize,
}

impl RollingConfig {
    /// Returns `None` when the invariant would not hold.
    pub fn new(config: InstanceConfig, hosts: Vec<String>, index: usize) -> Option<Self> {
        if hosts.is_empty() || index >= hosts.len() {
            return None;
        }
        Some(Self {
            config,
            hosts,
            index,
        })
    }

    pub fn current_host(&self) -> &str {
        &self.hosts[self.index]
    }

    pub fn next_host(&self) -> Option<&str> {
        self.hosts.get(self.index + 1).map(String::as_str)
    }

    pub fn is_last(&self) -> bool {
        self.index + 1 >= self.hosts.len()
    }
}

/// Everything persisted in the config store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigCollection {
    pub root: InstanceConfig,
    pub rolling: Option<RollingConfig>,
}

/// A collection together with the store version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedConfig {
    pub collection: ConfigCollection,
    pub version: u64,
}

/// Progress report for an in-flight rolling change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollingConfigState {
    pub status: String,
    pub percent_done: u32,
    pub hosts: Vec<String>,
    pub index: usize,
}

impl ConfigCollection {
    pub fn committed(root: InstanceConfig) -> Self {
        Self {
            root,
            rolling: None,
        }
    }

    pub fn is_rolling(&self) -> bool {
        self.rolling.is_some()
    }

    /// The config `hostname` should be running right now.
    ///
    /// Hosts the rolling cursor has reached (or passed) run the staged
    /// config; everyone else keeps the root.
    pub fn config_for_host(&self, hostname: &str) -> &InstanceConfig {
        match &self.rolling {
            Some(rolling) if rolling.hosts[..=rolling.index].iter().any(|h| h == hostname) => {
                &rolling.config
            }
            _ => &self.root,
        }
    }

    /// The config that will be in force once any rolling change lands.
    pub fn target_config(&self) -> &InstanceConfig {
        self.rolling
            .as_ref()
            .map(|r| &r.config)
            .unwrap_or(&self.root)
    }

    pub fn rolling_state(&self) -> RollingConfigState {
        match &self.rolling {
            None => RollingConfigState {
                status: "n/a".to_string(),
                percent_done: 0,
                hosts: Vec::new(),
                index: 0,
            },
            Some(rolling) => {
                let mut status = format!("Applying to \"{}\"", rolling.current_host());
                if let Some(next) = rolling.next_host() {
                    status.push_str(&format!(" (next will be \"{}\")", next));
                }
                let percent = (100 * rolling.index / rolling.hosts.len()) as u32;
                RollingConfigState {
                    status,
                    percent_done: percent.max(1),
                    hosts: rolling.hosts.clone(),
                    index: rolling.index,
                }
            }
        }
    }

    pub fn to_json(&self) -> Value {
        let rolling = self.rolling.as_ref().map(|r| {
            json!({
                "config": r.config.to_json(),
                "hosts": r.hosts,
                "index": r.index,
            })
        });
        json!({
            "root": self.root.to_json(),
            "rolling": rolling,
        })
    }

    pub fn from_json(value: &Value) -> Result<Self> {
        let root = InstanceConfig::from_json(&value["root"])?;

        let rolling = match &value["rolling"] {
            Value::Null => None,
            r => {
                let config = InstanceConfig::from_json(&r["config"])?;
                let hosts: Vec<String> = serde_json::from_value(r["hosts"].clone())?;
                let index = r["index"].as_u64().unwrap_or(0) as usize;
                Some(RollingConfig::new(config, hosts, index).ok_or_else(|| {
                    ZkherdError::InvalidConfig("rolling index out of range".into())
                })?)
            }
        };

        Ok(Self { root, rolling })
    }
}
