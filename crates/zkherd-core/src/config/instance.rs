//! A single configuration snapshot and its copy-on-write builder.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::warn;
use zkherd_common::protocol::error::{Result, ZkherdError};

use super::keys::{IntConfig, StringConfig};
use crate::server_list::ServerList;

/// Upper bound for any `*-ms` period: 30 days.
pub const MAX_PERIOD_MS: i64 = 30 * 24 * 60 * 60 * 1000;

/// Immutable set of configuration values.
///
/// Only explicitly set values are stored; lookups fall back to each key's
/// default. Use [`ConfigBuilder`] to derive a modified copy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceConfig {
    strings: BTreeMap<StringConfig, String>,
    ints: BTreeMap<IntConfig, i64>,
}

impl InstanceConfig {
    pub fn builder(&self) -> ConfigBuilder {
        ConfigBuilder::new(self)
    }

    pub fn string(&self, key: StringConfig) -> &str {
        self.strings
            .get(&key)
            .map(String::as_str)
            .unwrap_or_else(|| key.default_value())
    }

    pub fn int(&self, key: IntConfig) -> i64 {
        self.ints
            .get(&key)
            .copied()
            .unwrap_or_else(|| key.default_value())
    }

    /// Convenience accessor for non-negative millisecond/port/count values.
    pub fn uint(&self, key: IntConfig) -> u64 {
        self.int(key).max(0) as u64
    }

    /// Port-valued key. A stored value outside the port range falls back to
    /// the key's default.
    pub fn port(&self, key: IntConfig) -> u16 {
        let value = self.int(key);
        u16::try_from(value).unwrap_or_else(|_| {
            warn!("{} is out of range ({}), using the default", key.name(), value);
            u16::try_from(key.default_value()).unwrap_or_default()
        })
    }

    /// Rejects values the supervisor cannot run with: an empty or unparseable
    /// server list, ports outside 1..=65535, periods outside 1ms..=30 days and
    /// negative counts.
    pub fn validate(&self) -> Result<()> {
        ServerList::parse_strict(self.string(StringConfig::ServersSpec))?;

        for key in IntConfig::ALL {
            let value = self.int(key);
            if key.is_port() {
                if value == 0 || u16::try_from(value).is_err() {
                    return Err(ZkherdError::InvalidConfig(format!(
                        "{} must be a port between 1 and 65535, got {}",
                        key.name(),
                        value
                    )));
                }
            } else if key.is_period() {
                if !(1..=MAX_PERIOD_MS).contains(&value) {
                    return Err(ZkherdError::InvalidConfig(format!(
                        "{} must be between 1 and {} ms, got {}",
                        key.name(),
                        MAX_PERIOD_MS,
                        value
                    )));
                }
            } else if value < 0 {
                return Err(ZkherdError::InvalidConfig(format!(
                    "{} must not be negative, got {}",
                    key.name(),
                    value
                )));
            }
        }
        Ok(())
    }

    pub fn server_list(&self) -> ServerList {
        ServerList::parse(self.string(StringConfig::ServersSpec))
    }

    /// True when both directories needed to run the server are configured.
    pub fn is_runnable(&self) -> bool {
        !self.string(StringConfig::ZookeeperInstallDirectory).trim().is_empty()
            && !self.string(StringConfig::ZookeeperDataDirectory).trim().is_empty()
    }

    pub fn restart_significant(&self) -> RestartSignificantConfig {
        let mut values = Vec::new();
        for key in StringConfig::ALL.iter().filter(|k| k.is_restart_significant()) {
            values.push(self.string(*key).to_string());
        }
        for key in IntConfig::ALL.iter().filter(|k| k.is_restart_significant()) {
            values.push(self.int(*key).to_string());
        }
        RestartSignificantConfig(values)
    }

    /// Flat `name -> value` view of the explicitly set values.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        for (key, value) in &self.strings {
            map.insert(key.name().to_string(), value.clone());
        }
        for (key, value) in &self.ints {
            map.insert(key.name().to_string(), value.to_string());
        }
        map
    }

    /// Builds a config from a flat `name -> value` view.
    ///
    /// Unknown names are ignored so newer peers can add keys without breaking
    /// older ones. A non-numeric value for an integer key is an error.
    pub fn from_map<'a>(entries: impl IntoIterator<Item = (&'a str, &'a str)>) -> Result<Self> {
        let mut config = InstanceConfig::default();
        for (name, value) in entries {
            if let Some(key) = StringConfig::from_name(name) {
                config.strings.insert(key, value.to_string());
            } else if let Some(key) = IntConfig::from_name(name) {
                let parsed = value.trim().parse::<i64>().map_err(|_| {
                    ZkherdError::InvalidConfig(format!("{} must be an integer, got '{}'", name, value))
                })?;
                config.ints.insert(key, parsed);
            }
        }
        Ok(config)
    }

    /// JSON object with every key, defaults included.
    pub fn to_json(&self) -> Value {
        let mut object = Map::new();
        for key in StringConfig::ALL {
            object.insert(key.name().to_string(), Value::from(self.string(key)));
        }
        for key in IntConfig::ALL {
            object.insert(key.name().to_string(), Value::from(self.int(key)));
        }
        Value::Object(object)
    }

    pub fn from_json(value: &Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| ZkherdError::InvalidConfig("config must be a JSON object".into()))?;

        let mut rendered = Vec::with_capacity(object.len());
        for (name, value) in object {
            let text = match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                other => {
                    return Err(ZkherdError::InvalidConfig(format!(
                        "unsupported value for {}: {}",
                        name, other
                    )))
                }
            };
            rendered.push((name.as_str(), text));
        }

        Self::from_map(rendered.iter().map(|(k, v)| (*k, v.as_str())))
    }

    /// This config with every value present in the JSON object `overrides`
    /// replaced.
    pub fn with_overrides(&self, overrides: &Value) -> Result<Self> {
        let overrides = Self::from_json(overrides)?;
        let mut config = self.clone();
        config.strings.extend(overrides.strings);
        config.ints.extend(overrides.ints);
        Ok(config)
    }
}

/// Base config plus a set of overrides.
///
/// The base is never modified; [`ConfigBuilder::build`] returns a new
/// snapshot with the overrides applied on top.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    base: InstanceConfig,
    strings: BTreeMap<StringConfig, String>,
    ints: BTreeMap<IntConfig, i64>,
}

impl ConfigBuilder {
    pub fn new(base: &InstanceConfig) -> Self {
        Self {
            base: base.clone(),
            strings: BTreeMap::new(),
            ints: BTreeMap::new(),
        }
    }

    pub fn string(mut self, key: StringConfig, value: impl Into<String>) -> Self {
        self.strings.insert(key, value.into());
        self
    }

    pub fn int(mut self, key: IntConfig, value: i64) -> Self {
        self.ints.insert(key, value);
        self
    }

    pub fn server_list(self, list: &ServerList) -> Self {
        self.string(StringConfig::ServersSpec, list.to_spec_string())
    }

    pub fn build(self) -> InstanceConfig {
        let mut config = self.base;
        config.strings.extend(self.strings);
        config.ints.extend(self.ints);
        config
    }
}

/// The values that force a restart of the supervised server when they change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestartSignificantConfig(Vec<String>);
