//! Line-oriented `key=value` encoding of a config collection.
//!
//! Used by the filesystem store and by `zkherd run --defaults`.
//!
//! ```text
//! zkherd.version=4
//! zkherd.root.servers-spec=1:a,2:b
//! zkherd.rolling.servers-spec=1:a,2:b,3:c
//! zkherd.rolling.hosts=c,a,b
//! zkherd.rolling.index=0
//! ```

use std::collections::BTreeMap;
use zkherd_common::protocol::error::{Result, ZkherdError};

use super::collection::{ConfigCollection, LoadedConfig, RollingConfig};
use super::instance::InstanceConfig;

const VERSION_KEY: &str = "zkherd.version";
const ROOT_PREFIX: &str = "zkherd.root.";
const ROLLING_PREFIX: &str = "zkherd.rolling.";
const ROLLING_HOSTS_KEY: &str = "zkherd.rolling.hosts";
const ROLLING_INDEX_KEY: &str = "zkherd.rolling.index";

pub fn encode(collection: &ConfigCollection, version: u64) -> String {
    let mut out = String::from("# zkherd shared configuration\n");
    out.push_str(&format!("{}={}\n", VERSION_KEY, version));

    for (name, value) in collection.root.to_map() {
        out.push_str(&format!("{}{}={}\n", ROOT_PREFIX, name, escape(&value)));
    }

    if let Some(rolling) = &collection.rolling {
        for (name, value) in rolling.config.to_map() {
            out.push_str(&format!("{}{}={}\n", ROLLING_PREFIX, name, escape(&value)));
        }
        out.push_str(&format!("{}={}\n", ROLLING_HOSTS_KEY, rolling.hosts.join(",")));
        out.push_str(&format!("{}={}\n", ROLLING_INDEX_KEY, rolling.index));
    }

    out
}

pub fn decode(text: &str) -> Result<LoadedConfig> {
    let mut properties = BTreeMap::new();
    for line in text.lines() {
        let line = line.trim_start();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(ZkherdError::InvalidConfig(format!("malformed line: {}", line)));
        };
        properties.insert(key.trim().to_string(), unescape(value));
    }

    let version = match properties.get(VERSION_KEY) {
        Some(v) => v.trim().parse::<u64>().map_err(|_| {
            ZkherdError::InvalidConfig(format!("bad version: {}", v))
        })?,
        None => 0,
    };

    let root = section(&properties, ROOT_PREFIX)?;

    let hosts: Vec<String> = properties
        .get(ROLLING_HOSTS_KEY)
        .map(|h| {
            h.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    let rolling = if hosts.is_empty() {
        None
    } else {
        let index = properties
            .get(ROLLING_INDEX_KEY)
            .and_then(|i| i.trim().parse::<usize>().ok())
            .unwrap_or(0);
        let config = section(&properties, ROLLING_PREFIX)?;
        Some(RollingConfig::new(config, hosts, index).ok_or_else(|| {
            ZkherdError::InvalidConfig("rolling index out of range".into())
        })?)
    };

    Ok(LoadedConfig {
        collection: ConfigCollection { root, rolling },
        version,
    })
}

/// Parses a plain defaults file (`name=value` lines without prefixes).
pub fn decode_defaults(text: &str) -> Result<InstanceConfig> {
    let pairs: Vec<(String, String)> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| l.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), unescape(v.trim())))
        .collect();
    InstanceConfig::from_map(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
}

fn section(properties: &BTreeMap<String, String>, prefix: &str) -> Result<InstanceConfig> {
    InstanceConfig::from_map(
        properties
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(prefix).map(|name| (name, v.as_str()))),
    )
}

fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}
