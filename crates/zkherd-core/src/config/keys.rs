//! Typed configuration keys.

use serde::{Deserialize, Serialize};

/// String-valued configuration items shared by the whole ensemble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StringConfig {
    ZookeeperInstallDirectory,
    ZookeeperDataDirectory,
    ServersSpec,
    /// `&` separated `key=value` pairs appended to `zoo.cfg`
    ZooCfgExtra,
    /// Contents of `conf/java.env`
    JavaEnvironment,
}

/// Integer-valued configuration items shared by the whole ensemble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IntConfig {
    ClientPort,
    ConnectPort,
    ElectionPort,
    CheckMs,
    ConnectionTimeoutMs,
    CleanupPeriodMs,
    CleanupMaxFiles,
    AutoManageInstances,
    AutoManageInstancesFixedEnsembleSize,
    AutoManageInstancesMinSize,
    /// How long cluster status must stay unchanged before membership is edited
    AutoManageInstancesSettlingPeriodMs,
    ObserverThreshold,
    DeadInstancePeriodMs,
    RollingMaxAttempts,
}

const HOUR_MS: i64 = 60 * 60 * 1000;

impl StringConfig {
    pub const ALL: [StringConfig; 5] = [
        StringConfig::ZookeeperInstallDirectory,
        StringConfig::ZookeeperDataDirectory,
        StringConfig::ServersSpec,
        StringConfig::ZooCfgExtra,
        StringConfig::JavaEnvironment,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            StringConfig::ZookeeperInstallDirectory => "zookeeper-install-directory",
            StringConfig::ZookeeperDataDirectory => "zookeeper-data-directory",
            StringConfig::ServersSpec => "servers-spec",
            StringConfig::ZooCfgExtra => "zoo-cfg-extra",
            StringConfig::JavaEnvironment => "java-environment",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.name() == name)
    }

    pub fn default_value(&self) -> &'static str {
        match self {
            StringConfig::ZooCfgExtra => "syncLimit=5&tickTime=2000&initLimit=10",
            _ => "",
        }
    }

    /// Whether a change to this key requires the supervised server to
    /// restart before it takes effect.
    pub fn is_restart_significant(&self) -> bool {
        !matches!(self, StringConfig::ServersSpec)
    }
}

impl IntConfig {
    pub const ALL: [IntConfig; 14] = [
        IntConfig::ClientPort,
        IntConfig::ConnectPort,
        IntConfig::ElectionPort,
        IntConfig::CheckMs,
        IntConfig::ConnectionTimeoutMs,
        IntConfig::CleanupPeriodMs,
        IntConfig::CleanupMaxFiles,
        IntConfig::AutoManageInstances,
        IntConfig::AutoManageInstancesFixedEnsembleSize,
        IntConfig::AutoManageInstancesMinSize,
        IntConfig::AutoManageInstancesSettlingPeriodMs,
        IntConfig::ObserverThreshold,
        IntConfig::DeadInstancePeriodMs,
        IntConfig::RollingMaxAttempts,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            IntConfig::ClientPort => "client-port",
            IntConfig::ConnectPort => "connect-port",
            IntConfig::ElectionPort => "election-port",
            IntConfig::CheckMs => "check-ms",
            IntConfig::ConnectionTimeoutMs => "connection-timeout-ms",
            IntConfig::CleanupPeriodMs => "cleanup-period-ms",
            IntConfig::CleanupMaxFiles => "cleanup-max-files",
            IntConfig::AutoManageInstances => "auto-manage-instances",
            IntConfig::AutoManageInstancesFixedEnsembleSize => {
                "auto-manage-instances-fixed-ensemble-size"
            }
            IntConfig::AutoManageInstancesMinSize => "auto-manage-instances-min-size",
            IntConfig::AutoManageInstancesSettlingPeriodMs => {
                "auto-manage-instances-settling-period-ms"
            }
            IntConfig::ObserverThreshold => "observer-threshold",
            IntConfig::DeadInstancePeriodMs => "dead-instance-period-ms",
            IntConfig::RollingMaxAttempts => "rolling-max-attempts",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.name() == name)
    }

    pub fn default_value(&self) -> i64 {
        match self {
            IntConfig::ClientPort => 2181,
            IntConfig::ConnectPort => 2888,
            IntConfig::ElectionPort => 3888,
            IntConfig::CheckMs => 30_000,
            IntConfig::ConnectionTimeoutMs => 10_000,
            IntConfig::CleanupPeriodMs => 12 * HOUR_MS,
            IntConfig::CleanupMaxFiles => 3,
            IntConfig::AutoManageInstances => 0,
            IntConfig::AutoManageInstancesFixedEnsembleSize => 0,
            IntConfig::AutoManageInstancesMinSize => 3,
            IntConfig::AutoManageInstancesSettlingPeriodMs => 3 * 60 * 1000,
            IntConfig::ObserverThreshold => 0,
            IntConfig::DeadInstancePeriodMs => HOUR_MS,
            IntConfig::RollingMaxAttempts => 20,
        }
    }

    pub fn is_restart_significant(&self) -> bool {
        self.is_port()
    }

    pub fn is_port(&self) -> bool {
        matches!(
            self,
            IntConfig::ClientPort | IntConfig::ConnectPort | IntConfig::ElectionPort
        )
    }

    /// Keys holding a millisecond period that drives a timer.
    pub fn is_period(&self) -> bool {
        matches!(
            self,
            IntConfig::CheckMs
                | IntConfig::ConnectionTimeoutMs
                | IntConfig::CleanupPeriodMs
                | IntConfig::DeadInstancePeriodMs
        )
    }
}
