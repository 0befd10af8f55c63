//! Cluster configuration: typed keys, snapshots, the persisted collection
//! and the manager that keeps it in sync with the store.

pub mod collection;
pub mod instance;
pub mod keys;
pub mod manager;
pub mod properties;
pub mod rolling;

pub use collection::{ConfigCollection, LoadedConfig, RollingConfig, RollingConfigState};
pub use instance::{ConfigBuilder, InstanceConfig, RestartSignificantConfig};
pub use keys::{IntConfig, StringConfig};
pub use manager::{CancelMode, ConfigListener, ConfigManager, ConfigManagerOptions, MutationGuard};
pub use rolling::{rolling_host_sequence, RollingHostSequence};
