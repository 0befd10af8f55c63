pub mod activity;
pub mod automanage;
pub mod backup;
pub mod cleanup;
pub mod cluster;
pub mod config;
pub mod lock;
pub mod monitor;
pub mod process;
pub mod remote;
pub mod server_list;
pub mod state;
pub mod store;
pub mod supervisor;

pub use automanage::{AutoManageConfig, AutoManageOutcome, AutoManagePolicy, AutomaticInstanceManagement};
pub use backup::{BackupEntry, BackupSource, FileSystemBackupSource};
pub use cluster::{cluster_status, ClusterStatus};
pub use config::{
    CancelMode, ConfigCollection, ConfigManager, ConfigManagerOptions, InstanceConfig, IntConfig,
    LoadedConfig, RollingConfigState, StringConfig,
};
pub use lock::{LockPolicy, PseudoLock};
pub use monitor::{MonitorAction, MonitorConfig, MonitorRunningInstance};
pub use process::{ProcessOperations, StandardProcessOperations};
pub use remote::{
    HttpRemoteInstanceClient, LocalInstanceHandler, RemoteInstanceRequest,
    RemoteInstanceRequestClient, RemoteResponse,
};
pub use server_list::{ServerList, ServerSpec, ServerType};
pub use state::{
    ControlPanel, ControlPanelSwitch, FourLetterWord, InstanceStateType, InstanceStatus,
    SharedInstanceState, StatusProtocol,
};
pub use store::{ConfigStore, FileSystemConfigStore, MemoryConfigStore, StoreOutcome};
pub use supervisor::{Collaborators, Supervisor, SupervisorConfig, DEFAULT_PEER_PORT};
