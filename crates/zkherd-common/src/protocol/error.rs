use thiserror::Error;

#[derive(Error, Debug)]
pub enum ZkherdError {
    #[error("Config store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Version conflict: expected {expected}, store has {actual}")]
    VersionConflict { expected: u64, actual: u64 },

    #[error("Could not acquire lock within {0}ms")]
    LockTimeout(u64),

    #[error("Process control failed: {0}")]
    ProcessControl(String),

    #[error("Peer {hostname} unreachable: {reason}")]
    PeerUnreachable { hostname: String, reason: String },

    #[error("Invalid server list: {0}")]
    InvalidServerList(String),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ZkherdError {
    /// Returns true for failures that are expected to clear up on the next
    /// scheduled pass without operator involvement.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ZkherdError::StoreUnavailable(_)
                | ZkherdError::VersionConflict { .. }
                | ZkherdError::LockTimeout(_)
                | ZkherdError::PeerUnreachable { .. }
                | ZkherdError::Timeout(_)
                | ZkherdError::Transport(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ZkherdError>;
