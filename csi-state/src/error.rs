use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("volume not found: {0}")]
    VolumeNotFound(String),

    #[error("volume exists and is in use: {0}")]
    VolumeExists(String),

    #[error("volume in use: {0}")]
    VolumeInUse(String),

    #[error("unknown allocation: {0}")]
    UnknownAllocation(String),

    #[error("volume {0} is unschedulable")]
    Unschedulable(String),

    #[error("volume {0} max claim reached")]
    MaxClaimsReached(String),

    #[error("invalid {kind}: '{value}'")]
    Parse { kind: &'static str, value: String },

    #[error("failed to decode snapshot: {0}")]
    Snapshot(String),
}

pub type Result<T> = std::result::Result<T, StateError>;
