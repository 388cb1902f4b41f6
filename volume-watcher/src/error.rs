use csi_state::StateError;
use thiserror::Error;

use crate::rpc::RpcError;

#[derive(Error, Debug, Clone)]
pub enum WatcherError {
    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("claim update batcher is shut down")]
    BatcherClosed,

    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("node {node_id} has no node info for plugin {plugin_id}")]
    MissingNodeInfo { node_id: String, plugin_id: String },

    #[error("plugin lookup error: {0} missing plugin")]
    MissingPlugin(String),

    #[error("{count} claim(s) left pending on {volume}: {summary}")]
    ClaimsPending {
        volume: String,
        count: usize,
        summary: String,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl WatcherError {
    /// Errors worth retrying within the same pass.
    pub fn is_retryable(&self) -> bool {
        match self {
            WatcherError::Rpc(err) => err.is_retryable(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, WatcherError>;
