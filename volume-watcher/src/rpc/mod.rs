//! Server-side RPCs driven by the unpublish workflow.
//!
//! `ClaimRpc` is the seam between the watchers and the rest of the cluster:
//! production uses the gRPC client in `client`, a watcher that owns its
//! store writes claims through `local`, and tests substitute recorders.

mod client;
mod local;
pub mod proto;
mod retry;

use std::collections::BTreeMap;

use csi_state::{AccessMode, AttachmentMode, ClaimBatchRequest};
use thiserror::Error;

pub use client::{GrpcClaimRpc, TlsConfig};
pub use local::LocalClaimRpc;
pub use retry::with_retry;

/// Failure of a claim RPC, classified by whether retrying can help.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("transient RPC failure: {0}")]
    Transient(String),

    #[error("RPC failed: {0}")]
    Permanent(String),
}

impl RpcError {
    /// Check if an error indicates a transient failure.
    ///
    /// Retryable errors come from codes where the server may succeed later:
    /// - Unavailable: Server temporarily unavailable
    /// - ResourceExhausted: Rate limited, may succeed after backoff
    /// - Aborted: Operation aborted, can be retried
    /// - Unknown: Unknown error, might be transient
    /// - DeadlineExceeded: Slow detach on the node or storage provider
    pub fn is_retryable(&self) -> bool {
        matches!(self, RpcError::Transient(_))
    }
}

impl From<tonic::Status> for RpcError {
    fn from(status: tonic::Status) -> Self {
        let message = format!("{:?}: {}", status.code(), status.message());
        match status.code() {
            tonic::Code::Unavailable
            | tonic::Code::ResourceExhausted
            | tonic::Code::Aborted
            | tonic::Code::Unknown
            | tonic::Code::DeadlineExceeded => RpcError::Transient(message),
            _ => RpcError::Permanent(message),
        }
    }
}

/// Node-side unpublish of a volume for one allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDetachRequest {
    pub plugin_id: String,
    pub volume_id: String,
    pub external_id: String,
    pub alloc_id: String,
    pub node_id: String,
    pub attachment_mode: AttachmentMode,
    pub access_mode: AccessMode,
    pub read_only: bool,
}

/// Controller-side unpublish of a volume from a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerDetachRequest {
    pub plugin_id: String,
    /// ID on the storage provider
    pub volume_id: String,
    /// The node's identity as reported by its node plugin
    pub client_csi_node_id: String,
    pub secrets: BTreeMap<String, String>,
}

#[tonic::async_trait]
pub trait ClaimRpc: Send + Sync {
    async fn node_detach_volume(&self, req: NodeDetachRequest) -> Result<(), RpcError>;

    async fn controller_detach_volume(&self, req: ControllerDetachRequest)
    -> Result<(), RpcError>;

    /// Apply a batch of claim updates, returning the index of the write.
    async fn upsert_volume_claims(&self, req: ClaimBatchRequest) -> Result<u64, RpcError>;
}
