//! CSI Volume Watcher
//!
//! Leader-side reconciliation that releases CSI volume claims held by
//! terminated allocations. For every volume with outstanding claims a watcher
//! blocks on the volume's index in the state store and, once an allocation
//! has terminated, detaches the volume from the node, then from the storage
//! controller, and finally frees the claim.
//!
//! The crate is split into several modules:
//! - `watcher`: the watcher registry and the per-volume watchers
//! - `batcher`: coalesces claim updates across volumes into batched writes
//! - `rpc`: the detach and claim-update RPCs, with a gRPC implementation
//! - `state`: the state store reads the watchers depend on
//! - `limiter`: token bucket for state store queries
//! - `config`, `metrics`, `error`: ambient plumbing

pub mod batcher;
pub mod config;
pub mod error;
pub mod limiter;
pub mod metrics;
pub mod rpc;
pub mod state;
pub mod watcher;

pub use batcher::VolumeUpdateBatcher;
pub use config::{RetryPolicy, WatcherConfig};
pub use error::{Result, WatcherError};
pub use rpc::{ClaimRpc, ControllerDetachRequest, NodeDetachRequest, RpcError};
pub use state::StateSource;
pub use watcher::{VolumeWatch, Watcher};
