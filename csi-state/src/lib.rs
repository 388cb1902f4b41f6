//! CSI Volume State
//!
//! Data model for CSI volumes and their claims, and an in-memory versioned
//! store supporting blocking queries.
//!
//! The crate is split into several modules:
//! - `types`: allocations, nodes, plugins and claim records
//! - `volume`: the volume record and its claim transitions
//! - `store`: the indexed store and its blocking queries
//! - `snapshot`: JSON import/export of the store
//! - `mock`: fixture constructors

pub mod error;
pub mod mock;
pub mod snapshot;
pub mod store;
pub mod types;
pub mod volume;

pub use error::{Result, StateError};
pub use snapshot::Snapshot;
pub use store::StateStore;
pub use types::{
    AccessMode, Allocation, AttachmentMode, ClaimBatchRequest, ClaimMode, ClaimRequest,
    ClaimState, ClientStatus, CsiInfo, CsiNodeInfo, CsiPlugin, DesiredStatus, Node, VolumeClaim,
    VolumeKey,
};
pub use volume::CsiVolume;
