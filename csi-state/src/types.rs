//! Cluster records referenced by CSI volumes.
//!
//! Allocations, nodes and plugins are owned by other subsystems; the state
//! store keeps copies so volume claims can be evaluated and detach requests
//! addressed. Enumerations parse from and render to the lowercase names used
//! in JSON snapshots and on the command line.

use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StateError;

// ============================================================================
// VolumeKey
// ============================================================================

/// Composite identity of a volume: volume IDs are only unique per namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VolumeKey {
    pub namespace: String,
    pub id: String,
}

impl VolumeKey {
    pub fn new(namespace: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            id: id.into(),
        }
    }
}

impl Display for VolumeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.namespace)
    }
}

// ============================================================================
// AccessMode / AttachmentMode
// ============================================================================

/// How many nodes may use a volume, and whether they may write to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessMode {
    SingleNodeReaderOnly,
    #[default]
    SingleNodeWriter,
    MultiNodeReaderOnly,
    MultiNodeSingleWriter,
    MultiNodeMultiWriter,
}

impl AccessMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            AccessMode::SingleNodeReaderOnly => "single-node-reader-only",
            AccessMode::SingleNodeWriter => "single-node-writer",
            AccessMode::MultiNodeReaderOnly => "multi-node-reader-only",
            AccessMode::MultiNodeSingleWriter => "multi-node-single-writer",
            AccessMode::MultiNodeMultiWriter => "multi-node-multi-writer",
        }
    }
}

impl Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccessMode {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "single-node-reader-only" => Ok(AccessMode::SingleNodeReaderOnly),
            "single-node-writer" => Ok(AccessMode::SingleNodeWriter),
            "multi-node-reader-only" => Ok(AccessMode::MultiNodeReaderOnly),
            "multi-node-single-writer" => Ok(AccessMode::MultiNodeSingleWriter),
            "multi-node-multi-writer" => Ok(AccessMode::MultiNodeMultiWriter),
            _ => Err(StateError::Parse {
                kind: "access mode",
                value: s.to_string(),
            }),
        }
    }
}

/// Whether the volume is presented to workloads as a filesystem or a raw device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttachmentMode {
    #[default]
    FileSystem,
    BlockDevice,
}

impl AttachmentMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            AttachmentMode::FileSystem => "file-system",
            AttachmentMode::BlockDevice => "block-device",
        }
    }
}

impl Display for AttachmentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttachmentMode {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "file-system" | "filesystem" => Ok(AttachmentMode::FileSystem),
            "block-device" | "block" => Ok(AttachmentMode::BlockDevice),
            _ => Err(StateError::Parse {
                kind: "attachment mode",
                value: s.to_string(),
            }),
        }
    }
}

// ============================================================================
// Claims
// ============================================================================

/// What a claim request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimMode {
    #[default]
    Read,
    Write,
    /// Issued by garbage collection of a terminal allocation.
    Gc,
    /// Checkpoint written by the unpublish workflow.
    Release,
}

impl Display for ClaimMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClaimMode::Read => write!(f, "read"),
            ClaimMode::Write => write!(f, "write"),
            ClaimMode::Gc => write!(f, "gc"),
            ClaimMode::Release => write!(f, "release"),
        }
    }
}

/// Progress of a claim through the unpublish workflow.
///
/// The ordering matters: states only ever advance, and a claim resumes from
/// the state recorded in the store after a failure or a leader change.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ClaimState {
    #[default]
    Taken,
    NodeDetached,
    ControllerDetached,
    ReadyToFree,
}

impl Display for ClaimState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClaimState::Taken => write!(f, "taken"),
            ClaimState::NodeDetached => write!(f, "node-detached"),
            ClaimState::ControllerDetached => write!(f, "controller-detached"),
            ClaimState::ReadyToFree => write!(f, "ready-to-free"),
        }
    }
}

/// Record that an allocation is using, or releasing, a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeClaim {
    pub allocation_id: String,
    pub node_id: String,
    #[serde(default)]
    pub mode: ClaimMode,
    #[serde(default)]
    pub state: ClaimState,
}

/// A request to change a volume's claims.
///
/// `allocation_id` is optional: a request without one only bumps the volume's
/// index so that watchers re-evaluate it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub volume_id: String,
    pub namespace: String,
    #[serde(default)]
    pub allocation_id: Option<String>,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub mode: ClaimMode,
    #[serde(default)]
    pub state: ClaimState,
}

impl ClaimRequest {
    /// A request addressing the whole volume, with no claim to change.
    pub fn for_volume(namespace: impl Into<String>, volume_id: impl Into<String>) -> Self {
        Self {
            volume_id: volume_id.into(),
            namespace: namespace.into(),
            allocation_id: None,
            node_id: None,
            mode: ClaimMode::default(),
            state: ClaimState::default(),
        }
    }

    pub fn key(&self) -> VolumeKey {
        VolumeKey::new(self.namespace.clone(), self.volume_id.clone())
    }

    pub fn to_claim(&self) -> VolumeClaim {
        VolumeClaim {
            allocation_id: self.allocation_id.clone().unwrap_or_default(),
            node_id: self.node_id.clone().unwrap_or_default(),
            mode: self.mode,
            state: self.state,
        }
    }
}

/// Claim updates applied to the store in a single write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimBatchRequest {
    pub claims: Vec<ClaimRequest>,
}

// ============================================================================
// Allocations
// ============================================================================

/// Status reported by the client running the allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    #[default]
    Pending,
    Running,
    Complete,
    Failed,
    Lost,
}

/// Status the scheduler wants the allocation to reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredStatus {
    #[default]
    Run,
    Stop,
    Evict,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: String,
    pub namespace: String,
    pub job_id: String,
    pub node_id: String,
    #[serde(default)]
    pub client_status: ClientStatus,
    #[serde(default)]
    pub desired_status: DesiredStatus,
    #[serde(default)]
    pub modify_index: u64,
}

impl Allocation {
    /// True once the allocation will never run again on its node.
    pub fn terminated(&self) -> bool {
        matches!(
            self.client_status,
            ClientStatus::Complete | ClientStatus::Failed | ClientStatus::Lost
        )
    }
}

// ============================================================================
// Nodes and plugins
// ============================================================================

/// Identity a node plugin reports for itself; controllers address nodes by it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsiNodeInfo {
    pub id: String,
}

/// Fingerprinted state of one CSI plugin on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsiInfo {
    pub plugin_id: String,
    #[serde(default)]
    pub healthy: bool,
    #[serde(default)]
    pub node_info: Option<CsiNodeInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Node plugins by plugin ID
    #[serde(default)]
    pub csi_node_plugins: BTreeMap<String, CsiInfo>,
    /// Controller plugins by plugin ID
    #[serde(default)]
    pub csi_controller_plugins: BTreeMap<String, CsiInfo>,
    #[serde(default)]
    pub modify_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsiPlugin {
    pub id: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub controller_required: bool,
    #[serde(default)]
    pub controllers_healthy: usize,
    #[serde(default)]
    pub nodes_healthy: usize,
    #[serde(default)]
    pub modify_index: u64,
}
