//! Point-in-time copy of the store, used to seed a store from JSON.

use serde::{Deserialize, Serialize};

use crate::error::{Result, StateError};
use crate::types::{Allocation, CsiPlugin, Node};
use crate::volume::CsiVolume;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Index to restore at; bumped past the store's latest index if stale
    #[serde(default)]
    pub index: u64,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub plugins: Vec<CsiPlugin>,
    #[serde(default)]
    pub allocs: Vec<Allocation>,
    #[serde(default)]
    pub volumes: Vec<CsiVolume>,
}

impl Snapshot {
    pub fn from_json(data: &str) -> Result<Self> {
        serde_json::from_str(data).map_err(|e| StateError::Snapshot(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| StateError::Snapshot(e.to_string()))
    }
}
