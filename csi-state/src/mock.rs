//! Fixture constructors for tests and local experiments.
//!
//! Every call returns records with fresh random IDs so fixtures never collide
//! within a store.

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::types::{
    AccessMode, Allocation, AttachmentMode, ClientStatus, CsiInfo, CsiNodeInfo, CsiPlugin,
    DesiredStatus, Node,
};
use crate::volume::CsiVolume;

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// A running allocation placed on a random node.
pub fn alloc() -> Allocation {
    Allocation {
        id: new_id(),
        namespace: "default".to_string(),
        job_id: "example".to_string(),
        node_id: new_id(),
        client_status: ClientStatus::Running,
        desired_status: DesiredStatus::Run,
        modify_index: 0,
    }
}

pub fn node() -> Node {
    let id = new_id();
    Node {
        name: format!("node-{}", &id[..8]),
        id,
        csi_node_plugins: BTreeMap::new(),
        csi_controller_plugins: BTreeMap::new(),
        modify_index: 0,
    }
}

/// A node running `plugin` as both node and controller plugin. The plugin's
/// CSI node ID is the node ID.
pub fn node_with_plugin(plugin: &CsiPlugin) -> Node {
    let mut node = node();
    let info = CsiInfo {
        plugin_id: plugin.id.clone(),
        healthy: true,
        node_info: Some(CsiNodeInfo {
            id: node.id.clone(),
        }),
    };
    node.csi_node_plugins.insert(plugin.id.clone(), info.clone());
    node.csi_controller_plugins.insert(plugin.id.clone(), info);
    node
}

pub fn csi_plugin() -> CsiPlugin {
    CsiPlugin {
        id: format!("plugin-{}", &new_id()[..8]),
        provider: "org.example.csi".to_string(),
        version: "1.0.0".to_string(),
        controller_required: true,
        controllers_healthy: 1,
        nodes_healthy: 1,
        modify_index: 0,
    }
}

/// An unclaimed, schedulable single-writer volume served by `plugin`.
pub fn csi_volume(plugin: &CsiPlugin) -> CsiVolume {
    CsiVolume {
        id: new_id(),
        namespace: "default".to_string(),
        name: "test-volume".to_string(),
        external_id: "vol-01".to_string(),
        plugin_id: plugin.id.clone(),
        provider: plugin.provider.clone(),
        access_mode: AccessMode::SingleNodeWriter,
        attachment_mode: AttachmentMode::FileSystem,
        controller_required: false,
        schedulable: true,
        ..Default::default()
    }
}
