//! In-memory versioned state store.
//!
//! Every write is stamped with a raft-style index. The store never moves
//! its latest index backwards: a write carrying a stale index is applied at
//! `latest + 1`, and the index actually used is returned to the caller.
//!
//! Blocking queries subscribe to a `watch` channel carrying the latest index
//! and re-run their read each time it moves, returning as soon as the result
//! is newer than the caller's watermark or the timeout elapses.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{Result, StateError};
use crate::snapshot::Snapshot;
use crate::types::{
    Allocation, ClaimMode, ClaimRequest, ClaimState, CsiPlugin, Node, VolumeClaim, VolumeKey,
};
use crate::volume::CsiVolume;

pub const TABLE_VOLUMES: &str = "csi_volumes";
pub const TABLE_ALLOCS: &str = "allocs";
pub const TABLE_NODES: &str = "nodes";
pub const TABLE_PLUGINS: &str = "csi_plugins";

#[derive(Default)]
struct Tables {
    volumes: BTreeMap<VolumeKey, CsiVolume>,
    allocs: HashMap<String, Allocation>,
    nodes: HashMap<String, Node>,
    plugins: HashMap<String, CsiPlugin>,
    indexes: HashMap<&'static str, u64>,
    latest: u64,
}

impl Tables {
    /// Pick the index for a write and advance the latest index to it.
    fn next_index(&mut self, requested: u64) -> u64 {
        let index = if requested > self.latest {
            requested
        } else {
            self.latest + 1
        };
        self.latest = index;
        index
    }

    fn touch(&mut self, table: &'static str, index: u64) {
        self.indexes.insert(table, index);
    }

    fn table_index(&self, table: &str) -> u64 {
        self.indexes.get(table).copied().unwrap_or(0)
    }

    /// Apply one claim to a denormalized volume. Taken read and write claims
    /// need their allocation in the store.
    fn apply_claim(&self, vol: &mut CsiVolume, claim: &VolumeClaim) -> Result<()> {
        if claim.allocation_id.is_empty() {
            return Ok(());
        }
        let acquiring = claim.state == ClaimState::Taken
            && matches!(claim.mode, ClaimMode::Read | ClaimMode::Write);
        let alloc = if acquiring {
            match self.allocs.get(&claim.allocation_id) {
                Some(alloc) => Some(alloc),
                None => return Err(StateError::UnknownAllocation(claim.allocation_id.clone())),
            }
        } else {
            None
        };
        vol.claim(claim, alloc)
    }

    /// Fill in the allocations referenced by a volume's claims.
    fn denormalize(&self, mut vol: CsiVolume) -> CsiVolume {
        for (id, slot) in vol.read_allocs.iter_mut() {
            *slot = self.allocs.get(id).cloned();
        }
        for (id, slot) in vol.write_allocs.iter_mut() {
            *slot = self.allocs.get(id).cloned();
        }
        vol
    }
}

/// Versioned, indexed store of volumes and the records they reference.
pub struct StateStore {
    tables: RwLock<Tables>,
    index_tx: watch::Sender<u64>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    pub fn new() -> Self {
        let (index_tx, _) = watch::channel(0);
        Self {
            tables: RwLock::new(Tables::default()),
            index_tx,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, index: u64) {
        self.index_tx.send_replace(index);
    }

    /// Highest index applied to any table.
    pub fn latest_index(&self) -> u64 {
        self.read().latest
    }

    /// Index of the last write to a single table.
    pub fn index(&self, table: &str) -> u64 {
        self.read().table_index(table)
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    pub fn upsert_node(&self, index: u64, mut node: Node) -> u64 {
        let index = {
            let mut tables = self.write();
            let index = tables.next_index(index);
            node.modify_index = index;
            debug!(node_id = %node.id, index, "Upserting node");
            tables.nodes.insert(node.id.clone(), node);
            tables.touch(TABLE_NODES, index);
            index
        };
        self.publish(index);
        index
    }

    pub fn upsert_plugin(&self, index: u64, mut plugin: CsiPlugin) -> u64 {
        let index = {
            let mut tables = self.write();
            let index = tables.next_index(index);
            plugin.modify_index = index;
            debug!(plugin_id = %plugin.id, index, "Upserting CSI plugin");
            tables.plugins.insert(plugin.id.clone(), plugin);
            tables.touch(TABLE_PLUGINS, index);
            index
        };
        self.publish(index);
        index
    }

    pub fn upsert_allocs(&self, index: u64, allocs: Vec<Allocation>) -> u64 {
        let index = {
            let mut tables = self.write();
            let index = tables.next_index(index);
            for mut alloc in allocs {
                alloc.modify_index = index;
                debug!(alloc_id = %alloc.id, status = ?alloc.client_status, index, "Upserting allocation");
                tables.allocs.insert(alloc.id.clone(), alloc);
            }
            tables.touch(TABLE_ALLOCS, index);
            index
        };
        self.publish(index);
        index
    }

    /// Register volumes. Re-registering an existing volume is allowed only
    /// while nothing holds a claim on it.
    pub fn csi_volume_register(&self, index: u64, volumes: Vec<CsiVolume>) -> Result<u64> {
        let index = {
            let mut tables = self.write();
            for vol in &volumes {
                if let Some(existing) = tables.volumes.get(&vol.key())
                    && existing.in_use()
                {
                    return Err(StateError::VolumeExists(vol.key().to_string()));
                }
            }

            let index = tables.next_index(index);
            for mut vol in volumes {
                let key = vol.key();
                vol.create_index = tables
                    .volumes
                    .get(&key)
                    .map(|existing| existing.create_index)
                    .unwrap_or(index);
                vol.modify_index = index;
                vol.normalize();
                debug!(volume = %key, index, "Registering CSI volume");
                tables.volumes.insert(key, vol);
            }
            tables.touch(TABLE_VOLUMES, index);
            index
        };
        self.publish(index);
        Ok(index)
    }

    /// Apply a claim to a volume.
    ///
    /// A claim with no allocation ID only bumps the volume's index, which is
    /// enough to wake anything watching it.
    pub fn csi_volume_claim(
        &self,
        index: u64,
        namespace: &str,
        volume_id: &str,
        claim: &VolumeClaim,
    ) -> Result<u64> {
        let key = VolumeKey::new(namespace, volume_id);
        let index = {
            let mut tables = self.write();
            let Some(stored) = tables.volumes.get(&key) else {
                return Err(StateError::VolumeNotFound(key.to_string()));
            };
            let mut vol = tables.denormalize(stored.clone());
            tables.apply_claim(&mut vol, claim)?;

            let index = tables.next_index(index);
            vol.modify_index = index;
            vol.normalize();
            debug!(
                volume = %key,
                alloc_id = %claim.allocation_id,
                mode = %claim.mode,
                state = %claim.state,
                index,
                "Applied volume claim"
            );
            tables.volumes.insert(key, vol);
            tables.touch(TABLE_VOLUMES, index);
            index
        };
        self.publish(index);
        Ok(index)
    }

    /// Apply a batch of claim updates in a single write.
    ///
    /// Either every claim applies or none does, and every volume the batch
    /// touches takes the batch's index as its modify index.
    pub fn csi_volume_claims(&self, index: u64, claims: &[ClaimRequest]) -> Result<u64> {
        if claims.is_empty() {
            return Ok(self.latest_index());
        }

        let index = {
            let mut tables = self.write();
            let mut staged: BTreeMap<VolumeKey, CsiVolume> = BTreeMap::new();
            for req in claims {
                let key = req.key();
                if !staged.contains_key(&key) {
                    let Some(stored) = tables.volumes.get(&key) else {
                        return Err(StateError::VolumeNotFound(key.to_string()));
                    };
                    let vol = tables.denormalize(stored.clone());
                    staged.insert(key.clone(), vol);
                }
                if let Some(vol) = staged.get_mut(&key) {
                    tables.apply_claim(vol, &req.to_claim())?;
                }
            }

            let index = tables.next_index(index);
            debug!(
                claims = claims.len(),
                volumes = staged.len(),
                index,
                "Applied volume claim batch"
            );
            for (key, mut vol) in staged {
                vol.modify_index = index;
                vol.normalize();
                tables.volumes.insert(key, vol);
            }
            tables.touch(TABLE_VOLUMES, index);
            index
        };
        self.publish(index);
        Ok(index)
    }

    pub fn csi_volume_deregister(
        &self,
        index: u64,
        namespace: &str,
        volume_ids: &[String],
    ) -> Result<u64> {
        let index = {
            let mut tables = self.write();
            for id in volume_ids {
                let key = VolumeKey::new(namespace, id.clone());
                match tables.volumes.get(&key) {
                    None => return Err(StateError::VolumeNotFound(key.to_string())),
                    Some(vol) if vol.in_use() => {
                        return Err(StateError::VolumeInUse(key.to_string()));
                    }
                    Some(_) => {}
                }
            }

            let index = tables.next_index(index);
            for id in volume_ids {
                let key = VolumeKey::new(namespace, id.clone());
                debug!(volume = %key, index, "Deregistering CSI volume");
                tables.volumes.remove(&key);
            }
            tables.touch(TABLE_VOLUMES, index);
            index
        };
        self.publish(index);
        Ok(index)
    }

    /// Load every record of a snapshot in a single write.
    pub fn restore(&self, snapshot: Snapshot) -> u64 {
        let index = {
            let mut tables = self.write();
            let index = tables.next_index(snapshot.index);
            for mut node in snapshot.nodes {
                node.modify_index = index;
                tables.nodes.insert(node.id.clone(), node);
            }
            for mut plugin in snapshot.plugins {
                plugin.modify_index = index;
                tables.plugins.insert(plugin.id.clone(), plugin);
            }
            for mut alloc in snapshot.allocs {
                alloc.modify_index = index;
                tables.allocs.insert(alloc.id.clone(), alloc);
            }
            for mut vol in snapshot.volumes {
                if vol.create_index == 0 {
                    vol.create_index = index;
                }
                vol.modify_index = index;
                vol.normalize();
                tables.volumes.insert(vol.key(), vol);
            }
            for table in [TABLE_NODES, TABLE_PLUGINS, TABLE_ALLOCS, TABLE_VOLUMES] {
                tables.touch(table, index);
            }
            index
        };
        self.publish(index);
        index
    }

    /// Copy every record out of the store.
    pub fn snapshot(&self) -> Snapshot {
        let tables = self.read();
        Snapshot {
            index: tables.latest,
            nodes: tables.nodes.values().cloned().collect(),
            plugins: tables.plugins.values().cloned().collect(),
            allocs: tables.allocs.values().cloned().collect(),
            volumes: tables.volumes.values().cloned().collect(),
        }
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    pub fn csi_volume_by_id(&self, namespace: &str, volume_id: &str) -> Option<CsiVolume> {
        let tables = self.read();
        tables
            .volumes
            .get(&VolumeKey::new(namespace, volume_id))
            .map(|vol| tables.denormalize(vol.clone()))
    }

    pub fn csi_volumes(&self) -> Vec<CsiVolume> {
        let tables = self.read();
        tables
            .volumes
            .values()
            .map(|vol| tables.denormalize(vol.clone()))
            .collect()
    }

    pub fn csi_volumes_by_namespace(&self, namespace: &str) -> Vec<CsiVolume> {
        let tables = self.read();
        tables
            .volumes
            .values()
            .filter(|vol| vol.namespace == namespace)
            .map(|vol| tables.denormalize(vol.clone()))
            .collect()
    }

    pub fn alloc_by_id(&self, id: &str) -> Option<Allocation> {
        self.read().allocs.get(id).cloned()
    }

    pub fn node_by_id(&self, id: &str) -> Option<Node> {
        self.read().nodes.get(id).cloned()
    }

    pub fn csi_plugin_by_id(&self, id: &str) -> Option<CsiPlugin> {
        self.read().plugins.get(id).cloned()
    }

    // ------------------------------------------------------------------------
    // Blocking queries
    // ------------------------------------------------------------------------

    /// Wait until the volume's index passes `min_index`.
    ///
    /// For a volume that doesn't exist the volume table index is reported,
    /// so a deregistration wakes the caller with `None`.
    pub async fn wait_for_volume(
        &self,
        namespace: &str,
        volume_id: &str,
        min_index: u64,
        timeout: Duration,
    ) -> (Option<CsiVolume>, u64) {
        let key = VolumeKey::new(namespace, volume_id);
        self.blocking_query(min_index, timeout, |tables| match tables.volumes.get(&key) {
            Some(vol) => (Some(tables.denormalize(vol.clone())), vol.modify_index),
            None => (None, tables.table_index(TABLE_VOLUMES)),
        })
        .await
    }

    /// Wait until the volume table's index passes `min_index`.
    pub async fn wait_for_volumes(
        &self,
        min_index: u64,
        timeout: Duration,
    ) -> (Vec<CsiVolume>, u64) {
        self.blocking_query(min_index, timeout, |tables| {
            let vols = tables
                .volumes
                .values()
                .map(|vol| tables.denormalize(vol.clone()))
                .collect();
            (vols, tables.table_index(TABLE_VOLUMES))
        })
        .await
    }

    async fn blocking_query<T, F>(&self, min_index: u64, timeout: Duration, query: F) -> (T, u64)
    where
        F: Fn(&Tables) -> (T, u64),
    {
        let deadline = Instant::now() + timeout;
        // Subscribe before the first read so a write in between isn't missed
        let mut index_rx = self.index_tx.subscribe();
        loop {
            let (value, index) = {
                let tables = self.read();
                query(&tables)
            };
            if index > min_index {
                return (value, index);
            }
            match tokio::time::timeout_at(deadline, index_rx.changed()).await {
                Ok(Ok(())) => continue,
                // Timed out, or the store is being torn down
                Ok(Err(_)) | Err(_) => return (value, index),
            }
        }
    }
}
