//! Read access to cluster state for the watchers.

use std::time::Duration;

use csi_state::{CsiPlugin, CsiVolume, Node, Result, StateStore};

/// The reads the watchers make against the leader's state store.
///
/// Blocking queries return the result together with the index it reflects.
/// They return once that index passes `min_index` or when `timeout` elapses,
/// whichever comes first. A missing record is `Ok(None)`; errors mean the
/// store itself could not be read.
#[tonic::async_trait]
pub trait StateSource: Send + Sync {
    fn csi_volume_by_id(&self, namespace: &str, volume_id: &str) -> Result<Option<CsiVolume>>;

    fn node_by_id(&self, node_id: &str) -> Result<Option<Node>>;

    fn csi_plugin_by_id(&self, plugin_id: &str) -> Result<Option<CsiPlugin>>;

    async fn wait_for_volume(
        &self,
        namespace: &str,
        volume_id: &str,
        min_index: u64,
        timeout: Duration,
    ) -> Result<(Option<CsiVolume>, u64)>;

    async fn wait_for_volumes(&self, min_index: u64, timeout: Duration)
    -> Result<(Vec<CsiVolume>, u64)>;
}

#[tonic::async_trait]
impl StateSource for StateStore {
    fn csi_volume_by_id(&self, namespace: &str, volume_id: &str) -> Result<Option<CsiVolume>> {
        Ok(StateStore::csi_volume_by_id(self, namespace, volume_id))
    }

    fn node_by_id(&self, node_id: &str) -> Result<Option<Node>> {
        Ok(StateStore::node_by_id(self, node_id))
    }

    fn csi_plugin_by_id(&self, plugin_id: &str) -> Result<Option<CsiPlugin>> {
        Ok(StateStore::csi_plugin_by_id(self, plugin_id))
    }

    async fn wait_for_volume(
        &self,
        namespace: &str,
        volume_id: &str,
        min_index: u64,
        timeout: Duration,
    ) -> Result<(Option<CsiVolume>, u64)> {
        Ok(StateStore::wait_for_volume(self, namespace, volume_id, min_index, timeout).await)
    }

    async fn wait_for_volumes(
        &self,
        min_index: u64,
        timeout: Duration,
    ) -> Result<(Vec<CsiVolume>, u64)> {
        Ok(StateStore::wait_for_volumes(self, min_index, timeout).await)
    }
}
