//! Shared fixtures for the volume-watcher integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use csi_state::{
    Allocation, ClaimBatchRequest, ClaimMode, ClaimState, CsiPlugin, CsiVolume, Node, StateStore,
    VolumeClaim, mock,
};
use volume_watcher::config::{RetryPolicy, WatcherConfig};
use volume_watcher::rpc::{ClaimRpc, ControllerDetachRequest, NodeDetachRequest, RpcError};

/// Counts claim RPCs. When built with a store, claim updates are applied to
/// it the way the leader would; otherwise they only return an index.
#[derive(Default)]
pub struct MockRpc {
    store: Option<Arc<StateStore>>,
    /// Commit each claim of a batch at its own index
    unbatched: bool,
    node_detach: AtomicUsize,
    controller_detach: AtomicUsize,
    upserts: AtomicUsize,
    failing_allocs: Mutex<HashSet<String>>,
    pub node_detach_calls: Mutex<Vec<NodeDetachRequest>>,
    pub controller_detach_calls: Mutex<Vec<ControllerDetachRequest>>,
}

impl MockRpc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stateful(store: Arc<StateStore>) -> Self {
        Self {
            store: Some(store),
            ..Default::default()
        }
    }

    /// Like `stateful`, but commits the claims of a batch one at a time and
    /// returns the last index, the way a leader without batched writes does.
    pub fn stateful_unbatched(store: Arc<StateStore>) -> Self {
        Self {
            store: Some(store),
            unbatched: true,
            ..Default::default()
        }
    }

    pub fn node_detach_count(&self) -> usize {
        self.node_detach.load(Ordering::SeqCst)
    }

    pub fn controller_detach_count(&self) -> usize {
        self.controller_detach.load(Ordering::SeqCst)
    }

    pub fn upsert_count(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    /// Make node detach fail permanently for an allocation.
    pub fn fail_node_detach(&self, alloc_id: &str) {
        self.failing_allocs
            .lock()
            .unwrap()
            .insert(alloc_id.to_string());
    }

    pub fn clear_failures(&self) {
        self.failing_allocs.lock().unwrap().clear();
    }
}

#[tonic::async_trait]
impl ClaimRpc for MockRpc {
    async fn node_detach_volume(&self, req: NodeDetachRequest) -> Result<(), RpcError> {
        if self.failing_allocs.lock().unwrap().contains(&req.alloc_id) {
            return Err(RpcError::Permanent(format!(
                "node plugin refused to unpublish for {}",
                req.alloc_id
            )));
        }
        self.node_detach.fetch_add(1, Ordering::SeqCst);
        self.node_detach_calls.lock().unwrap().push(req);
        Ok(())
    }

    async fn controller_detach_volume(&self, req: ControllerDetachRequest) -> Result<(), RpcError> {
        self.controller_detach.fetch_add(1, Ordering::SeqCst);
        self.controller_detach_calls.lock().unwrap().push(req);
        Ok(())
    }

    async fn upsert_volume_claims(&self, req: ClaimBatchRequest) -> Result<u64, RpcError> {
        let count = self.upserts.fetch_add(1, Ordering::SeqCst) + 1;
        let Some(store) = &self.store else {
            return Ok(count as u64);
        };

        if !self.unbatched {
            return store
                .csi_volume_claims(0, &req.claims)
                .map_err(|e| RpcError::Permanent(e.to_string()));
        }

        let mut index = store.latest_index();
        for claim in req.claims {
            index = store
                .csi_volume_claim(0, &claim.namespace, &claim.volume_id, &claim.to_claim())
                .map_err(|e| RpcError::Permanent(e.to_string()))?;
        }
        Ok(index)
    }
}

/// Short windows and fast retries so tests finish quickly.
pub fn test_config() -> WatcherConfig {
    WatcherConfig {
        update_batch_duration: Duration::from_millis(20),
        query_timeout: Duration::from_secs(5),
        retry: RetryPolicy {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        },
        ..Default::default()
    }
}

pub fn test_plugin(store: &StateStore, controller_required: bool) -> CsiPlugin {
    let mut plugin = mock::csi_plugin();
    plugin.controller_required = controller_required;
    store.upsert_plugin(98, plugin.clone());
    plugin
}

pub fn test_node(store: &StateStore, plugin: &CsiPlugin) -> Node {
    let node = mock::node_with_plugin(plugin);
    store.upsert_node(99, node.clone());
    node
}

/// An allocation placed on `node`. Not written to the store.
pub fn test_alloc(node: &Node, status: csi_state::ClientStatus) -> Allocation {
    let mut alloc = mock::alloc();
    alloc.node_id = node.id.clone();
    alloc.client_status = status;
    alloc
}

/// A volume with a read claim for each allocation.
pub fn test_volume(plugin: &CsiPlugin, allocs: &[&Allocation]) -> CsiVolume {
    let mut vol = mock::csi_volume(plugin);
    vol.controller_required = plugin.controller_required;
    for alloc in allocs {
        vol.read_allocs.insert(alloc.id.clone(), None);
        vol.read_claims.insert(
            alloc.id.clone(),
            VolumeClaim {
                allocation_id: alloc.id.clone(),
                node_id: alloc.node_id.clone(),
                mode: ClaimMode::Read,
                state: ClaimState::Taken,
            },
        );
    }
    vol
}

/// Poll `check` every 10ms until it holds or `timeout` passes.
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// True once the volume holds no claims of any kind.
pub fn released(store: &StateStore, vol: &CsiVolume) -> bool {
    store
        .csi_volume_by_id(&vol.namespace, &vol.id)
        .is_some_and(|vol| vol.read_allocs.is_empty() && vol.past_claims.is_empty())
}
