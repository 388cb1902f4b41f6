//! The Watcher Set: leader-lifecycle gate and registry of volume watchers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use csi_state::{ClaimRequest, CsiVolume, StateStore, VolumeKey};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, instrument, warn};

use super::volume_watch::{VolumeWatch, WatchContext};
use crate::batcher::VolumeUpdateBatcher;
use crate::config::{QUERY_LIMIT_BURST, WatcherConfig};
use crate::error::Result;
use crate::limiter::QueryLimiter;
use crate::metrics;
use crate::rpc::{ClaimRpc, LocalClaimRpc};
use crate::state::StateSource;

/// Registry state, guarded by a std mutex that is never held across an await.
#[derive(Default)]
struct Registry {
    enabled: bool,
    watchers: HashMap<VolumeKey, VolumeWatch>,
    ctx: Option<Arc<WatchContext>>,
    discovery: Option<JoinHandle<()>>,
}

pub(crate) struct Shared {
    rpc: Arc<dyn ClaimRpc>,
    config: WatcherConfig,
    limiter: QueryLimiter,
    registry: Mutex<Registry>,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop a watcher's entry if it is still the registered one.
    pub(crate) fn remove_watcher(&self, watch: &VolumeWatch) {
        let mut registry = self.registry();
        if registry
            .watchers
            .get(watch.key())
            .is_some_and(|current| current.same_as(watch))
        {
            registry.watchers.remove(watch.key());
            metrics::set_watchers_registered(registry.watchers.len());
        }
    }

    /// Notify the volume's watcher, creating it first if needed. New
    /// watchers wait on the query limiter. Returns false once disabled.
    async fn add(&self, vol: CsiVolume) -> bool {
        let key = vol.key();
        {
            let registry = self.registry();
            if !registry.enabled {
                return false;
            }
            if let Some(watch) = registry.watchers.get(&key) {
                watch.notify(vol);
                return true;
            }
        }

        self.limiter.wait().await;

        let mut registry = self.registry();
        if !registry.enabled {
            return false;
        }
        let Some(ctx) = registry.ctx.clone() else {
            return false;
        };
        let watch = registry
            .watchers
            .entry(key.clone())
            .or_insert_with(|| {
                debug!(volume = %key, "Creating volume watcher");
                VolumeWatch::new(key, ctx)
            })
            .clone();
        watch.notify(vol);
        metrics::set_watchers_registered(registry.watchers.len());
        true
    }
}

/// Runs one `VolumeWatch` per volume with outstanding claims while this
/// server is the leader.
#[derive(Clone)]
pub struct Watcher {
    shared: Arc<Shared>,
}

impl Watcher {
    pub fn new(rpc: Arc<dyn ClaimRpc>, config: WatcherConfig) -> Self {
        let limiter = QueryLimiter::new(config.query_limit_per_sec, QUERY_LIMIT_BURST);
        Self {
            shared: Arc::new(Shared {
                rpc,
                config,
                limiter,
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    /// A watcher whose claim updates are applied to `store` directly, with
    /// node and controller detach sent through `detach`. Enable it with the
    /// same store.
    pub fn with_local_store(
        store: Arc<StateStore>,
        detach: Arc<dyn ClaimRpc>,
        config: WatcherConfig,
    ) -> Self {
        Self::new(Arc::new(LocalClaimRpc::new(store, detach)), config)
    }

    /// Start or stop the watchers on a leadership transition.
    ///
    /// Enabling is idempotent and returns at once; volumes are discovered in
    /// the background. Disabling returns only after every watcher task, the
    /// discovery task and the batcher have exited, with the registry empty.
    #[instrument(skip(self, state))]
    pub async fn set_enabled(&self, enabled: bool, state: Arc<dyn StateSource>) {
        if enabled {
            self.enable(state);
        } else {
            self.disable().await;
        }
    }

    fn enable(&self, state: Arc<dyn StateSource>) {
        let mut registry = self.shared.registry();
        if registry.enabled {
            debug!("Volume watcher already enabled");
            return;
        }

        let cancel = CancellationToken::new();
        let batcher = VolumeUpdateBatcher::new(
            self.shared.config.update_batch_duration,
            self.shared.rpc.clone(),
            cancel.child_token(),
        );
        let ctx = Arc::new(WatchContext {
            state: state.clone(),
            rpc: self.shared.rpc.clone(),
            batcher,
            config: self.shared.config.clone(),
            cancel,
            registry: Arc::downgrade(&self.shared),
        });

        let discovery = discover(self.shared.clone(), ctx.clone());
        registry.discovery = Some(tokio::spawn(
            discovery.instrument(info_span!("volume_discovery")),
        ));
        registry.ctx = Some(ctx);
        registry.enabled = true;
        info!("Volume watcher enabled");
    }

    async fn disable(&self) {
        let (watchers, ctx, discovery) = {
            let mut registry = self.shared.registry();
            if !registry.enabled {
                debug!("Volume watcher already disabled");
                return;
            }
            registry.enabled = false;
            (
                std::mem::take(&mut registry.watchers),
                registry.ctx.take(),
                registry.discovery.take(),
            )
        };
        metrics::set_watchers_registered(0);

        if let Some(ctx) = &ctx {
            ctx.cancel.cancel();
        }
        if let Some(discovery) = discovery
            && let Err(e) = discovery.await
        {
            warn!(error = %e, "Volume discovery task failed");
        }
        let count = watchers.len();
        for watch in watchers.into_values() {
            watch.stop().await;
        }
        if let Some(ctx) = ctx {
            ctx.batcher.shutdown().await;
        }
        info!(watchers = count, "Volume watcher disabled");
    }

    /// Make sure the volume named by `req` is being watched.
    ///
    /// A no-op when disabled, when the volume isn't registered, when it has
    /// no claims, or when `req` names an allocation the volume doesn't know.
    #[instrument(skip(self, req), fields(volume = %req.key()))]
    pub async fn reap(&self, req: &ClaimRequest) -> Result<()> {
        let state = {
            let registry = self.shared.registry();
            match (&registry.ctx, registry.enabled) {
                (Some(ctx), true) => ctx.state.clone(),
                _ => {
                    debug!("Volume watcher disabled, ignoring reap");
                    return Ok(());
                }
            }
        };

        let Some(vol) = state.csi_volume_by_id(&req.namespace, &req.volume_id)? else {
            debug!("Volume not registered, nothing to reap");
            return Ok(());
        };
        if !vol.has_claims() {
            debug!("Volume has no claims, nothing to reap");
            return Ok(());
        }
        if let Some(alloc_id) = &req.allocation_id
            && !has_allocation(&vol, alloc_id)
        {
            debug!(alloc_id = %alloc_id, "Allocation holds no claim on volume");
            return Ok(());
        }

        self.shared.add(vol).await;
        Ok(())
    }

    /// Number of registered watchers, running or dormant.
    pub fn len(&self) -> usize {
        self.shared.registry().watchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &VolumeKey) -> Option<VolumeWatch> {
        self.shared.registry().watchers.get(key).cloned()
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.registry().enabled
    }
}

fn has_allocation(vol: &CsiVolume, alloc_id: &str) -> bool {
    vol.read_allocs.contains_key(alloc_id)
        || vol.write_allocs.contains_key(alloc_id)
        || vol.past_claims.contains_key(alloc_id)
}

/// Long-poll the volume table and hand every volume with claims to its
/// watcher, starting watchers as needed.
async fn discover(shared: Arc<Shared>, ctx: Arc<WatchContext>) {
    let cancel = &ctx.cancel;
    let mut min_index = 0;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = shared.limiter.wait() => {}
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = ctx.state.wait_for_volumes(min_index, shared.config.query_timeout) => result,
        };
        let (vols, index) = match result {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "Failed to list volumes");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(shared.config.retry.initial_backoff) => {}
                }
                continue;
            }
        };
        if index <= min_index {
            continue;
        }
        min_index = index;

        let claimed: Vec<_> = vols.into_iter().filter(CsiVolume::has_claims).collect();
        debug!(index, volumes = claimed.len(), "Discovered volumes with claims");
        for vol in claimed {
            let added = tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                added = shared.add(vol) => added,
            };
            if !added {
                break;
            }
        }
    }
    debug!("Volume discovery stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use csi_state::{ClaimMode, ClaimState, VolumeClaim};

    fn claim(alloc_id: &str, state: ClaimState) -> VolumeClaim {
        VolumeClaim {
            allocation_id: alloc_id.to_string(),
            node_id: "n1".to_string(),
            mode: ClaimMode::Release,
            state,
        }
    }

    #[test]
    fn test_has_allocation() {
        let mut vol = CsiVolume::default();
        vol.read_allocs.insert("reader".to_string(), None);
        vol.write_allocs.insert("writer".to_string(), None);
        vol.past_claims.insert(
            "leaving".to_string(),
            claim("leaving", ClaimState::NodeDetached),
        );

        assert!(has_allocation(&vol, "reader"));
        assert!(has_allocation(&vol, "writer"));
        assert!(has_allocation(&vol, "leaving"));
        assert!(!has_allocation(&vol, "stranger"));
    }

    #[tokio::test]
    async fn test_reap_ignores_unknown_allocation() {
        use crate::rpc::{ControllerDetachRequest, NodeDetachRequest, RpcError};
        use csi_state::{ClaimBatchRequest, StateStore, mock};

        struct NoRpc;

        #[tonic::async_trait]
        impl ClaimRpc for NoRpc {
            async fn node_detach_volume(
                &self,
                _: NodeDetachRequest,
            ) -> std::result::Result<(), RpcError> {
                Ok(())
            }
            async fn controller_detach_volume(
                &self,
                _: ControllerDetachRequest,
            ) -> std::result::Result<(), RpcError> {
                Ok(())
            }
            async fn upsert_volume_claims(
                &self,
                _: ClaimBatchRequest,
            ) -> std::result::Result<u64, RpcError> {
                Ok(0)
            }
        }

        let store = Arc::new(StateStore::new());
        let mut vol = mock::csi_volume(&mock::csi_plugin());
        vol.past_claims
            .insert("leaving".to_string(), claim("leaving", ClaimState::NodeDetached));
        store.csi_volume_register(1, vec![vol.clone()]).unwrap();

        let watcher = Watcher::new(Arc::new(NoRpc), WatcherConfig::default());
        // enable by hand without discovery so only reap can add watchers
        {
            let mut registry = watcher.shared.registry();
            registry.enabled = true;
            registry.ctx = Some(Arc::new(WatchContext {
                state: store.clone(),
                rpc: Arc::new(NoRpc),
                batcher: VolumeUpdateBatcher::new(
                    WatcherConfig::default().update_batch_duration,
                    Arc::new(NoRpc),
                    CancellationToken::new(),
                ),
                config: WatcherConfig::default(),
                cancel: CancellationToken::new(),
                registry: Arc::downgrade(&watcher.shared),
            }));
        }

        let mut req = ClaimRequest::for_volume(&vol.namespace, &vol.id);
        req.allocation_id = Some("stranger".to_string());
        watcher.reap(&req).await.unwrap();
        assert!(watcher.is_empty());

        req.allocation_id = Some("leaving".to_string());
        watcher.reap(&req).await.unwrap();
        assert_eq!(watcher.len(), 1);

        watcher.set_enabled(false, store).await;
        assert!(watcher.is_empty());
    }
}
