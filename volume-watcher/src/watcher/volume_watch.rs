//! Per-volume watcher.
//!
//! A `VolumeWatch` owns one volume's unpublish workflow. While running, its
//! task blocks on the volume's index in the state store, and on every change
//! collects the claims whose allocations have terminated and drives each one
//! through node detach, controller detach and release. The task stops on its
//! own once the volume has no claims left; the entry stays in the registry
//! and the next `notify` starts it again.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use csi_state::{AccessMode, ClaimMode, ClaimRequest, ClaimState, CsiVolume, VolumeClaim, VolumeKey};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, instrument, warn};

use super::volumes_watcher::Shared;
use crate::batcher::VolumeUpdateBatcher;
use crate::config::WatcherConfig;
use crate::error::{Result, WatcherError};
use crate::metrics::{self, OperationTimer};
use crate::rpc::{ClaimRpc, ControllerDetachRequest, NodeDetachRequest, with_retry};
use crate::state::StateSource;

/// Everything the watchers of one leadership term share.
pub(crate) struct WatchContext {
    pub state: Arc<dyn StateSource>,
    pub rpc: Arc<dyn ClaimRpc>,
    pub batcher: VolumeUpdateBatcher,
    pub config: WatcherConfig,
    /// Parent of every watcher task's token; cancelled on step-down
    pub cancel: CancellationToken,
    pub registry: Weak<Shared>,
}

#[derive(Default)]
struct Lifecycle {
    running: bool,
    /// Bumped on every start so a superseded task can tell it is stale
    generation: u64,
    cancel: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
    tx: Option<mpsc::UnboundedSender<CsiVolume>>,
}

struct Inner {
    key: VolumeKey,
    ctx: Arc<WatchContext>,
    lifecycle: Mutex<Lifecycle>,
    last_index: AtomicU64,
}

impl Inner {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to a volume's watcher. Clones refer to the same watcher.
#[derive(Clone)]
pub struct VolumeWatch {
    inner: Arc<Inner>,
}

impl VolumeWatch {
    pub(crate) fn new(key: VolumeKey, ctx: Arc<WatchContext>) -> Self {
        Self {
            inner: Arc::new(Inner {
                key,
                ctx,
                lifecycle: Mutex::new(Lifecycle::default()),
                last_index: AtomicU64::new(0),
            }),
        }
    }

    pub fn key(&self) -> &VolumeKey {
        &self.inner.key
    }

    pub fn is_running(&self) -> bool {
        self.inner.lifecycle().running
    }

    /// Index of the last volume state the watcher acted on.
    pub fn last_index(&self) -> u64 {
        self.inner.last_index.load(Ordering::Acquire)
    }

    pub fn same_as(&self, other: &VolumeWatch) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Hand the watcher a volume state to act on, starting it if stopped.
    pub fn notify(&self, vol: CsiVolume) {
        let mut lifecycle = self.inner.lifecycle();
        if !lifecycle.running {
            self.start_locked(&mut lifecycle);
        }
        if let Some(tx) = &lifecycle.tx {
            // The task only drops its receiver after clearing `tx`
            let _ = tx.send(vol);
        }
    }

    pub fn start(&self) {
        let mut lifecycle = self.inner.lifecycle();
        if !lifecycle.running {
            self.start_locked(&mut lifecycle);
        }
    }

    fn start_locked(&self, lifecycle: &mut Lifecycle) {
        if self.inner.ctx.cancel.is_cancelled() {
            debug!(volume = %self.inner.key, "Not starting volume watcher after step-down");
            return;
        }

        lifecycle.generation += 1;
        let cancel = self.inner.ctx.cancel.child_token();
        let (tx, rx) = mpsc::unbounded_channel();
        let span = info_span!("volume_watch", volume = %self.inner.key);
        let task = run(self.inner.clone(), lifecycle.generation, cancel.clone(), rx);

        lifecycle.running = true;
        lifecycle.cancel = Some(cancel);
        lifecycle.tx = Some(tx);
        lifecycle.handle = Some(tokio::spawn(task.instrument(span)));
    }

    /// Cancel the task and wait for it to exit.
    pub async fn stop(&self) {
        let (cancel, handle) = {
            let mut lifecycle = self.inner.lifecycle();
            lifecycle.running = false;
            lifecycle.tx = None;
            (lifecycle.cancel.take(), lifecycle.handle.take())
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!(volume = %self.inner.key, error = %e, "Volume watcher task failed");
        }
    }

    /// Mark the watcher stopped unless a notification is waiting or another
    /// run has taken over. Returns true if the task should exit.
    fn finish_if_idle(&self, generation: u64, rx: &mpsc::UnboundedReceiver<CsiVolume>) -> bool {
        let mut lifecycle = self.inner.lifecycle();
        if lifecycle.generation != generation {
            return true;
        }
        if !rx.is_empty() {
            return false;
        }
        lifecycle.running = false;
        lifecycle.tx = None;
        lifecycle.cancel = None;
        true
    }

    fn deregistered(&self, generation: u64) {
        {
            let mut lifecycle = self.inner.lifecycle();
            if lifecycle.generation == generation {
                lifecycle.running = false;
                lifecycle.tx = None;
                lifecycle.cancel = None;
            }
        }
        if let Some(registry) = self.inner.ctx.registry.upgrade() {
            registry.remove_watcher(self);
        }
    }
}

enum Wake {
    Hint(CsiVolume),
    Query(csi_state::Result<(Option<CsiVolume>, u64)>),
}

async fn run(
    inner: Arc<Inner>,
    generation: u64,
    cancel: CancellationToken,
    mut rx: mpsc::UnboundedReceiver<CsiVolume>,
) {
    metrics::record_watcher_start();
    debug!("Volume watcher started");
    let watch = VolumeWatch { inner };
    let reason = watch_loop(&watch, generation, &cancel, &mut rx).await;
    metrics::record_watcher_stop(reason);
    debug!(reason, "Volume watcher stopped");
}

async fn watch_loop(
    watch: &VolumeWatch,
    generation: u64,
    cancel: &CancellationToken,
    rx: &mut mpsc::UnboundedReceiver<CsiVolume>,
) -> &'static str {
    let inner = &watch.inner;
    let ctx = &inner.ctx;
    let key = &inner.key;

    // Index of the last state acted on, and of the last checkpoint written
    let mut processed = 0u64;
    let mut written = 0u64;
    let mut retry_pending = false;

    loop {
        let wait_index = processed.max(written.saturating_sub(1));
        let wake = tokio::select! {
            biased;
            _ = cancel.cancelled() => return "cancelled",
            hint = rx.recv() => match hint {
                Some(vol) => Wake::Hint(vol),
                None => return "closed",
            },
            result = ctx.state.wait_for_volume(
                &key.namespace,
                &key.id,
                wait_index,
                ctx.config.query_timeout,
            ) => Wake::Query(result),
        };

        let vol = match wake {
            Wake::Hint(vol) => {
                if vol.modify_index < processed.max(written) {
                    debug!(index = vol.modify_index, processed, written, "Ignoring stale notification");
                    continue;
                }
                // The hint only says something changed; act on what the
                // store holds now
                match ctx.state.csi_volume_by_id(&key.namespace, &key.id) {
                    Ok(vol) => vol,
                    Err(e) => {
                        warn!(error = %e, "Failed to look up volume");
                        continue;
                    }
                }
            }
            Wake::Query(Ok((vol, index))) => {
                // A timeout only re-checks cancellation, unless claims are stuck
                if index <= wait_index && !retry_pending {
                    continue;
                }
                vol
            }
            Wake::Query(Err(e)) => {
                warn!(error = %e, "Failed to query volume");
                tokio::select! {
                    _ = cancel.cancelled() => return "cancelled",
                    _ = tokio::time::sleep(ctx.config.retry.initial_backoff) => {}
                }
                continue;
            }
        };

        let Some(vol) = vol else {
            info!("Volume deregistered, removing watcher");
            watch.deregistered(generation);
            return "deregistered";
        };

        // Never act on claims older than our own last checkpoint
        if vol.modify_index < written {
            continue;
        }

        if !vol.has_claims() {
            if watch.finish_if_idle(generation, rx) {
                return "idle";
            }
            continue;
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return "cancelled",
            result = reap(inner, &vol, cancel, &mut written) => result,
        };
        processed = vol.modify_index;
        inner.last_index.store(processed, Ordering::Release);

        match result {
            Ok(()) => retry_pending = false,
            Err(WatcherError::Cancelled) => return "cancelled",
            Err(e) => {
                retry_pending = true;
                warn!(error = %e, "Volume claims left pending, retrying on next wake");
            }
        }
    }
}

/// Claims ready for the unpublish workflow, keyed by allocation ID.
///
/// Claims already in progress keep their recorded state. Claims of terminal
/// allocations start from `Taken`. An allocation that has left the store
/// entirely is detached if its claim record survives, and otherwise only
/// needs its entry freed.
fn collect_past_claims(vol: &CsiVolume) -> BTreeMap<String, VolumeClaim> {
    let mut past = vol.past_claims.clone();

    let sides = [
        (&vol.read_allocs, &vol.read_claims),
        (&vol.write_allocs, &vol.write_claims),
    ];
    for (allocs, claims) in sides {
        for (alloc_id, alloc) in allocs {
            if past.contains_key(alloc_id) {
                continue;
            }
            let claim = match (alloc, claims.get(alloc_id)) {
                (Some(alloc), _) if !alloc.terminated() => continue,
                (Some(alloc), record) => VolumeClaim {
                    node_id: alloc.node_id.clone(),
                    state: ClaimState::Taken,
                    ..record.cloned().unwrap_or_else(|| release_claim(alloc_id))
                },
                (None, Some(record)) => VolumeClaim {
                    state: ClaimState::Taken,
                    ..record.clone()
                },
                (None, None) => VolumeClaim {
                    state: ClaimState::ReadyToFree,
                    ..release_claim(alloc_id)
                },
            };
            past.insert(alloc_id.clone(), claim);
        }
    }
    past
}

fn release_claim(alloc_id: &str) -> VolumeClaim {
    VolumeClaim {
        allocation_id: alloc_id.to_string(),
        node_id: String::new(),
        mode: ClaimMode::Release,
        state: ClaimState::Taken,
    }
}

/// Active claims per node, used to decide whether the controller
/// attachment is still needed.
fn count_node_claims(vol: &CsiVolume) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for claim in vol.read_claims.values().chain(vol.write_claims.values()) {
        *counts.entry(claim.node_id.clone()).or_default() += 1;
    }
    counts
}

async fn reap(
    inner: &Inner,
    vol: &CsiVolume,
    cancel: &CancellationToken,
    written: &mut u64,
) -> Result<()> {
    let past = collect_past_claims(vol);
    if past.is_empty() {
        return Ok(());
    }
    debug!(claims = past.len(), index = vol.modify_index, "Releasing volume claims");

    let mut node_claims = count_node_claims(vol);
    let mut failures = Vec::new();
    for (alloc_id, claim) in past {
        match unpublish(inner, vol, claim, &mut node_claims, cancel, written).await {
            Ok(()) => {}
            Err(WatcherError::Cancelled) => return Err(WatcherError::Cancelled),
            Err(e) => failures.push(format!("{}: {}", alloc_id, e)),
        }
    }

    if failures.is_empty() {
        return Ok(());
    }
    Err(WatcherError::ClaimsPending {
        volume: inner.key.to_string(),
        count: failures.len(),
        summary: failures.join("; "),
    })
}

/// Drive one claim to release, resuming from its recorded state.
#[instrument(skip_all, fields(alloc_id = %claim.allocation_id, node_id = %claim.node_id))]
async fn unpublish(
    inner: &Inner,
    vol: &CsiVolume,
    mut claim: VolumeClaim,
    node_claims: &mut HashMap<String, usize>,
    cancel: &CancellationToken,
    written: &mut u64,
) -> Result<()> {
    loop {
        match claim.state {
            ClaimState::Taken => {
                node_detach(inner, vol, &claim, cancel).await?;
                claim.state = ClaimState::NodeDetached;
                checkpoint(inner, vol, &claim, cancel, written).await?;
            }
            ClaimState::NodeDetached => {
                let remaining = node_claims.entry(claim.node_id.clone()).or_default();
                *remaining = remaining.saturating_sub(1);
                if !vol.controller_required {
                    debug!("Plugin has no controller, skipping controller detach");
                } else if *remaining > 0 {
                    debug!(remaining = *remaining, "Node still holds claims, skipping controller detach");
                } else {
                    controller_detach(inner, vol, &claim, cancel).await?;
                }
                claim.state = ClaimState::ControllerDetached;
            }
            ClaimState::ControllerDetached => {
                claim.state = ClaimState::ReadyToFree;
            }
            ClaimState::ReadyToFree => {
                checkpoint(inner, vol, &claim, cancel, written).await?;
                info!("Released volume claim");
                return Ok(());
            }
        }
    }
}

fn finish_timer<T>(timer: OperationTimer, result: &Result<T>) {
    match result {
        Ok(_) => timer.success(),
        Err(WatcherError::Cancelled) => timer.failure("cancelled"),
        Err(e) if e.is_retryable() => timer.failure("transient"),
        Err(_) => timer.failure("error"),
    }
}

async fn node_detach(
    inner: &Inner,
    vol: &CsiVolume,
    claim: &VolumeClaim,
    cancel: &CancellationToken,
) -> Result<()> {
    let req = NodeDetachRequest {
        plugin_id: vol.plugin_id.clone(),
        volume_id: vol.id.clone(),
        external_id: vol.remote_id().to_string(),
        alloc_id: claim.allocation_id.clone(),
        node_id: claim.node_id.clone(),
        attachment_mode: vol.attachment_mode,
        access_mode: vol.access_mode,
        read_only: claim.mode == ClaimMode::Read
            || matches!(
                vol.access_mode,
                AccessMode::SingleNodeReaderOnly | AccessMode::MultiNodeReaderOnly
            ),
    };

    let timer = OperationTimer::new("node_detach");
    let rpc = &inner.ctx.rpc;
    let result = with_retry(&inner.ctx.config.retry, "node_detach", cancel, || {
        let rpc = rpc.clone();
        let req = req.clone();
        async move { rpc.node_detach_volume(req).await.map_err(WatcherError::from) }
    })
    .await;
    finish_timer(timer, &result);
    result
}

async fn controller_detach(
    inner: &Inner,
    vol: &CsiVolume,
    claim: &VolumeClaim,
    cancel: &CancellationToken,
) -> Result<()> {
    let state = &inner.ctx.state;

    // Controllers address nodes by the ID the node plugin reported, not the
    // cluster's node ID
    let node = state
        .node_by_id(&claim.node_id)?
        .ok_or_else(|| WatcherError::UnknownNode(claim.node_id.clone()))?;
    let csi_node_id = node
        .csi_node_plugins
        .get(&vol.plugin_id)
        .and_then(|info| info.node_info.as_ref())
        .map(|info| info.id.clone())
        .ok_or_else(|| WatcherError::MissingNodeInfo {
            node_id: node.id.clone(),
            plugin_id: vol.plugin_id.clone(),
        })?;
    if state.csi_plugin_by_id(&vol.plugin_id)?.is_none() {
        return Err(WatcherError::MissingPlugin(vol.plugin_id.clone()));
    }

    let req = ControllerDetachRequest {
        plugin_id: vol.plugin_id.clone(),
        volume_id: vol.remote_id().to_string(),
        client_csi_node_id: csi_node_id,
        secrets: vol.secrets.clone(),
    };

    let timer = OperationTimer::new("controller_detach");
    let rpc = &inner.ctx.rpc;
    let result = with_retry(&inner.ctx.config.retry, "controller_detach", cancel, || {
        let rpc = rpc.clone();
        let req = req.clone();
        async move {
            rpc.controller_detach_volume(req)
                .await
                .map_err(WatcherError::from)
        }
    })
    .await;
    finish_timer(timer, &result);
    result
}

/// Record the claim's progress through the shared batcher.
async fn checkpoint(
    inner: &Inner,
    vol: &CsiVolume,
    claim: &VolumeClaim,
    cancel: &CancellationToken,
    written: &mut u64,
) -> Result<()> {
    let req = ClaimRequest {
        volume_id: vol.id.clone(),
        namespace: vol.namespace.clone(),
        allocation_id: Some(claim.allocation_id.clone()),
        node_id: Some(claim.node_id.clone()),
        mode: ClaimMode::Release,
        state: claim.state,
    };

    let timer = OperationTimer::new("checkpoint");
    let batcher = &inner.ctx.batcher;
    let result = with_retry(&inner.ctx.config.retry, "checkpoint", cancel, || {
        let batcher = batcher.clone();
        let req = req.clone();
        async move { batcher.create_update(vec![req]).await }
    })
    .await;
    finish_timer(timer, &result);

    let index = result?;
    let own = own_index(inner, index);
    debug!(state = %claim.state, index, own, "Checkpointed volume claim");
    *written = (*written).max(own);
    Ok(())
}

/// This volume's index after a write that returned `index`.
///
/// A batch may span several volumes and the write path may commit claims
/// one at a time, so the returned index can be ahead of the volume's own.
/// Progress is tracked against the volume's index, never past it.
fn own_index(inner: &Inner, index: u64) -> u64 {
    let key = &inner.key;
    match inner.ctx.state.csi_volume_by_id(&key.namespace, &key.id) {
        Ok(Some(vol)) => vol.modify_index.min(index),
        Ok(None) => index,
        Err(e) => {
            warn!(error = %e, "Failed to read volume index after checkpoint");
            index
        }
    }
}
