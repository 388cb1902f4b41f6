//! Cross-volume claim update batcher.
//!
//! Watchers checkpoint claim progress through `create_update`. Updates that
//! arrive within one window, for any number of volumes, are applied with a
//! single `upsert_volume_claims` call. The window opens on the first arrival
//! and is never extended, so no update waits longer than one window before
//! it is dispatched.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use csi_state::{ClaimBatchRequest, ClaimRequest, VolumeKey};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, WatcherError};
use crate::metrics;
use crate::rpc::ClaimRpc;

struct PendingUpdate {
    claims: Vec<ClaimRequest>,
    reply: oneshot::Sender<Result<u64>>,
}

/// Claims accumulated during one window.
#[derive(Default)]
struct Batch {
    claims: Vec<ClaimRequest>,
    positions: HashMap<(VolumeKey, String), usize>,
    waiters: Vec<oneshot::Sender<Result<u64>>>,
}

impl Batch {
    fn add(&mut self, update: PendingUpdate) {
        for claim in update.claims {
            let slot = (claim.key(), claim.allocation_id.clone().unwrap_or_default());
            match self.positions.get(&slot) {
                Some(&pos) => self.claims[pos] = claim,
                None => {
                    self.positions.insert(slot, self.claims.len());
                    self.claims.push(claim);
                }
            }
        }
        self.waiters.push(update.reply);
    }

    fn volumes(&self) -> usize {
        let mut keys: Vec<_> = self.positions.keys().map(|(key, _)| key).collect();
        keys.sort();
        keys.dedup();
        keys.len()
    }

    async fn dispatch(self, rpc: &dyn ClaimRpc) {
        metrics::record_batch(self.claims.len());
        debug!(
            claims = self.claims.len(),
            volumes = self.volumes(),
            callers = self.waiters.len(),
            "Dispatching claim update batch"
        );

        let result = rpc
            .upsert_volume_claims(ClaimBatchRequest {
                claims: self.claims,
            })
            .await
            .map_err(WatcherError::from);
        if let Err(e) = &result {
            warn!(error = %e, "Claim update batch failed");
        }

        for waiter in self.waiters {
            // The caller may have given up waiting
            let _ = waiter.send(result.clone());
        }
    }
}

/// Handle to a running batcher task. Clones share the same task.
#[derive(Clone)]
pub struct VolumeUpdateBatcher {
    tx: mpsc::UnboundedSender<PendingUpdate>,
    cancel: CancellationToken,
    handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl VolumeUpdateBatcher {
    /// Spawn the batching task. It exits when `cancel` fires.
    pub fn new(window: Duration, rpc: Arc<dyn ClaimRpc>, cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(window, rpc, rx, cancel.clone()));
        Self {
            tx,
            cancel,
            handle: Arc::new(Mutex::new(Some(handle))),
        }
    }

    /// Queue claim updates and wait for the write that applied them.
    ///
    /// Returns the index of that write, shared by every caller in the batch.
    pub async fn create_update(&self, claims: Vec<ClaimRequest>) -> Result<u64> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PendingUpdate { claims, reply })
            .map_err(|_| WatcherError::BatcherClosed)?;
        rx.await.map_err(|_| WatcherError::BatcherClosed)?
    }

    /// Stop the task and wait for it to exit. Updates still queued fail
    /// with `BatcherClosed`.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!(error = %e, "Claim update batcher task failed");
        }
    }
}

async fn run(
    window: Duration,
    rpc: Arc<dyn ClaimRpc>,
    mut rx: mpsc::UnboundedReceiver<PendingUpdate>,
    cancel: CancellationToken,
) {
    loop {
        let first = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            update = rx.recv() => match update {
                Some(update) => update,
                None => break,
            },
        };

        let mut batch = Batch::default();
        batch.add(first);

        let timer = tokio::time::sleep(window);
        tokio::pin!(timer);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = &mut timer => break,
                update = rx.recv() => match update {
                    Some(update) => batch.add(update),
                    None => break,
                },
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = batch.dispatch(rpc.as_ref()) => {}
        }
    }
    debug!("Claim update batcher stopped");
}
