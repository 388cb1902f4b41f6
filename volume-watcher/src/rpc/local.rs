//! Claim RPCs for a watcher that owns its state store.

use std::sync::Arc;

use csi_state::{ClaimBatchRequest, StateStore};
use tracing::debug;

use super::{ClaimRpc, ControllerDetachRequest, NodeDetachRequest, RpcError};

/// Applies claim updates straight to the local store and forwards detach
/// calls to `detach`.
///
/// Watchers blocking on the same store see every checkpoint they write.
pub struct LocalClaimRpc {
    store: Arc<StateStore>,
    detach: Arc<dyn ClaimRpc>,
}

impl LocalClaimRpc {
    pub fn new(store: Arc<StateStore>, detach: Arc<dyn ClaimRpc>) -> Self {
        Self { store, detach }
    }
}

#[tonic::async_trait]
impl ClaimRpc for LocalClaimRpc {
    async fn node_detach_volume(&self, req: NodeDetachRequest) -> Result<(), RpcError> {
        self.detach.node_detach_volume(req).await
    }

    async fn controller_detach_volume(&self, req: ControllerDetachRequest) -> Result<(), RpcError> {
        self.detach.controller_detach_volume(req).await
    }

    async fn upsert_volume_claims(&self, req: ClaimBatchRequest) -> Result<u64, RpcError> {
        let index = self
            .store
            .csi_volume_claims(0, &req.claims)
            .map_err(|e| RpcError::Permanent(e.to_string()))?;
        debug!(claims = req.claims.len(), index, "Applied claim batch to local store");
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use csi_state::{ClaimMode, ClaimRequest, ClaimState, mock};

    struct Unreachable;

    #[tonic::async_trait]
    impl ClaimRpc for Unreachable {
        async fn node_detach_volume(&self, _: NodeDetachRequest) -> Result<(), RpcError> {
            Err(RpcError::Transient("unreachable".to_string()))
        }

        async fn controller_detach_volume(
            &self,
            _: ControllerDetachRequest,
        ) -> Result<(), RpcError> {
            Err(RpcError::Transient("unreachable".to_string()))
        }

        async fn upsert_volume_claims(&self, _: ClaimBatchRequest) -> Result<u64, RpcError> {
            Err(RpcError::Transient("unreachable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_claims_land_in_local_store() {
        let store = Arc::new(StateStore::new());
        let alloc = mock::alloc();
        let mut vol = mock::csi_volume(&mock::csi_plugin());
        vol.read_allocs.insert(alloc.id.clone(), None);
        store.csi_volume_register(7, vec![vol.clone()]).unwrap();

        let rpc = LocalClaimRpc::new(store.clone(), Arc::new(Unreachable));
        let req = ClaimRequest {
            allocation_id: Some(alloc.id.clone()),
            mode: ClaimMode::Release,
            state: ClaimState::ReadyToFree,
            ..ClaimRequest::for_volume(&vol.namespace, &vol.id)
        };
        let index = rpc
            .upsert_volume_claims(ClaimBatchRequest { claims: vec![req] })
            .await
            .unwrap();

        assert_eq!(index, 8);
        let got = store.csi_volume_by_id(&vol.namespace, &vol.id).unwrap();
        assert!(!got.has_claims());
        assert_eq!(got.modify_index, index);
    }

    #[tokio::test]
    async fn test_store_errors_are_permanent() {
        let store = Arc::new(StateStore::new());
        let rpc = LocalClaimRpc::new(store, Arc::new(Unreachable));
        let req = ClaimRequest::for_volume("default", "missing");
        let err = rpc
            .upsert_volume_claims(ClaimBatchRequest { claims: vec![req] })
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }
}
