//! gRPC implementation of `ClaimRpc`.

use std::path::PathBuf;
use std::time::Duration;

use csi_state::{ClaimBatchRequest, ClaimMode, ClaimRequest, ClaimState};
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tracing::debug;

use super::proto::{self, volume_claims_client::VolumeClaimsClient};
use super::{ClaimRpc, ControllerDetachRequest, NodeDetachRequest, RpcError};

/// TLS configuration for connecting to the claims endpoint
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ca_path: PathBuf,
    pub domain: String,
}

/// Claim RPCs over a shared tonic channel.
///
/// The channel multiplexes requests, so each call clones the client rather
/// than serializing on a lock.
#[derive(Debug, Clone)]
pub struct GrpcClaimRpc {
    client: VolumeClaimsClient<Channel>,
}

impl GrpcClaimRpc {
    /// Connect with optional mTLS and robust connection settings.
    ///
    /// Connection settings:
    /// - 10 second connect timeout (fail fast if the server is unreachable)
    /// - 30 second request timeout
    /// - TCP keepalive every 60 seconds
    /// - HTTP/2 keepalive every 30 seconds with 10 second timeout
    pub async fn connect_with_tls(
        endpoint: &str,
        tls: Option<TlsConfig>,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let mut endpoint_builder = Endpoint::from_shared(endpoint.to_string())?
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .tcp_nodelay(true)
            .http2_keep_alive_interval(Duration::from_secs(30))
            .keep_alive_timeout(Duration::from_secs(10))
            .keep_alive_while_idle(true);

        if let Some(tls) = tls {
            let cert = tokio::fs::read(&tls.cert_path).await?;
            let key = tokio::fs::read(&tls.key_path).await?;
            let ca = tokio::fs::read(&tls.ca_path).await?;

            let tls_config = ClientTlsConfig::new()
                .identity(Identity::from_pem(cert, key))
                .ca_certificate(Certificate::from_pem(ca))
                .domain_name(&tls.domain);

            endpoint_builder = endpoint_builder.tls_config(tls_config)?;
        }

        // Connect lazily: the leader may come up before the claims endpoint
        let channel = endpoint_builder.connect_lazy();
        Ok(Self {
            client: VolumeClaimsClient::new(channel),
        })
    }
}

fn claim_mode_to_proto(mode: ClaimMode) -> proto::ClaimMode {
    match mode {
        ClaimMode::Read => proto::ClaimMode::Read,
        ClaimMode::Write => proto::ClaimMode::Write,
        ClaimMode::Gc => proto::ClaimMode::Gc,
        ClaimMode::Release => proto::ClaimMode::Release,
    }
}

fn claim_state_to_proto(state: ClaimState) -> proto::ClaimState {
    match state {
        ClaimState::Taken => proto::ClaimState::Taken,
        ClaimState::NodeDetached => proto::ClaimState::NodeDetached,
        ClaimState::ControllerDetached => proto::ClaimState::ControllerDetached,
        ClaimState::ReadyToFree => proto::ClaimState::ReadyToFree,
    }
}

fn claim_to_proto(claim: ClaimRequest) -> proto::VolumeClaim {
    proto::VolumeClaim {
        volume_id: claim.volume_id,
        namespace: claim.namespace,
        allocation_id: claim.allocation_id.unwrap_or_default(),
        node_id: claim.node_id.unwrap_or_default(),
        mode: claim_mode_to_proto(claim.mode) as i32,
        state: claim_state_to_proto(claim.state) as i32,
    }
}

#[tonic::async_trait]
impl ClaimRpc for GrpcClaimRpc {
    async fn node_detach_volume(&self, req: NodeDetachRequest) -> Result<(), RpcError> {
        debug!(volume_id = %req.volume_id, alloc_id = %req.alloc_id, node_id = %req.node_id, "Sending node detach");
        let request = proto::NodeDetachVolumeRequest {
            plugin_id: req.plugin_id,
            volume_id: req.volume_id,
            external_id: req.external_id,
            alloc_id: req.alloc_id,
            node_id: req.node_id,
            attachment_mode: req.attachment_mode.to_string(),
            access_mode: req.access_mode.to_string(),
            read_only: req.read_only,
        };
        let mut client = self.client.clone();
        client.node_detach_volume(request).await?;
        Ok(())
    }

    async fn controller_detach_volume(
        &self,
        req: ControllerDetachRequest,
    ) -> Result<(), RpcError> {
        debug!(volume_id = %req.volume_id, csi_node_id = %req.client_csi_node_id, "Sending controller detach");
        let request = proto::ControllerDetachVolumeRequest {
            plugin_id: req.plugin_id,
            volume_id: req.volume_id,
            client_csi_node_id: req.client_csi_node_id,
            secrets: req.secrets.into_iter().collect(),
        };
        let mut client = self.client.clone();
        client.controller_detach_volume(request).await?;
        Ok(())
    }

    async fn upsert_volume_claims(&self, req: ClaimBatchRequest) -> Result<u64, RpcError> {
        let request = proto::UpsertVolumeClaimsRequest {
            claims: req.claims.into_iter().map(claim_to_proto).collect(),
        };
        let mut client = self.client.clone();
        let response = client.upsert_volume_claims(request).await?;
        Ok(response.into_inner().index)
    }
}
