//! Bindings for `proto/volume_claims.proto`.
//!
//! Written in the shape `tonic-prost-build` emits, so the crate builds
//! without `protoc`. Keep field tags in sync with the .proto file.

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct NodeDetachVolumeRequest {
    #[prost(string, tag = "1")]
    pub plugin_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub volume_id: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub external_id: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub alloc_id: ::prost::alloc::string::String,
    #[prost(string, tag = "5")]
    pub node_id: ::prost::alloc::string::String,
    #[prost(string, tag = "6")]
    pub attachment_mode: ::prost::alloc::string::String,
    #[prost(string, tag = "7")]
    pub access_mode: ::prost::alloc::string::String,
    #[prost(bool, tag = "8")]
    pub read_only: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct NodeDetachVolumeResponse {}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct ControllerDetachVolumeRequest {
    #[prost(string, tag = "1")]
    pub plugin_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub volume_id: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub client_csi_node_id: ::prost::alloc::string::String,
    #[prost(map = "string, string", tag = "4")]
    pub secrets: ::std::collections::HashMap<
        ::prost::alloc::string::String,
        ::prost::alloc::string::String,
    >,
}

#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct ControllerDetachVolumeResponse {}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct VolumeClaim {
    #[prost(string, tag = "1")]
    pub volume_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub namespace: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub allocation_id: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub node_id: ::prost::alloc::string::String,
    #[prost(enumeration = "ClaimMode", tag = "5")]
    pub mode: i32,
    #[prost(enumeration = "ClaimState", tag = "6")]
    pub state: i32,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct UpsertVolumeClaimsRequest {
    #[prost(message, repeated, tag = "1")]
    pub claims: ::prost::alloc::vec::Vec<VolumeClaim>,
}

#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct UpsertVolumeClaimsResponse {
    #[prost(uint64, tag = "1")]
    pub index: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ClaimMode {
    Read = 0,
    Write = 1,
    Gc = 2,
    Release = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ClaimState {
    Taken = 0,
    NodeDetached = 1,
    ControllerDetached = 2,
    ReadyToFree = 3,
}

/// Generated client implementations.
pub mod volume_claims_client {
    #![allow(
        unused_variables,
        dead_code,
        missing_docs,
        clippy::wildcard_imports,
        clippy::let_unit_value
    )]
    use tonic::codegen::http::Uri;
    use tonic::codegen::*;

    #[derive(Debug, Clone)]
    pub struct VolumeClaimsClient<T> {
        inner: tonic::client::Grpc<T>,
    }

    impl VolumeClaimsClient<tonic::transport::Channel> {
        /// Attempt to create a new client by connecting to a given endpoint.
        pub async fn connect<D>(dst: D) -> Result<Self, tonic::transport::Error>
        where
            D: TryInto<tonic::transport::Endpoint>,
            D::Error: Into<StdError>,
        {
            let conn = tonic::transport::Endpoint::new(dst)?.connect().await?;
            Ok(Self::new(conn))
        }
    }

    impl<T> VolumeClaimsClient<T>
    where
        T: tonic::client::GrpcService<tonic::body::Body>,
        T::Error: Into<StdError>,
        T::ResponseBody: Body<Data = Bytes> + std::marker::Send + 'static,
        <T::ResponseBody as Body>::Error: Into<StdError> + std::marker::Send,
    {
        pub fn new(inner: T) -> Self {
            let inner = tonic::client::Grpc::new(inner);
            Self { inner }
        }

        pub fn with_origin(inner: T, origin: Uri) -> Self {
            let inner = tonic::client::Grpc::with_origin(inner, origin);
            Self { inner }
        }

        async fn ready(&mut self) -> std::result::Result<(), tonic::Status> {
            self.inner
                .ready()
                .await
                .map_err(|e| tonic::Status::unknown(format!("Service was not ready: {}", e.into())))
        }

        pub async fn node_detach_volume(
            &mut self,
            request: impl tonic::IntoRequest<super::NodeDetachVolumeRequest>,
        ) -> std::result::Result<tonic::Response<super::NodeDetachVolumeResponse>, tonic::Status>
        {
            self.ready().await?;
            let codec = tonic_prost::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static(
                "/volume_watcher.v1.VolumeClaims/NodeDetachVolume",
            );
            let mut req = request.into_request();
            req.extensions_mut().insert(GrpcMethod::new(
                "volume_watcher.v1.VolumeClaims",
                "NodeDetachVolume",
            ));
            self.inner.unary(req, path, codec).await
        }

        pub async fn controller_detach_volume(
            &mut self,
            request: impl tonic::IntoRequest<super::ControllerDetachVolumeRequest>,
        ) -> std::result::Result<
            tonic::Response<super::ControllerDetachVolumeResponse>,
            tonic::Status,
        > {
            self.ready().await?;
            let codec = tonic_prost::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static(
                "/volume_watcher.v1.VolumeClaims/ControllerDetachVolume",
            );
            let mut req = request.into_request();
            req.extensions_mut().insert(GrpcMethod::new(
                "volume_watcher.v1.VolumeClaims",
                "ControllerDetachVolume",
            ));
            self.inner.unary(req, path, codec).await
        }

        pub async fn upsert_volume_claims(
            &mut self,
            request: impl tonic::IntoRequest<super::UpsertVolumeClaimsRequest>,
        ) -> std::result::Result<tonic::Response<super::UpsertVolumeClaimsResponse>, tonic::Status>
        {
            self.ready().await?;
            let codec = tonic_prost::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static(
                "/volume_watcher.v1.VolumeClaims/UpsertVolumeClaims",
            );
            let mut req = request.into_request();
            req.extensions_mut().insert(GrpcMethod::new(
                "volume_watcher.v1.VolumeClaims",
                "UpsertVolumeClaims",
            ));
            self.inner.unary(req, path, codec).await
        }
    }
}
