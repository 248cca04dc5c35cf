//! Capability-set abstraction over the local media stack
//!
//! A [`MediaEngine`] turns server-issued transport parameters into local
//! send/receive transports. Transports talk back to the session through a
//! [`TransportListener`]: once to hand over their DTLS parameters, and once per
//! produce call to obtain a server-side producer id.

use async_trait::async_trait;
use huddle_protocol::{
    CodecOptions, ConsumeParams, ConsumerId, DtlsParameters, MediaKind, ProducerId,
    RtpCapabilities, RtpEncoding, RtpParameters, TransportParams,
};
use serde_json::Value;
use std::sync::Arc;

use crate::capture::LocalTrack;
use crate::error::Result;
use crate::stream::MediaStream;

/// Produce event raised by a send transport
#[derive(Debug, Clone, PartialEq)]
pub struct ProduceRequest {
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub app_data: Value,
}

/// What to publish on a send transport
#[derive(Debug, Clone)]
pub struct ProduceOptions {
    pub track: LocalTrack,
    pub encodings: Vec<RtpEncoding>,
    pub codec_options: CodecOptions,
    pub app_data: Value,
}

/// Server-negotiated consumer description
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumeOptions {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

impl From<ConsumeParams> for ConsumeOptions {
    fn from(params: ConsumeParams) -> Self {
        Self {
            id: params.id,
            producer_id: params.producer_id,
            kind: params.kind,
            rtp_parameters: params.rtp_parameters,
        }
    }
}

/// Callbacks from a local transport into the signaling side
#[async_trait]
pub trait TransportListener: Send + Sync {
    /// The transport needs its DTLS parameters delivered to the server.
    /// An error fails the local connect.
    async fn on_connect(&self, dtls_parameters: DtlsParameters) -> Result<()>;

    /// A producer needs a server-side id
    async fn on_produce(&self, request: ProduceRequest) -> Result<ProducerId>;
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Load the router's capabilities. Required before creating transports.
    async fn load(&self, router_capabilities: &RtpCapabilities) -> Result<()>;

    /// Capabilities the local device can receive, sent with every consume request
    fn rtp_capabilities(&self) -> Result<RtpCapabilities>;

    async fn create_send_transport(
        &self,
        params: TransportParams,
        listener: Arc<dyn TransportListener>,
    ) -> Result<Arc<dyn SendTransport>>;

    async fn create_recv_transport(
        &self,
        params: TransportParams,
        listener: Arc<dyn TransportListener>,
    ) -> Result<Arc<dyn RecvTransport>>;
}

#[async_trait]
pub trait SendTransport: Send + Sync {
    fn id(&self) -> &str;

    /// Run the local DTLS setup. The listener's `on_connect` fires at most once
    /// per transport; later calls return without signaling again.
    async fn connect(&self) -> Result<()>;

    /// Publish a local track. Connects first if needed.
    async fn produce(&self, options: ProduceOptions) -> Result<Arc<dyn Producer>>;

    async fn close(&self);
}

#[async_trait]
pub trait RecvTransport: Send + Sync {
    fn id(&self) -> &str;

    /// Same contract as [`SendTransport::connect`]
    async fn connect(&self) -> Result<()>;

    /// Bind a server-side consumer to this transport. Connects first if needed.
    async fn consume(&self, options: ConsumeOptions) -> Result<Arc<dyn Consumer>>;

    async fn close(&self);
}

#[async_trait]
pub trait Producer: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    async fn close(&self);
}

#[async_trait]
pub trait Consumer: Send + Sync {
    fn id(&self) -> &str;
    fn producer_id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    fn stream(&self) -> MediaStream;
    async fn close(&self);
}
