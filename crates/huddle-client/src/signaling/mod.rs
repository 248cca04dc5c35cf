//! Signaling channel to the relay server
//!
//! [`SignalingChannel`] is the raw request/notify transport; [`Signaling`]
//! wraps it with one typed method per request the session makes.

mod websocket;

pub use websocket::WebSocketSignaling;

use async_trait::async_trait;
use huddle_protocol::{
    ClientRequest, ConsumeParams, ConsumeResponse, DtlsParameters, JoinRoomResponse, MediaKind,
    ProduceResponse, ProducerId, RtpCapabilities, RtpParameters, TransportId, TransportParams,
    TransportResponse,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;

use crate::error::{Result, SessionError, SignalingError};

#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Send a request and wait for its single acknowledgement
    async fn request(&self, request: ClientRequest) -> std::result::Result<Value, SignalingError>;

    /// Send without expecting a reply
    async fn notify(&self, request: ClientRequest) -> std::result::Result<(), SignalingError>;

    fn is_connected(&self) -> bool;
}

#[derive(Clone)]
pub struct Signaling {
    channel: Arc<dyn SignalingChannel>,
}

impl Signaling {
    pub fn new(channel: Arc<dyn SignalingChannel>) -> Self {
        Self { channel }
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    async fn call<T: DeserializeOwned>(&self, request: ClientRequest) -> Result<T> {
        let method = request.method();
        tracing::debug!("-> {}", method);
        let value = self.channel.request(request).await?;
        serde_json::from_value(value).map_err(|e| SessionError::ProtocolViolation {
            request: method,
            reason: e.to_string(),
        })
    }

    pub async fn join_room(&self, room_name: &str) -> Result<RtpCapabilities> {
        let response: JoinRoomResponse = self
            .call(ClientRequest::JoinRoom {
                room_name: room_name.to_string(),
            })
            .await?;

        match response.rtp_capabilities {
            Some(capabilities) if capabilities.is_usable() => Ok(capabilities),
            Some(_) => Err(SessionError::Capability(
                "router capabilities list no codecs".to_string(),
            )),
            None => Err(SessionError::Capability(
                "joinRoom acknowledgement carried no capabilities".to_string(),
            )),
        }
    }

    pub async fn create_transport(&self, consumer: bool) -> Result<TransportParams> {
        let response: TransportResponse = self
            .call(ClientRequest::CreateWebRtcTransport { consumer })
            .await?;
        response
            .params
            .into_result()
            .map_err(|reason| SessionError::Negotiation {
                request: "createWebRtcTransport",
                reason,
            })
    }

    pub async fn connect_send_transport(&self, dtls_parameters: DtlsParameters) -> Result<()> {
        self.channel
            .request(ClientRequest::TransportConnect { dtls_parameters })
            .await?;
        Ok(())
    }

    pub async fn connect_recv_transport(
        &self,
        dtls_parameters: DtlsParameters,
        server_consumer_transport_id: TransportId,
    ) -> Result<()> {
        self.channel
            .request(ClientRequest::TransportReceiveConnect {
                dtls_parameters,
                server_consumer_transport_id,
            })
            .await?;
        Ok(())
    }

    pub async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        app_data: Value,
    ) -> Result<ProduceResponse> {
        self.call(ClientRequest::TransportProduce {
            kind,
            rtp_parameters,
            app_data,
        })
        .await
    }

    pub async fn consume(
        &self,
        rtp_capabilities: RtpCapabilities,
        remote_producer_id: ProducerId,
        server_consumer_transport_id: TransportId,
    ) -> Result<ConsumeParams> {
        let response: ConsumeResponse = self
            .call(ClientRequest::Consume {
                rtp_capabilities,
                remote_producer_id,
                server_consumer_transport_id,
            })
            .await?;
        response
            .params
            .into_result()
            .map_err(|reason| SessionError::Negotiation {
                request: "consume",
                reason,
            })
    }

    /// Fire-and-forget: the server starts forwarding media after this
    pub async fn resume_consumer(&self, server_consumer_id: String) -> Result<()> {
        self.channel
            .notify(ClientRequest::ConsumerResume { server_consumer_id })
            .await?;
        Ok(())
    }

    pub async fn get_producers(&self) -> Result<Vec<ProducerId>> {
        self.call(ClientRequest::GetProducers).await
    }
}
