use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{
    ConsumerId, DtlsParameters, MediaKind, ProducerId, RtpCapabilities, RtpParameters,
    TransportId, TransportParams,
};

/// Requests sent from client to server over the signaling channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "data")]
pub enum ClientRequest {
    /// Join a room and fetch its router capabilities
    #[serde(rename = "joinRoom", rename_all = "camelCase")]
    JoinRoom { room_name: String },

    /// Ask the server to allocate a transport
    #[serde(rename = "createWebRtcTransport")]
    CreateWebRtcTransport { consumer: bool },

    /// Connect the send transport
    #[serde(rename = "transport-connect", rename_all = "camelCase")]
    TransportConnect { dtls_parameters: DtlsParameters },

    /// Connect a receive transport
    #[serde(rename = "transport-receive-connect", rename_all = "camelCase")]
    TransportReceiveConnect {
        dtls_parameters: DtlsParameters,
        server_consumer_transport_id: TransportId,
    },

    /// Start producing on the send transport
    #[serde(rename = "transport-produce", rename_all = "camelCase")]
    TransportProduce {
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        app_data: Value,
    },

    /// Consume a remote producer through a receive transport
    #[serde(rename = "consume", rename_all = "camelCase")]
    Consume {
        rtp_capabilities: RtpCapabilities,
        remote_producer_id: ProducerId,
        server_consumer_transport_id: TransportId,
    },

    /// Resume a consumer that the server created paused
    #[serde(rename = "consumer-resume", rename_all = "camelCase")]
    ConsumerResume { server_consumer_id: ConsumerId },

    /// List the producers already present in the room
    #[serde(rename = "getProducers")]
    GetProducers,
}

impl ClientRequest {
    /// Wire name of the request
    pub fn method(&self) -> &'static str {
        match self {
            ClientRequest::JoinRoom { .. } => "joinRoom",
            ClientRequest::CreateWebRtcTransport { .. } => "createWebRtcTransport",
            ClientRequest::TransportConnect { .. } => "transport-connect",
            ClientRequest::TransportReceiveConnect { .. } => "transport-receive-connect",
            ClientRequest::TransportProduce { .. } => "transport-produce",
            ClientRequest::Consume { .. } => "consume",
            ClientRequest::ConsumerResume { .. } => "consumer-resume",
            ClientRequest::GetProducers => "getProducers",
        }
    }
}

/// Events pushed by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", content = "data")]
pub enum ServerEvent {
    /// Signaling connection accepted
    #[serde(rename = "connection_success", rename_all = "camelCase")]
    ConnectionSuccess { socket_id: String },

    /// A participant started producing
    #[serde(rename = "new-producer", rename_all = "camelCase")]
    NewProducer { remote_producer_id: ProducerId },

    /// A participant's producer went away
    #[serde(rename = "producer-closed", rename_all = "camelCase")]
    ProducerClosed { remote_producer_id: ProducerId },
}

/// Frame written by the client. Requests carry an id, notifications do not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub request: ClientRequest,
}

/// Frame written by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Acknowledgement of the request with the same id
    Response {
        id: u64,
        #[serde(default)]
        data: Value,
    },

    /// Server-pushed event
    Event { event: ServerEvent },
}

/// Acknowledgement of `joinRoom`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomResponse {
    #[serde(default, alias = "routerCapabilities")]
    pub rtp_capabilities: Option<RtpCapabilities>,
}

/// Envelope used by requests whose reply is `{params}` or `{params: {error}}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamsEnvelope<T> {
    pub params: Negotiated<T>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Negotiated<T> {
    Rejected { error: Value },
    Accepted(T),
}

impl<T> Negotiated<T> {
    /// Turn the reply into the accepted payload or the server's error text
    pub fn into_result(self) -> Result<T, String> {
        match self {
            Negotiated::Accepted(value) => Ok(value),
            Negotiated::Rejected { error } => Err(match error {
                Value::String(text) => text,
                other => other.to_string(),
            }),
        }
    }
}

/// Accepted reply to `createWebRtcTransport`
pub type TransportResponse = ParamsEnvelope<TransportParams>;

/// Accepted reply to `consume`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeParams {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

pub type ConsumeResponse = ParamsEnvelope<ConsumeParams>;

/// Acknowledgement of `transport-produce`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceResponse {
    pub id: ProducerId,
    #[serde(default)]
    pub producers_exist: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_join_room_wire_format() {
        let frame = ClientFrame {
            id: Some(7),
            request: ClientRequest::JoinRoom {
                room_name: "R1".to_string(),
            },
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({ "id": 7, "request": { "method": "joinRoom", "data": { "roomName": "R1" } } })
        );
    }

    #[test]
    fn test_resume_is_sent_without_id() {
        let frame = ClientFrame {
            id: None,
            request: ClientRequest::ConsumerResume {
                server_consumer_id: "c1".to_string(),
            },
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({ "request": { "method": "consumer-resume", "data": { "serverConsumerId": "c1" } } })
        );
    }

    #[test]
    fn test_get_producers_has_no_payload() {
        let value = serde_json::to_value(ClientRequest::GetProducers).unwrap();
        assert_eq!(value, json!({ "method": "getProducers" }));
        let parsed: ClientRequest = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.method(), "getProducers");
    }

    #[test]
    fn test_server_events_parse() {
        let frame: ServerFrame = serde_json::from_value(json!({
            "type": "event",
            "event": { "name": "producer-closed", "data": { "remoteProducerId": "p2" } }
        }))
        .unwrap();
        assert_eq!(
            frame,
            ServerFrame::Event {
                event: ServerEvent::ProducerClosed {
                    remote_producer_id: "p2".to_string()
                }
            }
        );

        let frame: ServerFrame = serde_json::from_value(json!({
            "type": "event",
            "event": { "name": "connection_success", "data": { "socketId": "abc" } }
        }))
        .unwrap();
        assert!(matches!(
            frame,
            ServerFrame::Event { event: ServerEvent::ConnectionSuccess { .. } }
        ));
    }

    #[test]
    fn test_negotiated_error_is_detected() {
        let reply: TransportResponse =
            serde_json::from_value(json!({ "params": { "error": "router closed" } })).unwrap();
        assert_eq!(reply.params.into_result().unwrap_err(), "router closed");
    }

    #[test]
    fn test_negotiated_params_are_accepted() {
        let reply: TransportResponse = serde_json::from_value(json!({
            "params": {
                "id": "t1",
                "iceParameters": { "usernameFragment": "u", "password": "p", "iceLite": true },
                "iceCandidates": [],
                "dtlsParameters": { "role": "auto", "fingerprints": [] }
            }
        }))
        .unwrap();
        let params = reply.params.into_result().unwrap();
        assert_eq!(params.id, "t1");
        assert!(params.ice_parameters.ice_lite);
    }

    #[test]
    fn test_join_response_accepts_router_capabilities_alias() {
        let reply: JoinRoomResponse = serde_json::from_value(json!({
            "routerCapabilities": {
                "codecs": [{ "kind": "video", "mimeType": "video/VP8", "clockRate": 90000 }]
            }
        }))
        .unwrap();
        assert!(reply.rtp_capabilities.unwrap().is_usable());
    }
}
