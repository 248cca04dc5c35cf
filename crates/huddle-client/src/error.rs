use huddle_media::MediaError;
use huddle_protocol::ProducerId;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SignalingError {
    #[error("Signaling channel closed")]
    Closed,

    #[error("No response within {0:?}")]
    Timeout(Duration),

    #[error("Failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

#[derive(Error, Debug)]
pub enum SessionError {
    /// The server answered with an error field
    #[error("{request} rejected by server: {reason}")]
    Negotiation { request: &'static str, reason: String },

    /// The response did not have the expected shape, or a transport moved
    /// through an illegal state transition
    #[error("Protocol violation in {request}: {reason}")]
    ProtocolViolation { request: &'static str, reason: String },

    #[error("Event for untracked producer {0}")]
    StaleEvent(ProducerId),

    #[error("No usable router capabilities: {0}")]
    Capability(String),

    #[error("Media engine failed to load router capabilities: {0}")]
    EngineInit(MediaError),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Signaling channel is not connected")]
    NotConnected,

    #[error("Session already joined a room")]
    AlreadyJoined,

    #[error("Session is already producing")]
    AlreadyProducing,
}

pub type Result<T> = std::result::Result<T, SessionError>;
