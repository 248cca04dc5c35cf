use thiserror::Error;

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Router capabilities have not been loaded")]
    NotLoaded,

    #[error("Router capabilities are already loaded")]
    AlreadyLoaded,

    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error("Capture unavailable: {0}")]
    Capture(String),

    #[error("Invalid session description: {0}")]
    Sdp(String),

    #[error("Transport connect rejected: {0}")]
    Connect(String),

    #[error("Produce rejected: {0}")]
    Produce(String),

    #[error("Transport closed")]
    Closed,

    #[error("WebRTC error: {0}")]
    Webrtc(#[from] webrtc::Error),
}

pub type Result<T> = std::result::Result<T, MediaError>;
