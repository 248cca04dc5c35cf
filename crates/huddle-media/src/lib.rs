//! Local media stack for the Huddle room client
//!
//! [`engine`] defines the capability-set traits the session drives;
//! [`webrtc_engine`] implements them on top of webrtc-rs.

pub mod capture;
pub mod engine;
pub mod error;
pub mod sdp;
pub mod stream;
pub mod webrtc_engine;

pub use capture::{LocalTrack, MediaCapture, MediaConstraints, SampleTrackCapture};
pub use engine::{
    ConsumeOptions, Consumer, MediaEngine, ProduceOptions, ProduceRequest, Producer,
    RecvTransport, SendTransport, TransportListener,
};
pub use error::{MediaError, Result};
pub use stream::{MediaStream, TrackPublisher};
pub use webrtc_engine::WebRtcEngine;
