//! Room client for a selective forwarding media relay
//!
//! A [`RoomSession`] joins a room over a [`SignalingChannel`], publishes the
//! local track and keeps one consumer per remote producer in sync with the
//! server's `new-producer` / `producer-closed` events.
//!
//! [`SignalingChannel`]: signaling::SignalingChannel

pub mod config;
pub mod coordinator;
pub mod error;
pub mod registry;
pub mod render;
pub mod router;
pub mod session;
pub mod signaling;

pub use config::ClientConfig;
pub use coordinator::{HandshakeOutcome, ProduceOutcome, TransportCoordinator};
pub use error::{Result, SessionError, SignalingError};
pub use registry::{ConsumerRecord, ConsumerRegistry, ConsumerSummary};
pub use render::{StreamBoard, StreamSink};
pub use router::ParticipantEventRouter;
pub use session::{RoomSession, SessionSettings};
pub use signaling::{Signaling, SignalingChannel, WebSocketSignaling};
