//! Shared signaling protocol for Huddle
//!
//! Request, response and event types exchanged between the room client and
//! the relay server, plus the RTP/ICE/DTLS parameter structs they carry.

pub mod messages;
pub mod types;

pub use messages::*;
pub use types::*;
