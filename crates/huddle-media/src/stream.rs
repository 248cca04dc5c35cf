//! Handle to one remote participant's inbound media

use huddle_protocol::MediaKind;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use webrtc::track::track_remote::TrackRemote;

/// Sender half used by engines to publish the remote track once RTP arrives
pub type TrackPublisher = watch::Sender<Option<Arc<TrackRemote>>>;

/// A remote stream as handed to the rendering side.
///
/// The consumer exists before its first packet does, so the track is filled
/// in later by the engine.
#[derive(Clone)]
pub struct MediaStream {
    id: String,
    kind: MediaKind,
    track: watch::Receiver<Option<Arc<TrackRemote>>>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>, kind: MediaKind) -> (Self, TrackPublisher) {
        let (tx, rx) = watch::channel(None);
        (
            Self {
                id: id.into(),
                kind,
                track: rx,
            },
            tx,
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Current track, if media has started flowing
    pub fn track(&self) -> Option<Arc<TrackRemote>> {
        self.track.borrow().clone()
    }

    /// Wait until the engine publishes the track. Returns `None` if the
    /// consumer was closed first.
    pub async fn wait_for_track(&mut self) -> Option<Arc<TrackRemote>> {
        loop {
            if let Some(track) = self.track.borrow_and_update().clone() {
                return Some(track);
            }
            if self.track.changed().await.is_err() {
                return None;
            }
        }
    }
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("has_track", &self.track.borrow().is_some())
            .finish()
    }
}
