//! Rendering boundary
//!
//! Video surfaces live outside this crate. The session reports each remote
//! stream through a [`StreamSink`] exactly once when it appears and once when
//! it goes away.

use huddle_media::{LocalTrack, MediaStream};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::task::JoinHandle;

pub trait StreamSink: Send + Sync {
    fn present_stream(&self, participant_id: &str, stream: MediaStream);

    fn discard_stream(&self, participant_id: &str);

    /// Muted preview of the local capture
    fn present_local(&self, _track: &LocalTrack) {}
}

struct RemoteView {
    packets: Arc<AtomicU64>,
    reader: JoinHandle<()>,
}

/// Sink that keeps the current remote streams and counts their RTP packets
#[derive(Clone, Default)]
pub struct StreamBoard {
    views: Arc<RwLock<HashMap<String, RemoteView>>>,
    local: Arc<RwLock<Option<String>>>,
}

impl StreamBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Participants currently on the board, sorted
    pub fn participants(&self) -> Vec<String> {
        let views = self.views.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<_> = views.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn packets_received(&self, participant_id: &str) -> Option<u64> {
        self.views
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(participant_id)
            .map(|view| view.packets.load(Ordering::Relaxed))
    }

    pub fn local_stream_id(&self) -> Option<String> {
        self.local
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl StreamSink for StreamBoard {
    fn present_stream(&self, participant_id: &str, stream: MediaStream) {
        let packets = Arc::new(AtomicU64::new(0));
        let reader = tokio::spawn(count_remote_packets(
            participant_id.to_string(),
            stream,
            Arc::clone(&packets),
        ));

        let previous = self
            .views
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(participant_id.to_string(), RemoteView { packets, reader });

        if let Some(previous) = previous {
            tracing::warn!("Replacing stream already shown for {}", participant_id);
            previous.reader.abort();
        }
        tracing::info!("Showing stream of {}", participant_id);
    }

    fn discard_stream(&self, participant_id: &str) {
        let removed = self
            .views
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(participant_id);

        match removed {
            Some(view) => {
                view.reader.abort();
                tracing::info!("Removed stream of {}", participant_id);
            }
            None => tracing::debug!("No stream shown for {}", participant_id),
        }
    }

    fn present_local(&self, track: &LocalTrack) {
        tracing::info!("Local preview: {} track {}", track.kind(), track.stream_id());
        *self.local.write().unwrap_or_else(PoisonError::into_inner) =
            Some(track.stream_id().to_string());
    }
}

/// Read RTP from a remote track until it ends
async fn count_remote_packets(participant_id: String, mut stream: MediaStream, packets: Arc<AtomicU64>) {
    let Some(track) = stream.wait_for_track().await else {
        tracing::debug!("Stream of {} closed before media arrived", participant_id);
        return;
    };

    tracing::info!(
        "Receiving remote {} track from {}, ssrc {}",
        stream.kind(),
        participant_id,
        track.ssrc()
    );

    loop {
        match track.read_rtp().await {
            Ok((rtp_packet, _attributes)) => {
                let count = packets.fetch_add(1, Ordering::Relaxed) + 1;
                if count % 100 == 1 {
                    tracing::debug!(
                        "RTP packet {} from {}, payload size: {}",
                        count,
                        participant_id,
                        rtp_packet.payload.len()
                    );
                }
            }
            Err(e) => {
                tracing::info!("Remote track of {} ended: {}", participant_id, e);
                break;
            }
        }
    }
}
