//! Local capture boundary
//!
//! Camera and microphone hardware live outside this crate. A capture
//! implementation hands back a [`LocalTrack`] that frames are written into,
//! and the send transport publishes that track.

use async_trait::async_trait;
use huddle_protocol::MediaKind;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;
use webrtc::api::media_engine::MIME_TYPE_VP8;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::{MediaError, Result};

/// Inclusive pixel range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionRange {
    pub min: u32,
    pub max: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoConstraints {
    pub width: DimensionRange,
    pub height: DimensionRange,
}

/// What to ask the capture device for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    #[serde(default)]
    pub audio: bool,
    #[serde(default)]
    pub video: Option<VideoConstraints>,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: false,
            video: Some(VideoConstraints {
                width: DimensionRange { min: 640, max: 1920 },
                height: DimensionRange { min: 400, max: 1080 },
            }),
        }
    }
}

/// Outbound track owned by the local session
#[derive(Clone)]
pub struct LocalTrack {
    kind: MediaKind,
    codec: RTCRtpCodecCapability,
    constraints: MediaConstraints,
    track: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    pub fn new(
        kind: MediaKind,
        codec: RTCRtpCodecCapability,
        constraints: MediaConstraints,
        stream_id: impl Into<String>,
    ) -> Self {
        let track = Arc::new(TrackLocalStaticSample::new(
            codec.clone(),
            kind.as_str().to_string(),
            stream_id.into(),
        ));
        Self {
            kind,
            codec,
            constraints,
            track,
        }
    }

    pub fn id(&self) -> &str {
        self.track.id()
    }

    pub fn stream_id(&self) -> &str {
        self.track.stream_id()
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn codec(&self) -> &RTCRtpCodecCapability {
        &self.codec
    }

    pub fn constraints(&self) -> &MediaConstraints {
        &self.constraints
    }

    pub fn sample_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.track)
    }

    /// Push one encoded frame to every transport the track is bound to
    pub async fn write_sample(&self, sample: &Sample) -> Result<()> {
        self.track.write_sample(sample).await?;
        Ok(())
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("kind", &self.kind)
            .field("mime_type", &self.codec.mime_type)
            .field("stream_id", &self.track.stream_id())
            .finish()
    }
}

#[async_trait]
pub trait MediaCapture: Send + Sync {
    /// Open the capture device. Called once per session.
    async fn acquire_local_track(&self, constraints: &MediaConstraints) -> Result<LocalTrack>;
}

/// Capture that exposes a VP8 sample track for an external frame source
#[derive(Debug, Default, Clone)]
pub struct SampleTrackCapture;

#[async_trait]
impl MediaCapture for SampleTrackCapture {
    async fn acquire_local_track(&self, constraints: &MediaConstraints) -> Result<LocalTrack> {
        if constraints.audio {
            tracing::warn!("Audio capture requested but only video is available, ignoring audio");
        }

        let Some(video) = constraints.video else {
            return Err(MediaError::Capture("no video constraints given".to_string()));
        };

        tracing::info!(
            "Opening video track ({}-{} x {}-{})",
            video.width.min,
            video.width.max,
            video.height.min,
            video.height.max
        );

        let codec = RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        };

        Ok(LocalTrack::new(
            MediaKind::Video,
            codec,
            constraints.clone(),
            format!("stream-local-{}", Uuid::new_v4()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_constraints_yield_video_track() {
        let track = SampleTrackCapture
            .acquire_local_track(&MediaConstraints::default())
            .await
            .unwrap();
        assert_eq!(track.kind(), MediaKind::Video);
        assert_eq!(track.codec().mime_type, MIME_TYPE_VP8);
        assert!(track.stream_id().starts_with("stream-local-"));
    }

    #[tokio::test]
    async fn test_audio_only_constraints_are_rejected() {
        let constraints = MediaConstraints {
            audio: true,
            video: None,
        };
        let result = SampleTrackCapture.acquire_local_track(&constraints).await;
        assert!(matches!(result, Err(MediaError::Capture(_))));
    }
}
