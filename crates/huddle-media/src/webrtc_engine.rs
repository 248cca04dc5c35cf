//! MediaEngine backed by webrtc-rs
//!
//! Every server transport maps onto one `RTCPeerConnection`. The local side
//! always creates the offer; the server's half is synthesized from its
//! ICE/DTLS parameters (see [`crate::sdp`]).

use async_trait::async_trait;
use huddle_protocol::{
    DtlsParameters, DtlsRole, IceCandidate, MediaKind, RtcpParameters, RtpCapabilities,
    RtpCodecCapability, RtpCodecParameters, RtpEncoding, RtpParameters, TransportParams,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tokio::sync::OnceCell;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine as RtcMediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTCRtpHeaderExtensionCapability, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCPFeedback, RTCRtpTransceiverInit};
use webrtc::track::track_local::TrackLocal;

use crate::engine::{
    ConsumeOptions, Consumer, MediaEngine, ProduceOptions, ProduceRequest, Producer,
    RecvTransport, SendTransport, TransportListener,
};
use crate::error::{MediaError, Result};
use crate::sdp::{self, AnswerSection, Direction, LocalSection, RemoteSsrc};
use crate::stream::{MediaStream, TrackPublisher};

/// Dynamic payload type range, used when the router has no preference
const DYNAMIC_PAYLOAD_BASE: u8 = 96;
const DYNAMIC_PAYLOAD_MAX: u8 = 127;

/// Payload type for each codec. Router preferences win; codecs without one
/// get the lowest free dynamic type. `None` marks a codec whose type is
/// already taken or for which no dynamic type is left.
fn assign_payload_types(codecs: &[&RtpCodecCapability]) -> Vec<Option<u8>> {
    let preferred: HashSet<u8> = codecs
        .iter()
        .filter_map(|codec| codec.preferred_payload_type)
        .collect();
    let mut taken = HashSet::new();

    codecs
        .iter()
        .map(|codec| {
            let payload_type = match codec.preferred_payload_type {
                Some(payload_type) => payload_type,
                None => (DYNAMIC_PAYLOAD_BASE..=DYNAMIC_PAYLOAD_MAX)
                    .find(|pt| !preferred.contains(pt) && !taken.contains(pt))?,
            };
            taken.insert(payload_type).then_some(payload_type)
        })
        .collect()
}

fn codec_type(kind: MediaKind) -> RTPCodecType {
    match kind {
        MediaKind::Audio => RTPCodecType::Audio,
        MediaKind::Video => RTPCodecType::Video,
    }
}

struct LoadedEngine {
    api: API,
    capabilities: RtpCapabilities,
}

pub struct WebRtcEngine {
    ice_servers: Vec<String>,
    loaded: OnceLock<LoadedEngine>,
}

impl WebRtcEngine {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self {
            ice_servers,
            loaded: OnceLock::new(),
        }
    }

    fn loaded(&self) -> Result<&LoadedEngine> {
        self.loaded.get().ok_or(MediaError::NotLoaded)
    }

    async fn new_peer_connection(&self, transport_id: &str) -> Result<Arc<RTCPeerConnection>> {
        let loaded = self.loaded()?;

        let ice_servers = if self.ice_servers.is_empty() {
            vec![]
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let peer_connection = Arc::new(loaded.api.new_peer_connection(config).await?);

        let id = transport_id.to_string();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let id = id.clone();
                Box::pin(async move {
                    match state {
                        RTCPeerConnectionState::Connected => {
                            tracing::info!("Transport {} connected", id);
                        }
                        RTCPeerConnectionState::Failed => {
                            tracing::error!("Transport {} failed", id);
                        }
                        other => {
                            tracing::debug!("Transport {} state: {:?}", id, other);
                        }
                    }
                })
            },
        ));

        Ok(peer_connection)
    }
}

#[async_trait]
impl MediaEngine for WebRtcEngine {
    async fn load(&self, router_capabilities: &RtpCapabilities) -> Result<()> {
        if self.loaded.get().is_some() {
            return Err(MediaError::AlreadyLoaded);
        }

        let mut media_engine = RtcMediaEngine::default();
        let mut codecs = Vec::new();

        let usable: Vec<&RtpCodecCapability> = router_capabilities
            .codecs
            .iter()
            .filter(|codec| !codec.is_rtx())
            .collect();

        for (codec, payload_type) in usable.iter().zip(assign_payload_types(&usable)) {
            let Some(payload_type) = payload_type else {
                tracing::warn!("Skipping router codec {}: no free payload type", codec.mime_type);
                continue;
            };

            let parameters = RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: codec.mime_type.clone(),
                    clock_rate: codec.clock_rate,
                    channels: codec.channels.unwrap_or(0),
                    sdp_fmtp_line: sdp::fmtp_line(&codec.parameters),
                    rtcp_feedback: codec
                        .rtcp_feedback
                        .iter()
                        .map(|fb| RTCPFeedback {
                            typ: fb.kind.clone(),
                            parameter: fb.parameter.clone(),
                        })
                        .collect(),
                },
                payload_type,
                ..Default::default()
            };

            if let Err(e) = media_engine.register_codec(parameters, codec_type(codec.kind)) {
                tracing::warn!("Skipping router codec {}: {}", codec.mime_type, e);
                continue;
            }

            let mut accepted = (*codec).clone();
            accepted.preferred_payload_type = Some(payload_type);
            codecs.push(accepted);
        }

        if codecs.is_empty() {
            return Err(MediaError::UnsupportedCodec(
                "router offers no codec this device can use".to_string(),
            ));
        }

        // Lets webrtc-rs route incoming RTP by mid
        for kind in [MediaKind::Audio, MediaKind::Video] {
            media_engine.register_header_extension(
                RTCRtpHeaderExtensionCapability {
                    uri: sdp::MID_EXTENSION_URI.to_owned(),
                },
                codec_type(kind),
                None,
            )?;
        }

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let capabilities = RtpCapabilities {
            codecs,
            header_extensions: router_capabilities.header_extensions.clone(),
        };

        tracing::info!(
            "Media engine loaded with {} codecs",
            capabilities.codecs.len()
        );

        self.loaded
            .set(LoadedEngine { api, capabilities })
            .map_err(|_| MediaError::AlreadyLoaded)
    }

    fn rtp_capabilities(&self) -> Result<RtpCapabilities> {
        Ok(self.loaded()?.capabilities.clone())
    }

    async fn create_send_transport(
        &self,
        params: TransportParams,
        listener: Arc<dyn TransportListener>,
    ) -> Result<Arc<dyn SendTransport>> {
        let peer_connection = self.new_peer_connection(&params.id).await?;
        tracing::debug!("Created local send transport {}", params.id);

        Ok(Arc::new(WebRtcSendTransport {
            peer_connection,
            params,
            listener,
            connection: OnceCell::new(),
        }))
    }

    async fn create_recv_transport(
        &self,
        params: TransportParams,
        listener: Arc<dyn TransportListener>,
    ) -> Result<Arc<dyn RecvTransport>> {
        let peer_connection = self.new_peer_connection(&params.id).await?;
        let tracks: Arc<Mutex<HashMap<u32, TrackPublisher>>> = Arc::new(Mutex::new(HashMap::new()));

        // Hand each remote track to the consumer that announced its SSRC
        let track_slots = Arc::clone(&tracks);
        let transport_id = params.id.clone();
        peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
            let track_slots = Arc::clone(&track_slots);
            let transport_id = transport_id.clone();
            Box::pin(async move {
                let ssrc = track.ssrc();
                let delivered = {
                    let slots = track_slots.lock().unwrap_or_else(PoisonError::into_inner);
                    match slots.get(&ssrc) {
                        Some(publisher) => {
                            publisher.send_replace(Some(track));
                            true
                        }
                        None => false,
                    }
                };
                if delivered {
                    tracing::info!("Remote track ssrc={} ready on {}", ssrc, transport_id);
                } else {
                    tracing::warn!("Unexpected remote track ssrc={} on {}", ssrc, transport_id);
                }
            })
        }));

        tracing::debug!("Created local receive transport {}", params.id);

        Ok(Arc::new(WebRtcRecvTransport {
            peer_connection,
            params,
            listener,
            connection: OnceCell::new(),
            consumers: tokio::sync::Mutex::new(Vec::new()),
            tracks,
        }))
    }
}

async fn add_remote_candidates(
    peer_connection: &RTCPeerConnection,
    candidates: &[IceCandidate],
) -> Result<()> {
    for candidate in candidates {
        peer_connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: sdp::candidate_line(candidate),
                ..Default::default()
            })
            .await?;
    }
    Ok(())
}

async fn local_sdp(peer_connection: &RTCPeerConnection) -> Result<String> {
    peer_connection
        .local_description()
        .await
        .map(|description| description.sdp)
        .ok_or_else(|| MediaError::Sdp("no local description".to_string()))
}

/// Fold the requested layers into the single layer webrtc-rs sends
fn single_layer_encoding(ssrc: Option<u32>, requested: &[RtpEncoding]) -> Vec<RtpEncoding> {
    vec![RtpEncoding {
        ssrc,
        rid: None,
        max_bitrate: requested.iter().filter_map(|e| e.max_bitrate).max(),
        scalability_mode: requested.iter().find_map(|e| e.scalability_mode.clone()),
    }]
}

struct SendConnection {
    sender: Arc<RTCRtpSender>,
    section: LocalSection,
}

pub struct WebRtcSendTransport {
    peer_connection: Arc<RTCPeerConnection>,
    params: TransportParams,
    listener: Arc<dyn TransportListener>,
    connection: OnceCell<SendConnection>,
}

impl WebRtcSendTransport {
    async fn establish(&self) -> Result<SendConnection> {
        // A placeholder track keeps the m-section alive until produce binds the real one
        let transceiver = self
            .peer_connection
            .add_transceiver_from_kind(
                RTPCodecType::Video,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Sendonly,
                    send_encodings: vec![],
                }),
            )
            .await?;

        let offer = self.peer_connection.create_offer(None).await?;
        self.peer_connection.set_local_description(offer).await?;
        let local = local_sdp(&self.peer_connection).await?;

        let section = sdp::parse_local_sections(&local)
            .into_iter()
            .find(|section| section.kind == MediaKind::Video)
            .ok_or_else(|| MediaError::Sdp("offer has no video section".to_string()))?;

        self.listener
            .on_connect(DtlsParameters {
                role: DtlsRole::Client,
                fingerprints: sdp::extract_fingerprints(&local)?,
            })
            .await?;

        let answer = sdp::build_remote_answer(
            &self.params,
            &[AnswerSection::mirror(&section, Direction::RecvOnly)],
        )?;
        self.peer_connection
            .set_remote_description(RTCSessionDescription::answer(answer)?)
            .await?;
        add_remote_candidates(&self.peer_connection, &self.params.ice_candidates).await?;

        let sender = transceiver.sender().await;

        let rtcp_sender = Arc::clone(&sender);
        let transport_id = self.params.id.clone();
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while let Ok((_, _)) = rtcp_sender.read(&mut rtcp_buf).await {}
            tracing::debug!("RTCP reader for {} stopped", transport_id);
        });

        Ok(SendConnection { sender, section })
    }
}

#[async_trait]
impl SendTransport for WebRtcSendTransport {
    fn id(&self) -> &str {
        &self.params.id
    }

    async fn connect(&self) -> Result<()> {
        self.connection.get_or_try_init(|| self.establish()).await?;
        Ok(())
    }

    async fn produce(&self, options: ProduceOptions) -> Result<Arc<dyn Producer>> {
        let connection = self.connection.get_or_try_init(|| self.establish()).await?;
        let track = &options.track;

        if track.kind() != MediaKind::Video {
            return Err(MediaError::UnsupportedCodec(format!(
                "{} producers are not supported",
                track.kind()
            )));
        }

        let codec: RtpCodecParameters = connection
            .section
            .codecs
            .iter()
            .find(|codec| codec.mime_type.eq_ignore_ascii_case(&track.codec().mime_type))
            .cloned()
            .ok_or_else(|| MediaError::UnsupportedCodec(track.codec().mime_type.clone()))?;

        connection
            .sender
            .replace_track(Some(track.sample_track() as Arc<dyn TrackLocal + Send + Sync>))
            .await?;

        if options.encodings.len() > 1 {
            tracing::debug!(
                "Sending {} requested layers as a single layer",
                options.encodings.len()
            );
        }
        if let Some(bitrate) = options.codec_options.video_google_start_bitrate {
            tracing::debug!("Start bitrate hint {} kbps left to the encoder", bitrate);
        }

        let rtp_parameters = RtpParameters {
            mid: Some(connection.section.mid.clone()),
            codecs: vec![codec],
            header_extensions: vec![],
            encodings: single_layer_encoding(connection.section.ssrc, &options.encodings),
            rtcp: Some(RtcpParameters {
                cname: connection.section.cname.clone(),
                reduced_size: Some(true),
            }),
        };

        let id = self
            .listener
            .on_produce(ProduceRequest {
                kind: track.kind(),
                rtp_parameters,
                app_data: options.app_data.clone(),
            })
            .await?;

        tracing::info!("Producing {} as {}", track.kind(), id);

        Ok(Arc::new(WebRtcProducer {
            id,
            kind: track.kind(),
            sender: Arc::clone(&connection.sender),
        }))
    }

    async fn close(&self) {
        if let Err(e) = self.peer_connection.close().await {
            tracing::warn!("Failed to close send transport {}: {}", self.params.id, e);
        }
    }
}

struct ConsumerSlot {
    id: String,
    producer_id: String,
    kind: MediaKind,
    ssrc: u32,
    cname: String,
    codecs: Vec<RtpCodecParameters>,
    mid_extension_id: Option<u16>,
}

pub struct WebRtcRecvTransport {
    peer_connection: Arc<RTCPeerConnection>,
    params: TransportParams,
    listener: Arc<dyn TransportListener>,
    connection: OnceCell<()>,
    consumers: tokio::sync::Mutex<Vec<ConsumerSlot>>,
    tracks: Arc<Mutex<HashMap<u32, TrackPublisher>>>,
}

impl WebRtcRecvTransport {
    async fn establish(&self) -> Result<()> {
        for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
            self.peer_connection
                .add_transceiver_from_kind(
                    kind,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await?;
        }

        let offer = self.peer_connection.create_offer(None).await?;
        self.peer_connection.set_local_description(offer).await?;
        let local = local_sdp(&self.peer_connection).await?;

        self.listener
            .on_connect(DtlsParameters {
                role: DtlsRole::Client,
                fingerprints: sdp::extract_fingerprints(&local)?,
            })
            .await
    }

    /// Apply an answer announcing every consumer recorded so far
    async fn negotiate(&self, consumers: &[ConsumerSlot], renegotiate: bool) -> Result<()> {
        if renegotiate {
            let offer = self.peer_connection.create_offer(None).await?;
            self.peer_connection.set_local_description(offer).await?;
        }
        let local = local_sdp(&self.peer_connection).await?;

        let sections: Vec<AnswerSection> = sdp::parse_local_sections(&local)
            .iter()
            .map(|section| {
                let matching: Vec<&ConsumerSlot> =
                    consumers.iter().filter(|c| c.kind == section.kind).collect();
                if matching.is_empty() {
                    return AnswerSection::mirror(section, Direction::Inactive);
                }

                let mut codecs: Vec<RtpCodecParameters> = Vec::new();
                for codec in matching.iter().flat_map(|slot| slot.codecs.iter()) {
                    if !codecs.iter().any(|c| c.payload_type == codec.payload_type) {
                        codecs.push(codec.clone());
                    }
                }

                AnswerSection {
                    kind: section.kind,
                    mid: section.mid.clone(),
                    direction: Direction::SendOnly,
                    codecs,
                    mid_extension_id: matching.iter().find_map(|slot| slot.mid_extension_id),
                    ssrcs: matching
                        .iter()
                        .map(|slot| RemoteSsrc {
                            ssrc: slot.ssrc,
                            cname: slot.cname.clone(),
                            stream_id: slot.producer_id.clone(),
                            track_id: slot.id.clone(),
                        })
                        .collect(),
                }
            })
            .collect();

        let answer = sdp::build_remote_answer(&self.params, &sections)?;
        self.peer_connection
            .set_remote_description(RTCSessionDescription::answer(answer)?)
            .await?;

        if !renegotiate {
            add_remote_candidates(&self.peer_connection, &self.params.ice_candidates).await?;
        }
        Ok(())
    }

    fn release_track(&self, ssrc: u32) {
        self.tracks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&ssrc);
    }
}

#[async_trait]
impl RecvTransport for WebRtcRecvTransport {
    fn id(&self) -> &str {
        &self.params.id
    }

    async fn connect(&self) -> Result<()> {
        self.connection.get_or_try_init(|| self.establish()).await?;
        Ok(())
    }

    async fn consume(&self, options: ConsumeOptions) -> Result<Arc<dyn Consumer>> {
        self.connection.get_or_try_init(|| self.establish()).await?;

        let ssrc = options
            .rtp_parameters
            .primary_ssrc()
            .ok_or_else(|| MediaError::Sdp(format!("consumer {} has no ssrc", options.id)))?;

        let (stream, publisher) = MediaStream::new(options.producer_id.clone(), options.kind);
        self.tracks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(ssrc, publisher);

        let mut consumers = self.consumers.lock().await;
        let renegotiate = !consumers.is_empty();
        consumers.push(ConsumerSlot {
            id: options.id.clone(),
            producer_id: options.producer_id.clone(),
            kind: options.kind,
            ssrc,
            cname: options
                .rtp_parameters
                .rtcp
                .as_ref()
                .and_then(|rtcp| rtcp.cname.clone())
                .unwrap_or_else(|| options.producer_id.clone()),
            codecs: options.rtp_parameters.codecs.clone(),
            mid_extension_id: sdp::mid_extension_id(&options.rtp_parameters.header_extensions),
        });

        if let Err(e) = self.negotiate(&consumers, renegotiate).await {
            consumers.retain(|slot| slot.id != options.id);
            self.release_track(ssrc);
            return Err(e);
        }
        drop(consumers);

        tracing::info!(
            "Consuming {} {} (ssrc={}) on {}",
            options.kind,
            options.producer_id,
            ssrc,
            self.params.id
        );

        Ok(Arc::new(WebRtcConsumer {
            id: options.id,
            producer_id: options.producer_id,
            kind: options.kind,
            ssrc,
            stream,
            tracks: Arc::clone(&self.tracks),
        }))
    }

    async fn close(&self) {
        if let Err(e) = self.peer_connection.close().await {
            tracing::warn!("Failed to close receive transport {}: {}", self.params.id, e);
        }
    }
}

pub struct WebRtcProducer {
    id: String,
    kind: MediaKind,
    sender: Arc<RTCRtpSender>,
}

#[async_trait]
impl Producer for WebRtcProducer {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn close(&self) {
        if let Err(e) = self.sender.stop().await {
            tracing::warn!("Failed to stop producer {}: {}", self.id, e);
        }
    }
}

pub struct WebRtcConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    ssrc: u32,
    stream: MediaStream,
    tracks: Arc<Mutex<HashMap<u32, TrackPublisher>>>,
}

#[async_trait]
impl Consumer for WebRtcConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    fn producer_id(&self) -> &str {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn stream(&self) -> MediaStream {
        self.stream.clone()
    }

    async fn close(&self) {
        // Dropping the publisher ends every `wait_for_track` on this stream
        self.tracks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.ssrc);
    }
}
