//! Scripted stand-ins for the relay server, the media stack and the renderer

#![allow(dead_code)]

use async_trait::async_trait;
use huddle_client::{RoomSession, SessionSettings, Signaling, SignalingChannel, SignalingError, StreamSink};
use huddle_media::{
    ConsumeOptions, Consumer, LocalTrack, MediaEngine, MediaError, MediaStream, ProduceOptions,
    ProduceRequest, Producer, RecvTransport, SampleTrackCapture, SendTransport, TrackPublisher,
    TransportListener,
};
use huddle_protocol::{
    ClientRequest, DtlsFingerprint, DtlsParameters, DtlsRole, MediaKind, RtpCapabilities,
    RtpParameters, TransportParams,
};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Upper bound for any single await in a test
pub const STEP: Duration = Duration::from_secs(5);

pub fn router_capabilities() -> Value {
    json!({
        "codecs": [
            { "kind": "audio", "mimeType": "audio/opus", "preferredPayloadType": 100,
              "clockRate": 48000, "channels": 2 },
            { "kind": "video", "mimeType": "video/VP8", "preferredPayloadType": 101,
              "clockRate": 90000 }
        ],
        "headerExtensions": []
    })
}

/// Server behavior for one test
#[derive(Debug, Clone)]
pub struct Script {
    /// Body of the `joinRoom` acknowledgement
    pub join_reply: Value,
    pub producer_id: String,
    pub producers_exist: bool,
    pub producers: Vec<String>,
    /// `createWebRtcTransport` with `consumer: false` answers `{params: {error}}`
    pub reject_send_transport: bool,
    /// Producers whose `consume` answers `{params: {error}}`
    pub reject_consume: HashSet<String>,
    /// Producers whose `consume` answers with another producer's id
    pub misrouted_consume: HashSet<String>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            join_reply: json!({ "rtpCapabilities": router_capabilities() }),
            producer_id: "p1".to_string(),
            producers_exist: false,
            producers: vec![],
            reject_send_transport: false,
            reject_consume: HashSet::new(),
            misrouted_consume: HashSet::new(),
        }
    }
}

/// Pauses one request until the test lets it through
#[derive(Default)]
pub struct Hold {
    reached: Notify,
    release: Notify,
}

impl Hold {
    pub async fn reached(&self) {
        tokio::time::timeout(STEP, self.reached.notified())
            .await
            .expect("held request never arrived");
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

pub struct MockSignaling {
    script: Script,
    connected: AtomicBool,
    log: Mutex<Vec<ClientRequest>>,
    holds: Mutex<HashMap<String, Arc<Hold>>>,
    next_transport: AtomicU64,
    next_ssrc: AtomicU64,
}

impl MockSignaling {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            connected: AtomicBool::new(true),
            log: Mutex::new(Vec::new()),
            holds: Mutex::new(HashMap::new()),
            next_transport: AtomicU64::new(1),
            next_ssrc: AtomicU64::new(1000),
        }
    }

    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Hold the next request matching `key`: a method name, or
    /// `consume:<producer>` for one producer's consume
    pub fn hold(&self, key: &str) -> Arc<Hold> {
        let hold = Arc::new(Hold::default());
        self.holds
            .lock()
            .unwrap()
            .insert(key.to_string(), Arc::clone(&hold));
        hold
    }

    pub fn requests(&self) -> Vec<ClientRequest> {
        self.log.lock().unwrap().clone()
    }

    pub fn methods(&self) -> Vec<&'static str> {
        self.requests().iter().map(ClientRequest::method).collect()
    }

    pub fn count(&self, method: &str) -> usize {
        self.methods().iter().filter(|m| **m == method).count()
    }

    fn hold_key(request: &ClientRequest) -> String {
        match request {
            ClientRequest::Consume {
                remote_producer_id, ..
            } => format!("consume:{}", remote_producer_id),
            other => other.method().to_string(),
        }
    }

    fn take_hold(&self, request: &ClientRequest) -> Option<Arc<Hold>> {
        let mut holds = self.holds.lock().unwrap();
        holds
            .remove(&Self::hold_key(request))
            .or_else(|| holds.remove(request.method()))
    }

    fn transport_params(&self) -> Value {
        let n = self.next_transport.fetch_add(1, Ordering::SeqCst);
        json!({
            "id": format!("t{}", n),
            "iceParameters": { "usernameFragment": "ufrag", "password": "pwd", "iceLite": true },
            "iceCandidates": [{
                "foundation": "udpcandidate", "priority": 1076302079, "ip": "10.0.0.1",
                "protocol": "udp", "port": 40000 + n, "type": "host"
            }],
            "dtlsParameters": {
                "role": "auto",
                "fingerprints": [{ "algorithm": "sha-256", "value": "AB:CD" }]
            }
        })
    }

    fn reply(&self, request: &ClientRequest) -> Value {
        match request {
            ClientRequest::JoinRoom { .. } => self.script.join_reply.clone(),
            ClientRequest::CreateWebRtcTransport { consumer } => {
                if !consumer && self.script.reject_send_transport {
                    json!({ "params": { "error": "router closed" } })
                } else {
                    json!({ "params": self.transport_params() })
                }
            }
            ClientRequest::TransportConnect { .. } | ClientRequest::TransportReceiveConnect { .. } => {
                json!({})
            }
            ClientRequest::TransportProduce { .. } => json!({
                "id": self.script.producer_id,
                "producersExist": self.script.producers_exist
            }),
            ClientRequest::Consume {
                remote_producer_id, ..
            } => {
                if self.script.reject_consume.contains(remote_producer_id) {
                    return json!({ "params": { "error": "cannot consume" } });
                }
                let producer_id = if self.script.misrouted_consume.contains(remote_producer_id) {
                    format!("{}-other", remote_producer_id)
                } else {
                    remote_producer_id.clone()
                };
                json!({ "params": {
                    "id": format!("c-{}", remote_producer_id),
                    "producerId": producer_id,
                    "kind": "video",
                    "rtpParameters": {
                        "mid": "0",
                        "codecs": [{ "mimeType": "video/VP8", "payloadType": 101, "clockRate": 90000 }],
                        "encodings": [{ "ssrc": self.next_ssrc.fetch_add(1, Ordering::SeqCst) }],
                        "rtcp": { "cname": remote_producer_id }
                    }
                }})
            }
            ClientRequest::GetProducers => json!(self.script.producers),
            ClientRequest::ConsumerResume { .. } => Value::Null,
        }
    }
}

#[async_trait]
impl SignalingChannel for MockSignaling {
    async fn request(&self, request: ClientRequest) -> Result<Value, SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::Closed);
        }
        self.log.lock().unwrap().push(request.clone());

        let hold = self.take_hold(&request);
        if let Some(hold) = hold {
            hold.reached.notify_one();
            hold.release.notified().await;
        }

        Ok(self.reply(&request))
    }

    async fn notify(&self, request: ClientRequest) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::Closed);
        }
        self.log.lock().unwrap().push(request.clone());

        let hold = self.take_hold(&request);
        if let Some(hold) = hold {
            hold.reached.notify_one();
            hold.release.notified().await;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

fn local_dtls() -> DtlsParameters {
    DtlsParameters {
        role: DtlsRole::Client,
        fingerprints: vec![DtlsFingerprint {
            algorithm: "sha-256".to_string(),
            value: "01:02".to_string(),
        }],
    }
}

/// Fake media stack. Every transport raises its connect callback
/// `connect_callbacks` times to exercise one-shot forwarding.
pub struct MockEngine {
    pub fail_load: bool,
    pub connect_callbacks: usize,
    pub loaded: Mutex<Option<RtpCapabilities>>,
    pub send_transports: Mutex<Vec<Arc<MockSendTransport>>>,
    pub recv_transports: Mutex<Vec<Arc<MockRecvTransport>>>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            fail_load: false,
            connect_callbacks: 2,
            loaded: Mutex::new(None),
            send_transports: Mutex::new(Vec::new()),
            recv_transports: Mutex::new(Vec::new()),
        }
    }

    pub fn transports_created(&self) -> usize {
        self.send_transports.lock().unwrap().len() + self.recv_transports.lock().unwrap().len()
    }

    pub fn recv_transport(&self, id: &str) -> Option<Arc<MockRecvTransport>> {
        self.recv_transports
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.id == id)
            .cloned()
    }
}

#[async_trait]
impl MediaEngine for MockEngine {
    async fn load(&self, router_capabilities: &RtpCapabilities) -> huddle_media::Result<()> {
        if self.fail_load {
            return Err(MediaError::UnsupportedCodec("device cannot decode".to_string()));
        }
        *self.loaded.lock().unwrap() = Some(router_capabilities.clone());
        Ok(())
    }

    fn rtp_capabilities(&self) -> huddle_media::Result<RtpCapabilities> {
        self.loaded.lock().unwrap().clone().ok_or(MediaError::NotLoaded)
    }

    async fn create_send_transport(
        &self,
        params: TransportParams,
        listener: Arc<dyn TransportListener>,
    ) -> huddle_media::Result<Arc<dyn SendTransport>> {
        let transport = Arc::new(MockSendTransport {
            id: params.id,
            listener,
            connect_callbacks: self.connect_callbacks,
            closed: AtomicBool::new(false),
            producers: Mutex::new(Vec::new()),
        });
        self.send_transports.lock().unwrap().push(Arc::clone(&transport));
        Ok(transport)
    }

    async fn create_recv_transport(
        &self,
        params: TransportParams,
        listener: Arc<dyn TransportListener>,
    ) -> huddle_media::Result<Arc<dyn RecvTransport>> {
        let transport = Arc::new(MockRecvTransport {
            id: params.id,
            listener,
            connect_callbacks: self.connect_callbacks,
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
            consumers: Mutex::new(Vec::new()),
        });
        self.recv_transports.lock().unwrap().push(Arc::clone(&transport));
        Ok(transport)
    }
}

pub struct MockSendTransport {
    pub id: String,
    listener: Arc<dyn TransportListener>,
    connect_callbacks: usize,
    pub closed: AtomicBool,
    pub producers: Mutex<Vec<Arc<MockProducer>>>,
}

#[async_trait]
impl SendTransport for MockSendTransport {
    fn id(&self) -> &str {
        &self.id
    }

    async fn connect(&self) -> huddle_media::Result<()> {
        for _ in 0..self.connect_callbacks {
            self.listener.on_connect(local_dtls()).await?;
        }
        Ok(())
    }

    async fn produce(&self, options: ProduceOptions) -> huddle_media::Result<Arc<dyn Producer>> {
        let kind = options.track.kind();
        let id = self
            .listener
            .on_produce(ProduceRequest {
                kind,
                rtp_parameters: RtpParameters {
                    encodings: options.encodings,
                    ..Default::default()
                },
                app_data: options.app_data,
            })
            .await?;

        let producer = Arc::new(MockProducer {
            id,
            kind,
            closed: AtomicBool::new(false),
        });
        self.producers.lock().unwrap().push(Arc::clone(&producer));
        Ok(producer)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct MockRecvTransport {
    pub id: String,
    listener: Arc<dyn TransportListener>,
    connect_callbacks: usize,
    pub closed: AtomicBool,
    close_calls: AtomicUsize,
    pub consumers: Mutex<Vec<Arc<MockConsumer>>>,
}

impl MockRecvTransport {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecvTransport for MockRecvTransport {
    fn id(&self) -> &str {
        &self.id
    }

    async fn connect(&self) -> huddle_media::Result<()> {
        for _ in 0..self.connect_callbacks {
            self.listener.on_connect(local_dtls()).await?;
        }
        Ok(())
    }

    async fn consume(&self, options: ConsumeOptions) -> huddle_media::Result<Arc<dyn Consumer>> {
        let (stream, publisher) = MediaStream::new(options.producer_id.clone(), options.kind);
        let consumer = Arc::new(MockConsumer {
            id: options.id,
            producer_id: options.producer_id,
            kind: options.kind,
            stream,
            publisher: Mutex::new(Some(publisher)),
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
        });
        self.consumers.lock().unwrap().push(Arc::clone(&consumer));
        Ok(consumer)
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct MockProducer {
    pub id: String,
    kind: MediaKind,
    pub closed: AtomicBool,
}

#[async_trait]
impl Producer for MockProducer {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct MockConsumer {
    pub id: String,
    pub producer_id: String,
    kind: MediaKind,
    stream: MediaStream,
    publisher: Mutex<Option<TrackPublisher>>,
    pub closed: AtomicBool,
    close_calls: AtomicUsize,
}

impl MockConsumer {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Consumer for MockConsumer {
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
        self.publisher.lock().unwrap().take();
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Local,
    Presented(String),
    Discarded(String),
}

/// Called from `present_stream` with the participant id
pub type PresentHook = Box<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SinkEvent>>,
    local_calls: AtomicUsize,
    on_present: Mutex<Option<PresentHook>>,
}

impl RecordingSink {
    pub fn on_present(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        *self.on_present.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn presented(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SinkEvent::Presented(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn discarded(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SinkEvent::Discarded(id) => Some(id),
                _ => None,
            })
            .collect()
    }
}

impl StreamSink for RecordingSink {
    fn present_stream(&self, participant_id: &str, _stream: MediaStream) {
        self.events
            .lock()
            .unwrap()
            .push(SinkEvent::Presented(participant_id.to_string()));
        if let Some(hook) = self.on_present.lock().unwrap().as_ref() {
            hook(participant_id);
        }
    }

    fn discard_stream(&self, participant_id: &str) {
        self.events
            .lock()
            .unwrap()
            .push(SinkEvent::Discarded(participant_id.to_string()));
    }

    fn present_local(&self, _track: &LocalTrack) {
        self.local_calls.fetch_add(1, Ordering::SeqCst);
        self.events.lock().unwrap().push(SinkEvent::Local);
    }
}

pub struct Harness {
    pub signaling: Arc<MockSignaling>,
    pub engine: Arc<MockEngine>,
    pub sink: Arc<RecordingSink>,
    pub session: Arc<RoomSession>,
}

impl Harness {
    pub fn new(script: Script) -> Self {
        Self::with_engine(script, MockEngine::new(), SessionSettings::default())
    }

    pub fn with_engine(script: Script, engine: MockEngine, settings: SessionSettings) -> Self {
        let signaling = Arc::new(MockSignaling::new(script));
        let engine = Arc::new(engine);
        let sink = Arc::new(RecordingSink::default());
        let session = Arc::new(RoomSession::new(
            Signaling::new(signaling.clone()),
            engine.clone(),
            Arc::new(SampleTrackCapture),
            sink.clone(),
            settings,
        ));

        Self {
            signaling,
            engine,
            sink,
            session,
        }
    }
}

/// Harness whose session has already joined room "R1"
pub async fn joined(script: Script) -> Harness {
    let harness = Harness::new(script);
    tokio::time::timeout(STEP, harness.session.join("R1"))
        .await
        .expect("join timed out")
        .expect("join failed");
    harness
}

/// Wait until `check` holds
pub async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(STEP, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
