//! Transport handshakes
//!
//! The coordinator owns the send transport and every receive transport. Each
//! transport is walked through `Requested -> LocalCreated -> Connecting ->
//! Connected -> Producing|Consuming`, with `Closed` reachable from anywhere.
//!
//! Receive handshakes for different remote producers run concurrently. The
//! sink gate, the registry and the in-flight table are locked in that order,
//! briefly, and never across an `.await`. Sink callbacks run with only the
//! gate held, so a sink may read the coordinator.

use async_trait::async_trait;
use huddle_media::{
    Consumer, MediaEngine, MediaError, ProduceOptions, ProduceRequest, Producer, RecvTransport,
    SendTransport, TransportListener,
};
use huddle_protocol::{ConsumerId, DtlsParameters, ProducerId, RtpCapabilities, TransportId};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OnceCell;

use crate::error::{Result, SessionError};
use crate::registry::{ConsumerRecord, ConsumerRegistry, ConsumerSummary};
use crate::render::StreamSink;
use crate::signaling::Signaling;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Requested,
    LocalCreated,
    Connecting,
    Connected,
    Producing,
    Consuming,
    Closed,
}

impl TransportState {
    pub fn can_transition_to(self, next: TransportState) -> bool {
        use TransportState::*;
        matches!(
            (self, next),
            (_, Closed)
                | (Requested, LocalCreated)
                | (LocalCreated, Connecting)
                | (Connecting, Connected)
                | (Connected, Producing)
                | (Connected, Consuming)
        )
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportState::Requested => "requested",
            TransportState::LocalCreated => "local-created",
            TransportState::Connecting => "connecting",
            TransportState::Connected => "connected",
            TransportState::Producing => "producing",
            TransportState::Consuming => "consuming",
            TransportState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportDirection {
    Send,
    Receive,
}

impl fmt::Display for TransportDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportDirection::Send => f.write_str("send"),
            TransportDirection::Receive => f.write_str("receive"),
        }
    }
}

/// State of one transport, keyed by its server id once known
#[derive(Debug)]
pub struct TransportTracker {
    direction: TransportDirection,
    id: Option<TransportId>,
    state: TransportState,
}

impl TransportTracker {
    pub fn new(direction: TransportDirection) -> Self {
        Self {
            direction,
            id: None,
            state: TransportState::Requested,
        }
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn set_id(&mut self, id: impl Into<TransportId>) {
        self.id = Some(id.into());
    }

    pub fn advance(&mut self, next: TransportState) -> Result<()> {
        let id = self.id.as_deref().unwrap_or("<pending>");
        if !self.state.can_transition_to(next) {
            return Err(SessionError::ProtocolViolation {
                request: "transport state",
                reason: format!(
                    "{} transport {} cannot move from {} to {}",
                    self.direction, id, self.state, next
                ),
            });
        }
        tracing::debug!("{} transport {}: {} -> {}", self.direction, id, self.state, next);
        self.state = next;
        Ok(())
    }
}

type SharedTracker = Arc<Mutex<TransportTracker>>;

fn advance(tracker: &SharedTracker, next: TransportState) -> Result<()> {
    lock(tracker).advance(next)
}

fn close_tracker(tracker: &SharedTracker) {
    // Closed is reachable from every state
    let _ = advance(tracker, TransportState::Closed);
}

fn require_state(tracker: &SharedTracker, expected: TransportState, request: &'static str) -> Result<()> {
    let state = lock(tracker).state();
    if state == expected {
        Ok(())
    } else {
        Err(SessionError::ProtocolViolation {
            request,
            reason: format!("transport is {} instead of {}", state, expected),
        })
    }
}

/// Forwards a transport's connect request to the server at most once and
/// replays the outcome to later callers
#[derive(Default)]
struct ConnectGate {
    outcome: OnceCell<std::result::Result<(), String>>,
}

impl ConnectGate {
    async fn forward<F, Fut>(
        &self,
        failure: &Mutex<Option<SessionError>>,
        forward: F,
    ) -> huddle_media::Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let outcome = self
            .outcome
            .get_or_init(|| async {
                match forward().await {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        let reason = e.to_string();
                        *lock(failure) = Some(e);
                        Err(reason)
                    }
                }
            })
            .await;
        outcome.clone().map_err(MediaError::Connect)
    }
}

struct SendListener {
    signaling: Signaling,
    tracker: SharedTracker,
    gate: ConnectGate,
    failure: Mutex<Option<SessionError>>,
    producers_exist: Mutex<Option<bool>>,
}

impl SendListener {
    fn new(signaling: Signaling, tracker: SharedTracker) -> Self {
        Self {
            signaling,
            tracker,
            gate: ConnectGate::default(),
            failure: Mutex::new(None),
            producers_exist: Mutex::new(None),
        }
    }

    fn take_failure(&self) -> Option<SessionError> {
        lock(&self.failure).take()
    }
}

#[async_trait]
impl TransportListener for SendListener {
    async fn on_connect(&self, dtls_parameters: DtlsParameters) -> huddle_media::Result<()> {
        let tracker = &self.tracker;
        let signaling = &self.signaling;
        self.gate
            .forward(&self.failure, move || async move {
                advance(tracker, TransportState::Connecting)?;
                signaling.connect_send_transport(dtls_parameters).await?;
                advance(tracker, TransportState::Connected)
            })
            .await
    }

    async fn on_produce(&self, request: ProduceRequest) -> huddle_media::Result<ProducerId> {
        let response = self
            .signaling
            .produce(request.kind, request.rtp_parameters, request.app_data)
            .await;

        match response {
            Ok(response) => {
                *lock(&self.producers_exist) = Some(response.producers_exist);
                Ok(response.id)
            }
            Err(e) => {
                let reason = e.to_string();
                *lock(&self.failure) = Some(e);
                Err(MediaError::Produce(reason))
            }
        }
    }
}

struct RecvListener {
    signaling: Signaling,
    tracker: SharedTracker,
    server_transport_id: TransportId,
    gate: ConnectGate,
    failure: Mutex<Option<SessionError>>,
}

impl RecvListener {
    fn new(signaling: Signaling, tracker: SharedTracker, server_transport_id: TransportId) -> Self {
        Self {
            signaling,
            tracker,
            server_transport_id,
            gate: ConnectGate::default(),
            failure: Mutex::new(None),
        }
    }

    fn take_failure(&self) -> Option<SessionError> {
        lock(&self.failure).take()
    }
}

#[async_trait]
impl TransportListener for RecvListener {
    async fn on_connect(&self, dtls_parameters: DtlsParameters) -> huddle_media::Result<()> {
        let tracker = &self.tracker;
        let signaling = &self.signaling;
        let server_transport_id = self.server_transport_id.clone();
        self.gate
            .forward(&self.failure, move || async move {
                advance(tracker, TransportState::Connecting)?;
                signaling
                    .connect_recv_transport(dtls_parameters, server_transport_id)
                    .await?;
                advance(tracker, TransportState::Connected)
            })
            .await
    }

    async fn on_produce(&self, _request: ProduceRequest) -> huddle_media::Result<ProducerId> {
        Err(MediaError::Produce(
            "receive transports cannot produce".to_string(),
        ))
    }
}

/// Prefer the signaling-side error a listener recorded over the engine's
fn engine_failure(recorded: Option<SessionError>, error: MediaError) -> SessionError {
    recorded.unwrap_or(SessionError::Media(error))
}

/// Result of the send-side setup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceOutcome {
    pub producer_id: ProducerId,
    pub producers_exist: bool,
}

/// How a receive handshake ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// Consumer registered, presented and resumed
    Registered,
    /// The producer already has a consumer or a handshake in flight
    AlreadyTracked,
    /// The producer closed while the handshake was running
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    InFlight,
    Cancelled,
}

struct SendSide {
    transport: Arc<dyn SendTransport>,
    producer: Arc<dyn Producer>,
    tracker: SharedTracker,
}

enum Registration {
    Done,
    Duplicate(ConsumerRecord),
    Cancelled(ConsumerRecord),
}

pub struct TransportCoordinator {
    signaling: Signaling,
    engine: Arc<dyn MediaEngine>,
    sink: Arc<dyn StreamSink>,
    /// Serializes sink calls so a discard never overtakes its presentation
    sink_gate: Mutex<()>,
    registry: Mutex<ConsumerRegistry>,
    /// In-flight receive handshakes, tagged with a ticket per attempt
    pending: Mutex<HashMap<ProducerId, (u64, Pending)>>,
    next_ticket: AtomicU64,
    producing: AtomicBool,
    send_side: Mutex<Option<SendSide>>,
}

impl TransportCoordinator {
    pub fn new(signaling: Signaling, engine: Arc<dyn MediaEngine>, sink: Arc<dyn StreamSink>) -> Self {
        Self {
            signaling,
            engine,
            sink,
            sink_gate: Mutex::new(()),
            registry: Mutex::new(ConsumerRegistry::new()),
            pending: Mutex::new(HashMap::new()),
            next_ticket: AtomicU64::new(1),
            producing: AtomicBool::new(false),
            send_side: Mutex::new(None),
        }
    }

    pub fn signaling(&self) -> &Signaling {
        &self.signaling
    }

    /// Create the send transport, connect it and publish the local track
    pub async fn start_producing(&self, options: ProduceOptions) -> Result<ProduceOutcome> {
        if self.producing.swap(true, Ordering::SeqCst) {
            return Err(SessionError::AlreadyProducing);
        }

        let result = self.produce(options).await;
        if result.is_err() {
            self.producing.store(false, Ordering::SeqCst);
        }
        result
    }

    async fn produce(&self, options: ProduceOptions) -> Result<ProduceOutcome> {
        let tracker: SharedTracker =
            Arc::new(Mutex::new(TransportTracker::new(TransportDirection::Send)));

        let params = match self.signaling.create_transport(false).await {
            Ok(params) => params,
            Err(e) => return Err(Self::fail(&tracker, e)),
        };
        lock(&tracker).set_id(params.id.clone());

        let listener = Arc::new(SendListener::new(self.signaling.clone(), Arc::clone(&tracker)));
        let transport = match self
            .engine
            .create_send_transport(params, listener.clone())
            .await
        {
            Ok(transport) => transport,
            Err(e) => return Err(Self::fail(&tracker, SessionError::Media(e))),
        };

        let producer = match self.produce_on(&transport, &listener, &tracker, options).await {
            Ok(producer) => producer,
            Err(e) => {
                transport.close().await;
                return Err(Self::fail(&tracker, e));
            }
        };

        let acknowledged = lock(&listener.producers_exist).take();
        let Some(producers_exist) = acknowledged else {
            producer.close().await;
            transport.close().await;
            return Err(Self::fail(
                &tracker,
                SessionError::ProtocolViolation {
                    request: "transport-produce",
                    reason: "producer created without a server acknowledgement".to_string(),
                },
            ));
        };

        let outcome = ProduceOutcome {
            producer_id: producer.id().to_string(),
            producers_exist,
        };

        tracing::info!(
            "Producing {} on {} (producersExist={})",
            outcome.producer_id,
            transport.id(),
            producers_exist
        );

        *lock(&self.send_side) = Some(SendSide {
            transport,
            producer,
            tracker,
        });

        Ok(outcome)
    }

    async fn produce_on(
        &self,
        transport: &Arc<dyn SendTransport>,
        listener: &SendListener,
        tracker: &SharedTracker,
        options: ProduceOptions,
    ) -> Result<Arc<dyn Producer>> {
        advance(tracker, TransportState::LocalCreated)?;

        transport
            .connect()
            .await
            .map_err(|e| engine_failure(listener.take_failure(), e))?;
        require_state(tracker, TransportState::Connected, "transport-connect")?;

        let producer = transport
            .produce(options)
            .await
            .map_err(|e| engine_failure(listener.take_failure(), e))?;
        advance(tracker, TransportState::Producing)?;

        Ok(producer)
    }

    /// Consume one remote producer over a fresh receive transport
    pub async fn consume_remote(&self, remote_producer_id: &str) -> Result<HandshakeOutcome> {
        match self.begin_consume(remote_producer_id) {
            Some(ticket) => self.finish_consume(remote_producer_id, ticket).await,
            None => Ok(HandshakeOutcome::AlreadyTracked),
        }
    }

    /// Reserve the in-flight slot for a producer. `None` if it already has a
    /// consumer or a running handshake.
    pub fn begin_consume(&self, remote_producer_id: &str) -> Option<u64> {
        let registry = lock(&self.registry);
        let mut pending = lock(&self.pending);
        if registry.contains(remote_producer_id) || pending.contains_key(remote_producer_id) {
            tracing::debug!("Producer {} already tracked", remote_producer_id);
            return None;
        }
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        pending.insert(remote_producer_id.to_string(), (ticket, Pending::InFlight));
        Some(ticket)
    }

    /// Run the handshake reserved by [`begin_consume`](Self::begin_consume)
    pub async fn finish_consume(&self, remote_producer_id: &str, ticket: u64) -> Result<HandshakeOutcome> {
        let result = self.receive(remote_producer_id, ticket).await;
        self.clear_pending(remote_producer_id, ticket);

        match &result {
            Ok(HandshakeOutcome::Abandoned) => {
                tracing::info!("Dropped handshake for closed producer {}", remote_producer_id);
            }
            Err(e) => {
                tracing::warn!("Failed to consume producer {}: {}", remote_producer_id, e);
            }
            Ok(_) => {}
        }
        result
    }

    async fn receive(&self, remote_producer_id: &str, ticket: u64) -> Result<HandshakeOutcome> {
        // Nothing goes to the server until the router capabilities are loaded
        let rtp_capabilities = self.engine.rtp_capabilities()?;

        let tracker: SharedTracker =
            Arc::new(Mutex::new(TransportTracker::new(TransportDirection::Receive)));

        let params = match self.signaling.create_transport(true).await {
            Ok(params) => params,
            Err(e) => return Err(Self::fail(&tracker, e)),
        };
        lock(&tracker).set_id(params.id.clone());
        let server_transport_id = params.id.clone();

        if self.is_cancelled(remote_producer_id, ticket) {
            close_tracker(&tracker);
            return Ok(HandshakeOutcome::Abandoned);
        }

        let listener = Arc::new(RecvListener::new(
            self.signaling.clone(),
            Arc::clone(&tracker),
            server_transport_id.clone(),
        ));
        let transport = match self
            .engine
            .create_recv_transport(params, listener.clone())
            .await
        {
            Ok(transport) => transport,
            Err(e) => return Err(Self::fail(&tracker, SessionError::Media(e))),
        };

        let bound = self
            .bind_consumer(
                &transport,
                &listener,
                &tracker,
                remote_producer_id,
                &server_transport_id,
                rtp_capabilities,
                ticket,
            )
            .await;

        let (consumer, server_consumer_id) = match bound {
            Ok(Some(bound)) => bound,
            Ok(None) => {
                transport.close().await;
                close_tracker(&tracker);
                return Ok(HandshakeOutcome::Abandoned);
            }
            Err(e) => {
                transport.close().await;
                return Err(Self::fail(&tracker, e));
            }
        };

        let record = ConsumerRecord {
            receive_transport: Arc::clone(&transport),
            server_transport_id,
            remote_producer_id: remote_producer_id.to_string(),
            consumer: Arc::clone(&consumer),
        };

        // The cancellation check and the insert happen without yielding, so a
        // producer-closed either sees the record or has already marked this
        // handshake. The presentation stays under the sink gate so the
        // matching discard cannot overtake it.
        let registration = {
            let _gate = lock(&self.sink_gate);
            let registration = {
                let mut registry = lock(&self.registry);
                let mut pending = lock(&self.pending);
                let live = matches!(
                    pending.get(remote_producer_id),
                    Some((current, Pending::InFlight)) if *current == ticket
                );
                if live {
                    pending.remove(remote_producer_id);
                    match registry.add(record) {
                        Ok(()) => Registration::Done,
                        Err(rejected) => Registration::Duplicate(rejected),
                    }
                } else {
                    Registration::Cancelled(record)
                }
            };

            if matches!(registration, Registration::Done) {
                self.sink.present_stream(remote_producer_id, consumer.stream());
            }
            registration
        };

        match registration {
            Registration::Done => {}
            Registration::Duplicate(record) => {
                tracing::warn!("Producer {} registered twice, releasing duplicate", remote_producer_id);
                record.release().await;
                close_tracker(&tracker);
                return Ok(HandshakeOutcome::AlreadyTracked);
            }
            Registration::Cancelled(record) => {
                record.release().await;
                close_tracker(&tracker);
                return Ok(HandshakeOutcome::Abandoned);
            }
        }

        if let Err(e) = self.signaling.resume_consumer(server_consumer_id).await {
            tracing::warn!("Failed to resume consumer for {}: {}", remote_producer_id, e);
        }

        tracing::info!("Consuming producer {} on {}", remote_producer_id, transport.id());
        Ok(HandshakeOutcome::Registered)
    }

    /// Connect a receive transport and bind the consumer. `None` means the
    /// producer closed in the meantime.
    async fn bind_consumer(
        &self,
        transport: &Arc<dyn RecvTransport>,
        listener: &RecvListener,
        tracker: &SharedTracker,
        remote_producer_id: &str,
        server_transport_id: &str,
        rtp_capabilities: RtpCapabilities,
        ticket: u64,
    ) -> Result<Option<(Arc<dyn Consumer>, ConsumerId)>> {
        advance(tracker, TransportState::LocalCreated)?;
        if self.is_cancelled(remote_producer_id, ticket) {
            return Ok(None);
        }

        transport
            .connect()
            .await
            .map_err(|e| engine_failure(listener.take_failure(), e))?;
        require_state(tracker, TransportState::Connected, "transport-receive-connect")?;
        if self.is_cancelled(remote_producer_id, ticket) {
            return Ok(None);
        }

        let params = self
            .signaling
            .consume(
                rtp_capabilities,
                remote_producer_id.to_string(),
                server_transport_id.to_string(),
            )
            .await?;
        if self.is_cancelled(remote_producer_id, ticket) {
            return Ok(None);
        }

        if params.producer_id != remote_producer_id {
            return Err(SessionError::ProtocolViolation {
                request: "consume",
                reason: format!(
                    "asked for producer {} but got {}",
                    remote_producer_id, params.producer_id
                ),
            });
        }

        let server_consumer_id = params.id.clone();
        let consumer = transport.consume(params.into()).await?;
        advance(tracker, TransportState::Consuming)?;
        Ok(Some((consumer, server_consumer_id)))
    }

    fn fail(tracker: &SharedTracker, error: SessionError) -> SessionError {
        let mut tracker = lock(tracker);
        let _ = tracker.advance(TransportState::Closed);
        tracing::warn!(
            "{} transport {} aborted: {}",
            tracker.direction,
            tracker.id.as_deref().unwrap_or("<pending>"),
            error
        );
        error
    }

    fn is_cancelled(&self, remote_producer_id: &str, ticket: u64) -> bool {
        !matches!(
            lock(&self.pending).get(remote_producer_id),
            Some((current, Pending::InFlight)) if *current == ticket
        )
    }

    fn clear_pending(&self, remote_producer_id: &str, ticket: u64) {
        let mut pending = lock(&self.pending);
        if matches!(pending.get(remote_producer_id), Some((current, _)) if *current == ticket) {
            pending.remove(remote_producer_id);
        }
    }

    /// Mark an in-flight handshake as stale. Returns whether one was running.
    pub fn cancel_pending(&self, remote_producer_id: &str) -> bool {
        match lock(&self.pending).get_mut(remote_producer_id) {
            Some(entry) => {
                entry.1 = Pending::Cancelled;
                true
            }
            None => false,
        }
    }

    /// Tear down the consumer of a producer that went away
    pub async fn release_remote(&self, remote_producer_id: &str) -> Result<()> {
        let record = lock(&self.registry).remove_by_producer_id(remote_producer_id);

        match record {
            Some(record) => {
                record.release().await;
                let _gate = lock(&self.sink_gate);
                self.sink.discard_stream(remote_producer_id);
                tracing::info!("Released consumer of producer {}", remote_producer_id);
                Ok(())
            }
            None if self.cancel_pending(remote_producer_id) => {
                tracing::debug!("Cancelled in-flight handshake for {}", remote_producer_id);
                Ok(())
            }
            None => Err(SessionError::StaleEvent(remote_producer_id.to_string())),
        }
    }

    /// Close the producer, the send transport and every consumer
    pub async fn shutdown(&self) -> usize {
        for entry in lock(&self.pending).values_mut() {
            entry.1 = Pending::Cancelled;
        }

        let send_side = lock(&self.send_side).take();
        if let Some(side) = send_side {
            side.producer.close().await;
            side.transport.close().await;
            close_tracker(&side.tracker);
        }
        self.producing.store(false, Ordering::SeqCst);

        let records = lock(&self.registry).drain();
        for record in &records {
            record.release().await;
            let _gate = lock(&self.sink_gate);
            self.sink.discard_stream(&record.remote_producer_id);
        }

        tracing::info!("Released {} consumers", records.len());
        records.len()
    }

    pub fn is_producing(&self) -> bool {
        lock(&self.send_side).is_some()
    }

    pub fn consumer_count(&self) -> usize {
        lock(&self.registry).len()
    }

    pub fn producer_ids(&self) -> Vec<ProducerId> {
        lock(&self.registry).producer_ids()
    }

    pub fn snapshot(&self) -> Vec<ConsumerSummary> {
        lock(&self.registry).snapshot()
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.pending).len()
    }
}
