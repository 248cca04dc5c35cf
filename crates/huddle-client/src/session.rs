//! One room membership from join to teardown

use huddle_media::{MediaCapture, MediaConstraints, MediaEngine, ProduceOptions};
use huddle_protocol::{CodecOptions, RtpEncoding, ServerEvent};
use serde_json::json;
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;

use crate::config::{default_encodings, ClientConfig};
use crate::coordinator::{ProduceOutcome, TransportCoordinator};
use crate::error::{Result, SessionError};
use crate::render::StreamSink;
use crate::router::ParticipantEventRouter;
use crate::signaling::Signaling;

/// What the session publishes and where it goes
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Joined automatically when the server greets the connection
    pub room: Option<String>,
    pub constraints: MediaConstraints,
    pub encodings: Vec<RtpEncoding>,
    pub codec_options: CodecOptions,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            room: None,
            constraints: MediaConstraints::default(),
            encodings: default_encodings(),
            codec_options: CodecOptions {
                video_google_start_bitrate: Some(1000),
            },
        }
    }
}

impl From<&ClientConfig> for SessionSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            room: config.room.clone(),
            constraints: config.constraints.clone(),
            encodings: config.encodings.clone(),
            codec_options: config.codec_options.clone(),
        }
    }
}

pub struct RoomSession {
    coordinator: Arc<TransportCoordinator>,
    router: ParticipantEventRouter,
    engine: Arc<dyn MediaEngine>,
    capture: Arc<dyn MediaCapture>,
    sink: Arc<dyn StreamSink>,
    settings: SessionSettings,
    room: OnceLock<String>,
}

impl RoomSession {
    pub fn new(
        signaling: Signaling,
        engine: Arc<dyn MediaEngine>,
        capture: Arc<dyn MediaCapture>,
        sink: Arc<dyn StreamSink>,
        settings: SessionSettings,
    ) -> Self {
        let coordinator = Arc::new(TransportCoordinator::new(
            signaling,
            Arc::clone(&engine),
            Arc::clone(&sink),
        ));
        let router = ParticipantEventRouter::new(Arc::clone(&coordinator));

        Self {
            coordinator,
            router,
            engine,
            capture,
            sink,
            settings,
            room: OnceLock::new(),
        }
    }

    pub fn room(&self) -> Option<&str> {
        self.room.get().map(String::as_str)
    }

    pub fn coordinator(&self) -> &Arc<TransportCoordinator> {
        &self.coordinator
    }

    pub fn router(&self) -> &ParticipantEventRouter {
        &self.router
    }

    /// Join `room_name`, start publishing the local track and consume the
    /// participants already present
    pub async fn join(&self, room_name: &str) -> Result<ProduceOutcome> {
        if !self.coordinator.signaling().is_connected() {
            return Err(SessionError::NotConnected);
        }
        if self.room.set(room_name.to_string()).is_err() {
            return Err(SessionError::AlreadyJoined);
        }

        tracing::info!("Joining room {}", room_name);

        let track = self
            .capture
            .acquire_local_track(&self.settings.constraints)
            .await?;
        self.sink.present_local(&track);

        let capabilities = self.coordinator.signaling().join_room(room_name).await?;
        tracing::debug!(
            "Router offers {} codecs",
            capabilities.codecs.len()
        );

        self.engine
            .load(&capabilities)
            .await
            .map_err(SessionError::EngineInit)?;

        let outcome = self
            .coordinator
            .start_producing(ProduceOptions {
                track,
                encodings: self.settings.encodings.clone(),
                codec_options: self.settings.codec_options.clone(),
                app_data: json!({}),
            })
            .await?;

        if outcome.producers_exist {
            self.router.discover_existing_producers().await?;
        }

        tracing::info!("Joined room {} as producer {}", room_name, outcome.producer_id);
        Ok(outcome)
    }

    /// Process server events until the channel closes, then leave
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<ServerEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                ServerEvent::ConnectionSuccess { socket_id } => {
                    tracing::info!("Signaling session {}", socket_id);
                    self.auto_join();
                }
                ServerEvent::NewProducer { remote_producer_id } => {
                    self.router.producer_appeared(remote_producer_id);
                }
                ServerEvent::ProducerClosed { remote_producer_id } => {
                    self.router.producer_closed(&remote_producer_id).await;
                }
            }
        }

        tracing::info!("Signaling event stream ended");
        self.leave().await;
    }

    fn auto_join(self: &Arc<Self>) {
        let Some(room) = self.settings.room.clone() else {
            tracing::debug!("No room configured, waiting for an explicit join");
            return;
        };
        if self.room().is_some() {
            return;
        }

        let session = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = session.join(&room).await {
                tracing::error!("Failed to join room {}: {}", room, e);
            }
        });
    }

    /// Close the producer, the send transport and every consumer
    pub async fn leave(&self) {
        let released = self.coordinator.shutdown().await;
        match self.room() {
            Some(room) => tracing::info!("Left room {} ({} consumers released)", room, released),
            None => tracing::debug!("Session closed before joining"),
        }
    }
}
