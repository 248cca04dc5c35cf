use anyhow::{Context, Result};
use huddle_client::config::{room_from_link, ClientConfig};
use huddle_client::{RoomSession, SessionSettings, Signaling, StreamBoard, WebSocketSignaling};
use huddle_media::{SampleTrackCapture, WebRtcEngine};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "huddle=debug,huddle_client=debug,huddle_media=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Huddle client...");

    let mut config = ClientConfig::load().context("Failed to load configuration")?;

    // A room link on the command line wins over the configured room
    if let Some(link) = std::env::args().nth(1) {
        config.room = Some(room_from_link(&link).context("Room link has no room name")?);
    }

    let url = config.signaling_url();
    let (channel, events) = WebSocketSignaling::connect(&url, config.request_timeout())
        .await
        .with_context(|| format!("Failed to connect to {}", url))?;

    let board = StreamBoard::new();
    let session = Arc::new(RoomSession::new(
        Signaling::new(Arc::new(channel)),
        Arc::new(WebRtcEngine::new(config.ice_servers.clone())),
        Arc::new(SampleTrackCapture),
        Arc::new(board.clone()),
        SessionSettings::from(&config),
    ));

    tokio::select! {
        _ = Arc::clone(&session).run(events) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, leaving room");
            session.leave().await;
        }
    }

    tracing::info!(
        "Participants still shown at exit: {:?}",
        board.participants()
    );
    Ok(())
}
