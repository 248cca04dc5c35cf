//! Client configuration
//!
//! Sources, lowest priority first: built-in defaults, `huddle.toml` in the
//! user config directory, `huddle.toml` in the working directory, then
//! `HUDDLE_*` environment variables (a `.env` file is loaded beforehand by the
//! binary).

use config::{Config, ConfigError, Environment, File};
use huddle_media::MediaConstraints;
use huddle_protocol::{CodecOptions, RtpEncoding};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const CONFIG_FILE_NAME: &str = "huddle.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Scheme and host of the relay server, e.g. `ws://localhost`
    pub server_host: String,
    pub server_port: u16,
    /// Path of the signaling endpoint on the server
    pub signaling_namespace: String,
    /// Room joined once the server greets the connection
    pub room: Option<String>,
    pub ice_servers: Vec<String>,
    /// Per-request timeout of the WebSocket adapter. Unset waits forever.
    pub request_timeout_ms: Option<u64>,
    pub constraints: MediaConstraints,
    pub encodings: Vec<RtpEncoding>,
    pub codec_options: CodecOptions,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_host: "ws://localhost".to_string(),
            server_port: 3000,
            signaling_namespace: "/mediasoup".to_string(),
            room: None,
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            request_timeout_ms: None,
            constraints: MediaConstraints::default(),
            encodings: default_encodings(),
            codec_options: CodecOptions {
                video_google_start_bitrate: Some(1000),
            },
        }
    }
}

/// Three simulcast layers, lowest first
pub fn default_encodings() -> Vec<RtpEncoding> {
    [("r0", 100_000), ("r1", 300_000), ("r2", 900_000)]
        .into_iter()
        .map(|(rid, max_bitrate)| RtpEncoding {
            rid: Some(rid.to_string()),
            max_bitrate: Some(max_bitrate),
            scalability_mode: Some("S1T3".to_string()),
            ..Default::default()
        })
        .collect()
}

impl ClientConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        if let Some(path) = Self::user_config_path() {
            builder = builder.add_source(File::from(path).required(false));
        }

        builder = builder
            .add_source(File::with_name(CONFIG_FILE_NAME).required(false))
            .add_source(
                Environment::with_prefix("HUDDLE")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("ice_servers"),
            );

        let config: Self = builder.build()?.try_deserialize()?;
        tracing::debug!("Loaded configuration: {:?}", config);
        Ok(config)
    }

    fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("huddle").join(CONFIG_FILE_NAME))
    }

    pub fn signaling_url(&self) -> String {
        format!(
            "{}:{}{}",
            self.server_host, self.server_port, self.signaling_namespace
        )
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}

/// Room name carried by a room link: everything after the last `#`.
/// A bare name without `#` is taken as is.
pub fn room_from_link(link: &str) -> Option<String> {
    let room = match link.rsplit_once('#') {
        Some((_, fragment)) => fragment,
        None => link,
    };
    let room = room.trim();
    if room.is_empty() {
        None
    } else {
        Some(room.to_string())
    }
}
