use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;
use tracing::info;

/// Complete auction hub configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuctionHubConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub hub: HubConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address the HTTP/WebSocket listener binds to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Route of the auction hub (negotiate lives at `{hub_path}/negotiate`)
    #[serde(default = "default_hub_path")]
    pub hub_path: String,
}

fn default_bind_address() -> String {
    "0.0.0.0:5000".to_string()
}

fn default_hub_path() -> String {
    "/auctionHub".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            hub_path: default_hub_path(),
        }
    }
}

/// Hub connection and broadcast settings
#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    /// Per-connection send timeout during broadcasts (milliseconds)
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// How often the server pings connected clients (seconds)
    #[serde(default = "default_keep_alive_interval")]
    pub keep_alive_interval_seconds: u64,
    /// Close a connection after this long without any inbound message (seconds)
    #[serde(default = "default_client_timeout")]
    pub client_timeout_seconds: u64,
    /// Close a connection that has not completed the handshake in time (seconds)
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_seconds: u64,
    /// Capacity of each connection's outbound frame queue
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
    /// Largest inbound transport message accepted (bytes)
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

fn default_send_timeout_ms() -> u64 {
    5000
}

fn default_keep_alive_interval() -> u64 {
    15
}

fn default_client_timeout() -> u64 {
    30
}

fn default_handshake_timeout() -> u64 {
    15
}

fn default_outbound_buffer() -> usize {
    64
}

fn default_max_message_size() -> usize {
    1_048_576
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            send_timeout_ms: default_send_timeout_ms(),
            keep_alive_interval_seconds: default_keep_alive_interval(),
            client_timeout_seconds: default_client_timeout(),
            handshake_timeout_seconds: default_handshake_timeout(),
            outbound_buffer: default_outbound_buffer(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl HubConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval_seconds.max(1))
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_seconds)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_seconds)
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<AuctionHubConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path))?;
    let config: AuctionHubConfig =
        toml::from_str(&contents).with_context(|| format!("Failed to parse config file {}", path))?;
    Ok(config)
}

impl AuctionHubConfig {
    /// Load from `AUCTION_HUB_CONFIG` (if set), then apply env var overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var("AUCTION_HUB_CONFIG") {
            Ok(path) => {
                info!(path = %path, "Loading configuration file");
                load_config(&path)?
            }
            Err(_) => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Override individual settings from env vars, ignoring unparsable values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("AUCTION_HUB_BIND") {
            self.server.bind_address = v;
        }
        if let Ok(v) = std::env::var("AUCTION_HUB_SEND_TIMEOUT_MS") {
            if let Ok(n) = v.parse::<u64>() {
                self.hub.send_timeout_ms = n;
            }
        }
        if let Ok(v) = std::env::var("AUCTION_HUB_CLIENT_TIMEOUT_SECONDS") {
            if let Ok(n) = v.parse::<u64>() {
                self.hub.client_timeout_seconds = n;
            }
        }
    }
}
