use std::time::Duration;

use url::Url;

use crate::error::ConfigError;
use crate::media::MediaConstraints;
use crate::peer::types::ServerConfig;

/// Liveness ping period on an open relay channel.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Fixed delay before reconnecting a closed relay channel.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

pub const DEFAULT_RELAY_URL: &str = "wss://127.0.0.1:8443/";

pub const DATA_CHANNEL_LABEL: &str = "peercall-data";

const DEFAULT_STUN_SERVERS: [&str; 3] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];

/// Local/remote identifier pair used by the relay for routing. Fixed for
/// the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIds {
    local: String,
    remote: String,
}

impl PeerIds {
    pub fn new(local: impl Into<String>, remote: impl Into<String>) -> Result<Self, ConfigError> {
        let local = local.into().trim().to_string();
        let remote = remote.into().trim().to_string();
        if local.is_empty() {
            return Err(ConfigError::EmptyIdentifier("local"));
        }
        if remote.is_empty() {
            return Err(ConfigError::EmptyIdentifier("remote"));
        }
        Ok(Self { local, remote })
    }

    pub fn local(&self) -> &str {
        &self.local
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub relay_url: String,
    pub ice_servers: Vec<ServerConfig>,
    pub ping_interval: Duration,
    pub reconnect_delay: Duration,
    pub data_channel_label: String,
    /// Whether the offering side opens the data channel itself.
    pub open_data_channel: bool,
    pub constraints: MediaConstraints,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            ice_servers: default_ice_servers(),
            ping_interval: PING_INTERVAL,
            reconnect_delay: RECONNECT_DELAY,
            data_channel_label: DATA_CHANNEL_LABEL.to_string(),
            open_data_channel: false,
            constraints: MediaConstraints::default(),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = Url::parse(&self.relay_url).map_err(|e| ConfigError::RelayUrl {
            url: self.relay_url.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ConfigError::RelayUrl {
                url: self.relay_url.clone(),
                reason: format!("unsupported scheme {:?}", url.scheme()),
            });
        }
        validate_ice_servers(&self.ice_servers)
    }
}

pub fn default_ice_servers() -> Vec<ServerConfig> {
    DEFAULT_STUN_SERVERS
        .iter()
        .enumerate()
        .map(|(i, url)| ServerConfig {
            id: format!("default-stun-{i}"),
            r#type: "stun".into(),
            url: (*url).into(),
            username: None,
            credential: None,
        })
        .collect()
}

/// Every server needs a url; TURN servers need credentials too.
pub fn validate_ice_servers(servers: &[ServerConfig]) -> Result<(), ConfigError> {
    for server in servers {
        if server.url.is_empty() {
            return Err(ConfigError::EmptyServerUrl {
                id: server.id.clone(),
            });
        }

        if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none()) {
            return Err(ConfigError::TurnCredentials {
                id: server.id.clone(),
            });
        }
    }
    Ok(())
}

/// Parses `url[,username,credential]`; the type is taken from the url scheme.
pub fn parse_ice_server(spec: &str) -> Result<ServerConfig, ConfigError> {
    let mut parts = spec.split(',').map(str::trim);
    let url = parts.next().unwrap_or_default().to_string();
    let username = parts.next().filter(|s| !s.is_empty()).map(str::to_string);
    let credential = parts.next().filter(|s| !s.is_empty()).map(str::to_string);
    let kind = if url.starts_with("turn") { "turn" } else { "stun" };
    let server = ServerConfig {
        id: url.clone(),
        r#type: kind.into(),
        url,
        username,
        credential,
    };
    validate_ice_servers(std::slice::from_ref(&server))?;
    Ok(server)
}
