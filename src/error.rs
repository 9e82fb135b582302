use thiserror::Error;

use crate::peer::types::SdpKind;

/// Relay channel failures. These never reach the operator: the transport
/// reconnects on its own.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("relay connect failed: {0}")]
    Connect(String),

    #[error("relay send failed: {0}")]
    Send(String),

    #[error("relay receive failed: {0}")]
    Receive(String),

    #[error("relay channel closed")]
    Closed,

    #[error("relay channel is not open")]
    NotOpen,

    #[error("malformed signaling frame: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Failures applying descriptions or candidates. Terminal for the current
/// negotiation attempt.
#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error("failed to create peer connection: {0}")]
    Setup(String),

    #[error("failed to add local media: {0}")]
    LocalMedia(String),

    #[error("failed to create {0} description: {1}")]
    CreateDescription(SdpKind, String),

    #[error("failed to apply local description: {0}")]
    LocalDescription(String),

    #[error("failed to apply remote description: {0}")]
    RemoteDescription(String),

    #[error("local description missing after it was applied")]
    MissingLocalDescription,

    #[error("failed to add ICE candidate: {0}")]
    Candidate(String),

    #[error("data channel error: {0}")]
    DataChannel(String),

    #[error("failed to close peer connection: {0}")]
    Close(String),
}

/// Media acquisition failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("at least one of audio or video must be requested")]
    NoTracksRequested,

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("capture device unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} identifier must not be empty")]
    EmptyIdentifier(&'static str),

    #[error("ICE server {id:?} has an empty url")]
    EmptyServerUrl { id: String },

    #[error("TURN server {id:?} requires username and credential")]
    TurnCredentials { id: String },

    #[error("invalid relay url {url:?}: {reason}")]
    RelayUrl { url: String, reason: String },
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
