use std::sync::OnceLock;

use clap::ValueEnum;
use tokio::sync::mpsc;
use tracing::level_filters::LevelFilter;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use crate::peer::data_channel::ChannelState;
use crate::peer::engine::ConnectivityState;
use crate::peer::types::{IceCandidate, RemoteTrack};
use crate::session::CallState;

/// Overrides the level-derived filter when set.
pub const LOG_FILTER_ENV: &str = "PEERCALL_LOG";

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to configure logger: {0}")]
    Configure(String),
}

static INIT: OnceLock<()> = OnceLock::new();

/// Installs the global fmt subscriber. Later calls are no-ops.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if INIT.get().is_some() {
        return Ok(());
    }

    let filter = match std::env::var(LOG_FILTER_ENV) {
        Ok(filter) => EnvFilter::new(filter),
        // webrtc internals are noisy below warn
        Err(_) => EnvFilter::new(format!(
            "{},webrtc=warn,webrtc_ice=warn,webrtc_sctp=warn,tungstenite=warn",
            config.level.to_filter()
        )),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.level >= LogLevel::Debug)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| InitError::Configure(err.to_string()))?;
    INIT.set(()).ok();
    Ok(())
}

/// Logs a discovered candidate (trickle ICE).
pub fn dump_candidate(label: &str, cand: &IceCandidate) {
    debug!(
        target = "peer",
        "trickle {label}: candidate={} sdp_mid={:?} sdp_mline_index={:?} username_fragment={:?}",
        cand.candidate,
        cand.sdp_mid,
        cand.sdp_mline_index,
        cand.username_fragment
    );
}

/// Everything the operator is told about.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    TransportOpened,
    TransportClosed,
    State(CallState),
    Connectivity(ConnectivityState),
    Channel(ChannelState),
    Message(String),
    RemoteMediaAttached(RemoteTrack),
    RemoteMediaReleased(usize),
    /// Negotiation failure; the attempt is over until the next start/close.
    SignalingError(String),
    DeviceError(String),
}

/// Operator notification channel. Every emit is logged as well.
#[derive(Clone, Debug, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<ClientEvent>>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Log-only sink.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    fn emit(&self, event: ClientEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }

    pub fn emit_transport(&self, open: bool) {
        debug!(target = "signaling", open, "emit transport state");
        self.emit(if open {
            ClientEvent::TransportOpened
        } else {
            ClientEvent::TransportClosed
        });
    }

    pub fn emit_state(&self, state: CallState) {
        info!(target = "session", ?state, "call state changed");
        self.emit(ClientEvent::State(state));
    }

    pub fn emit_connectivity(&self, state: ConnectivityState) {
        info!(target = "session", ?state, "connection state");
        self.emit(ClientEvent::Connectivity(state));
    }

    pub fn emit_channel(&self, state: ChannelState) {
        info!(target = "session", ?state, "data channel state");
        self.emit(ClientEvent::Channel(state));
    }

    pub fn emit_message(&self, msg: &str) {
        info!(target = "session", "received message: {msg}");
        self.emit(ClientEvent::Message(msg.to_string()));
    }

    pub fn emit_remote_track(&self, track: &RemoteTrack) {
        self.emit(ClientEvent::RemoteMediaAttached(track.clone()));
    }

    pub fn emit_media_released(&self, count: usize) {
        self.emit(ClientEvent::RemoteMediaReleased(count));
    }

    pub fn emit_signaling_error(&self, err: &dyn std::error::Error) {
        error!(target = "negotiation", "signaling error: {err}");
        self.emit(ClientEvent::SignalingError(err.to_string()));
    }

    pub fn emit_device_error(&self, err: &dyn std::error::Error) {
        error!(target = "media", "camera start error: {err}");
        self.emit(ClientEvent::DeviceError(err.to_string()));
    }
}
