//! Seam between the signaling core and the connectivity engine.
//!
//! The negotiation code only talks to [`PeerHandle`]; engine callbacks come
//! back as [`PeerEvent`]s stamped with the epoch of the peer that produced
//! them, so the session controller can discard anything from a superseded
//! peer.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::NegotiationError;
use crate::media::LocalStream;
use crate::peer::types::{IceCandidate, RemoteTrack, SdpKind, SessionDescription};

/// Generation of a negotiation instance. Strictly increasing per process.
pub type Epoch = u64;

pub type ChannelId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Creates the offer.
    Initiator,
    /// Waits for the remote offer.
    Responder,
}

impl Role {
    /// Maps a relay `start` payload to a role.
    pub fn from_start(value: &str) -> Option<Self> {
        match value {
            "offer" => Some(Role::Initiator),
            "answer" => Some(Role::Responder),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Open,
    Closed,
    Error(String),
    Message(String),
}

pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    GatheringComplete,
    ConnectivityChanged(ConnectivityState),
    RemoteTrack(RemoteTrack),
    /// The remote side opened a data channel.
    ChannelOffered(Arc<dyn ChannelHandle>),
    Channel {
        channel: ChannelId,
        event: ChannelEvent,
    },
}

impl std::fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerEvent::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            PeerEvent::GatheringComplete => f.write_str("GatheringComplete"),
            PeerEvent::ConnectivityChanged(s) => {
                f.debug_tuple("ConnectivityChanged").field(s).finish()
            }
            PeerEvent::RemoteTrack(t) => f.debug_tuple("RemoteTrack").field(t).finish(),
            PeerEvent::ChannelOffered(ch) => f
                .debug_struct("ChannelOffered")
                .field("id", &ch.id())
                .field("label", &ch.label())
                .finish(),
            PeerEvent::Channel { channel, event } => f
                .debug_struct("Channel")
                .field("channel", channel)
                .field("event", event)
                .finish(),
        }
    }
}

/// Sender handed to the engine when a peer is created. Every event it
/// forwards carries that peer's epoch.
#[derive(Clone, Debug)]
pub struct PeerEventTx {
    epoch: Epoch,
    tx: mpsc::UnboundedSender<(Epoch, PeerEvent)>,
}

impl PeerEventTx {
    pub fn new(epoch: Epoch, tx: mpsc::UnboundedSender<(Epoch, PeerEvent)>) -> Self {
        Self { epoch, tx }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Fails silently once the controller is gone.
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.tx.send((self.epoch, event));
    }
}

#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(
        &self,
        role: Role,
        events: PeerEventTx,
    ) -> Result<Arc<dyn PeerHandle>, NegotiationError>;
}

/// One connectivity handle. Owned by exactly one session, closed once.
#[async_trait]
pub trait PeerHandle: Send + Sync {
    async fn add_local_stream(&self, stream: &LocalStream) -> Result<(), NegotiationError>;

    async fn create_description(
        &self,
        kind: SdpKind,
    ) -> Result<SessionDescription, NegotiationError>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn local_description(&self) -> Option<SessionDescription>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn has_remote_description(&self) -> bool;

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn ChannelHandle>, NegotiationError>;

    async fn close(&self) -> Result<(), NegotiationError>;
}

#[async_trait]
pub trait ChannelHandle: Send + Sync {
    fn id(&self) -> ChannelId;

    fn label(&self) -> String;

    async fn send_text(&self, text: String) -> Result<(), NegotiationError>;

    async fn close(&self);
}
