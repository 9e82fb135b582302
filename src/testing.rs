//! In-memory stand-ins for the relay, the peer engine and the media sink.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::error::{NegotiationError, TransportError};
use crate::media::{LocalStream, MediaSink};
use crate::peer::engine::{
    ChannelHandle, ChannelId, Epoch, PeerEvent, PeerEventTx, PeerFactory, PeerHandle, Role,
};
use crate::peer::types::{IceCandidate, RemoteTrack, SdpKind, SessionDescription};
use crate::signaling::protocol::Signal;
use crate::signaling::transport::{Connector, Outbound, WireChannel};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Every engine call a [`FakePeer`] received, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCall {
    AddStream(String),
    CreateDescription(SdpKind),
    SetLocal(SdpKind),
    SetRemote(SdpKind),
    AddCandidate(String),
    CreateChannel(String),
    Close,
}

/// Engine call that should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    CreateDescription,
    SetLocal,
    SetRemote,
    AddCandidate,
}

#[derive(Default)]
struct FakePeerState {
    calls: Vec<PeerCall>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    fail: Option<FailPoint>,
    channels: Vec<Arc<FakeChannel>>,
}

/// Scripted peer that records calls instead of negotiating.
pub struct FakePeer {
    role: Role,
    events: PeerEventTx,
    state: Mutex<FakePeerState>,
}

impl FakePeer {
    pub fn new(role: Role, events: PeerEventTx) -> Arc<Self> {
        Arc::new(Self {
            role,
            events,
            state: Mutex::new(FakePeerState::default()),
        })
    }

    /// A peer whose events go nowhere.
    pub fn detached(role: Role) -> Arc<Self> {
        let (tx, _) = mpsc::unbounded_channel();
        Self::new(role, PeerEventTx::new(0, tx))
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn epoch(&self) -> Epoch {
        self.events.epoch()
    }

    pub fn calls(&self) -> Vec<PeerCall> {
        lock(&self.state).calls.clone()
    }

    pub fn close_count(&self) -> usize {
        lock(&self.state)
            .calls
            .iter()
            .filter(|c| **c == PeerCall::Close)
            .count()
    }

    pub fn channels(&self) -> Vec<Arc<FakeChannel>> {
        lock(&self.state).channels.clone()
    }

    pub fn fail_on(&self, point: FailPoint) {
        lock(&self.state).fail = Some(point);
    }

    /// Emits an engine callback as this peer.
    pub fn emit(&self, event: PeerEvent) {
        self.events.emit(event);
    }

    fn record(&self, call: PeerCall, point: FailPoint) -> bool {
        let mut state = lock(&self.state);
        state.calls.push(call);
        state.fail == Some(point)
    }
}

#[async_trait]
impl PeerHandle for FakePeer {
    async fn add_local_stream(&self, stream: &LocalStream) -> Result<(), NegotiationError> {
        lock(&self.state)
            .calls
            .push(PeerCall::AddStream(stream.id.clone()));
        Ok(())
    }

    async fn create_description(
        &self,
        kind: SdpKind,
    ) -> Result<SessionDescription, NegotiationError> {
        if self.record(PeerCall::CreateDescription(kind), FailPoint::CreateDescription) {
            return Err(NegotiationError::CreateDescription(kind, "injected".into()));
        }
        Ok(SessionDescription::new(
            kind,
            format!("v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=fake-{kind}\r\n", self.epoch()),
        ))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        if self.record(PeerCall::SetLocal(description.kind), FailPoint::SetLocal) {
            return Err(NegotiationError::LocalDescription("injected".into()));
        }
        lock(&self.state).local = Some(description);
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        lock(&self.state).local.clone()
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        if self.record(PeerCall::SetRemote(description.kind), FailPoint::SetRemote) {
            return Err(NegotiationError::RemoteDescription("injected".into()));
        }
        lock(&self.state).remote = Some(description);
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        lock(&self.state).remote.is_some()
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        if self.record(PeerCall::AddCandidate(candidate.candidate), FailPoint::AddCandidate) {
            return Err(NegotiationError::Candidate("injected".into()));
        }
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn ChannelHandle>, NegotiationError> {
        let mut state = lock(&self.state);
        state.calls.push(PeerCall::CreateChannel(label.to_string()));
        let channel = Arc::new(FakeChannel::new(state.channels.len() as ChannelId + 1, label));
        state.channels.push(Arc::clone(&channel));
        Ok(channel)
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        lock(&self.state).calls.push(PeerCall::Close);
        Ok(())
    }
}

/// Hands out [`FakePeer`]s and keeps them for inspection.
#[derive(Default)]
pub struct FakePeerFactory {
    peers: Mutex<Vec<Arc<FakePeer>>>,
    fail: Mutex<Option<FailPoint>>,
    refuse: AtomicBool,
}

impl FakePeerFactory {
    pub fn peers(&self) -> Vec<Arc<FakePeer>> {
        lock(&self.peers).clone()
    }

    pub fn latest(&self) -> Option<Arc<FakePeer>> {
        lock(&self.peers).last().cloned()
    }

    /// Peers created from now on fail at `point`.
    pub fn fail_new_peers_on(&self, point: FailPoint) {
        *lock(&self.fail) = Some(point);
    }

    /// Makes every later `create` fail.
    pub fn refuse_peers(&self) {
        self.refuse.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl PeerFactory for FakePeerFactory {
    async fn create(
        &self,
        role: Role,
        events: PeerEventTx,
    ) -> Result<Arc<dyn PeerHandle>, NegotiationError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(NegotiationError::Setup("injected".into()));
        }
        let peer = FakePeer::new(role, events);
        if let Some(point) = *lock(&self.fail) {
            peer.fail_on(point);
        }
        lock(&self.peers).push(Arc::clone(&peer));
        Ok(peer)
    }
}

/// Data channel that records what was sent.
pub struct FakeChannel {
    id: ChannelId,
    label: String,
    sent: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl FakeChannel {
    pub fn new(id: ChannelId, label: &str) -> Self {
        Self {
            id,
            label: label.to_string(),
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn sent(&self) -> Vec<String> {
        lock(&self.sent).clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelHandle for FakeChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn label(&self) -> String {
        self.label.clone()
    }

    async fn send_text(&self, text: String) -> Result<(), NegotiationError> {
        lock(&self.sent).push(text);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Collects outbound signals instead of transmitting them.
#[derive(Default)]
pub struct RecordingOutbound {
    sent: Mutex<Vec<Signal>>,
}

impl RecordingOutbound {
    pub fn sent(&self) -> Vec<Signal> {
        lock(&self.sent).clone()
    }
}

impl Outbound for RecordingOutbound {
    fn send(&self, signal: Signal) {
        lock(&self.sent).push(signal);
    }
}

#[derive(Default)]
struct SinkState {
    attached: Vec<RemoteTrack>,
    releases: usize,
}

/// Media sink whose clones share state, so a test can keep one while the
/// lifecycle owns another.
#[derive(Clone, Default)]
pub struct RecordingSink {
    state: Arc<Mutex<SinkState>>,
}

impl RecordingSink {
    pub fn attached(&self) -> Vec<RemoteTrack> {
        lock(&self.state).attached.clone()
    }

    pub fn releases(&self) -> usize {
        lock(&self.state).releases
    }
}

impl MediaSink for RecordingSink {
    fn attach(&mut self, track: &RemoteTrack) {
        lock(&self.state).attached.push(track.clone());
    }

    fn release(&mut self) -> usize {
        let mut state = lock(&self.state);
        state.releases += 1;
        let released = state.attached.len();
        state.attached.clear();
        released
    }
}

/// Relay side of one in-memory connection.
pub struct RelayConnection {
    from_client: fmpsc::UnboundedReceiver<String>,
    to_client: fmpsc::UnboundedSender<String>,
}

impl RelayConnection {
    /// Next frame from the client, decoded. `None` once the client is gone.
    pub async fn recv(&mut self) -> Option<Signal> {
        let frame = self.from_client.next().await?;
        Signal::decode(&frame).ok()
    }

    pub fn send(&self, signal: &Signal) {
        if let Ok(frame) = signal.encode() {
            self.send_raw(frame);
        }
    }

    pub fn send_raw(&self, frame: impl Into<String>) {
        let _ = self.to_client.unbounded_send(frame.into());
    }
}

/// Accepts the connections a [`MemoryConnector`] opens.
pub struct RelayAcceptor {
    incoming: fmpsc::UnboundedReceiver<RelayConnection>,
}

impl RelayAcceptor {
    pub async fn accept(&mut self) -> Option<RelayConnection> {
        self.incoming.next().await
    }
}

/// Connector backed by in-process channels.
#[derive(Clone)]
pub struct MemoryConnector {
    incoming: fmpsc::UnboundedSender<RelayConnection>,
    attempts: Arc<AtomicUsize>,
    refuse: Arc<AtomicUsize>,
}

impl MemoryConnector {
    pub fn new() -> (Self, RelayAcceptor) {
        let (incoming, rx) = fmpsc::unbounded();
        (
            Self {
                incoming,
                attempts: Arc::new(AtomicUsize::new(0)),
                refuse: Arc::new(AtomicUsize::new(0)),
            },
            RelayAcceptor { incoming: rx },
        )
    }

    /// Number of connect calls so far, failed ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Fails the next `count` connect calls.
    pub fn refuse_next(&self, count: usize) {
        self.refuse.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<WireChannel, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::Connect("connection refused".into()));
        }

        let (client_tx, from_client) = fmpsc::unbounded::<String>();
        let (to_client, client_rx) = fmpsc::unbounded::<String>();
        self.incoming
            .unbounded_send(RelayConnection {
                from_client,
                to_client,
            })
            .map_err(|_| TransportError::Connect("relay is gone".into()))?;

        Ok(WireChannel {
            sink: Box::pin(client_tx.sink_map_err(|err| TransportError::Send(err.to_string()))),
            stream: Box::pin(client_rx.map(Ok::<_, TransportError>)),
        })
    }
}
