//! Call lifecycle: which peer is current, and what state the call is in.
//!
//! A `start` directive always tears down the current session and builds a
//! fresh one under a new epoch. Peer events tagged with any other epoch
//! are dropped, so late callbacks from a torn-down peer cannot touch the
//! new one.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::config::ClientConfig;
use crate::error::NegotiationError;
use crate::logger::EventSink;
use crate::media::{LocalStream, MediaSink};
use crate::negotiation::Negotiation;
use crate::peer::data_channel::{AuxChannel, ChannelState};
use crate::peer::engine::{
    ChannelEvent, ConnectivityState, Epoch, PeerEvent, PeerEventTx, PeerFactory, Role,
};
use crate::signaling::protocol::Signal;
use crate::signaling::transport::Outbound;
use crate::utils::random_id;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CallState {
    #[default]
    Idle,
    Negotiating,
    Established,
    Closed,
}

/// One negotiation instance together with its data channel.
pub struct Session {
    epoch: Epoch,
    role: Role,
    connection_id: String,
    negotiation: Negotiation,
    channel: Option<AuxChannel>,
}

impl Session {
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn channel(&self) -> Option<&AuxChannel> {
        self.channel.as_ref()
    }

    /// Closes the data channel and the peer. Consumes the session, so a
    /// peer is never closed twice.
    async fn teardown(self) {
        info!(
            target = "session",
            epoch = self.epoch,
            connection = %self.connection_id,
            "tearing down session"
        );
        if let Some(channel) = self.channel {
            channel.close().await;
        }
        if let Err(err) = self.negotiation.peer().close().await {
            warn!(target = "session", epoch = self.epoch, "{err}");
        }
    }
}

pub struct Lifecycle {
    factory: Arc<dyn PeerFactory>,
    sink: Box<dyn MediaSink>,
    events: EventSink,
    remote_id: String,
    data_channel_label: String,
    open_data_channel: bool,
    local_stream: Option<LocalStream>,
    peer_tx: mpsc::UnboundedSender<(Epoch, PeerEvent)>,
    last_epoch: Epoch,
    state: CallState,
    session: Option<Session>,
}

impl Lifecycle {
    pub fn new(
        factory: Arc<dyn PeerFactory>,
        sink: Box<dyn MediaSink>,
        events: EventSink,
        remote_id: impl Into<String>,
        config: &ClientConfig,
    ) -> (Self, mpsc::UnboundedReceiver<(Epoch, PeerEvent)>) {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        (
            Self {
                factory,
                sink,
                events,
                remote_id: remote_id.into(),
                data_channel_label: config.data_channel_label.clone(),
                open_data_channel: config.open_data_channel,
                local_stream: None,
                peer_tx,
                last_epoch: 0,
                state: CallState::Idle,
                session: None,
            },
            peer_rx,
        )
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Installs the stream added to every future peer; returns the
    /// previous one so the caller can stop it.
    pub fn replace_local_stream(&mut self, stream: Option<LocalStream>) -> Option<LocalStream> {
        std::mem::replace(&mut self.local_stream, stream)
    }

    fn set_state(&mut self, state: CallState) {
        if self.state != state {
            self.state = state;
            self.events.emit_state(state);
        }
    }

    /// Replaces any current session with a fresh one for `role`. The
    /// initiator sends its offer before this returns.
    pub async fn start(&mut self, role: Role, out: &dyn Outbound) -> Result<(), NegotiationError> {
        if let Some(previous) = self.session.take() {
            debug!(target = "session", epoch = previous.epoch, "restarting negotiation");
            previous.teardown().await;
        }

        self.last_epoch += 1;
        let epoch = self.last_epoch;
        let connection_id = random_id();
        info!(target = "session", epoch, ?role, connection = %connection_id, "starting session");

        let created = self
            .factory
            .create(role, PeerEventTx::new(epoch, self.peer_tx.clone()))
            .await;
        let peer = match created {
            Ok(peer) => peer,
            Err(err) => {
                // any previous session is already gone
                self.set_state(CallState::Closed);
                return Err(err);
            }
        };
        self.session = Some(Session {
            epoch,
            role,
            connection_id,
            negotiation: Negotiation::new(Arc::clone(&peer), self.remote_id.clone()),
            channel: None,
        });
        self.set_state(CallState::Negotiating);

        if let Some(stream) = &self.local_stream {
            peer.add_local_stream(stream).await?;
        }

        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        if role == Role::Initiator {
            if self.open_data_channel {
                let handle = peer.create_data_channel(&self.data_channel_label).await?;
                session.channel = Some(AuxChannel::new(handle));
                self.events.emit_channel(ChannelState::Connecting);
            }
            session.negotiation.create_offer(out).await?;
        }
        Ok(())
    }

    /// Stops remote media and releases the current session.
    pub async fn close(&mut self) {
        let released = self.sink.release();
        self.events.emit_media_released(released);
        if let Some(session) = self.session.take() {
            session.teardown().await;
        }
        self.set_state(CallState::Closed);
    }

    /// Dispatches one relay message. Failures are reported to the operator,
    /// never returned.
    pub async fn handle_signal(&mut self, signal: Signal, out: &dyn Outbound) {
        if let Some(start) = signal.start_role() {
            match Role::from_start(&start) {
                Some(role) => {
                    if let Err(err) = self.start(role, out).await {
                        self.events.emit_signaling_error(&err);
                    }
                }
                None => warn!(target = "session", role = %start, "ignoring unknown start role"),
            }
        }

        if signal.is_close() {
            info!(target = "session", "remote peer closed the session");
            self.close().await;
        }

        if signal.is_negotiation() {
            self.negotiate(signal, out).await;
        }
    }

    async fn negotiate(&mut self, signal: Signal, out: &dyn Outbound) {
        if self.session.is_none() {
            if signal.offer().is_none() {
                warn!(target = "session", "no active session, dropping negotiation message");
                return;
            }
            info!(target = "session", "offer without a session, answering as responder");
            if let Err(err) = self.start(Role::Responder, out).await {
                self.events.emit_signaling_error(&err);
                return;
            }
        }

        if let Some(session) = self.session.as_mut() {
            if let Err(err) = session.negotiation.handle(signal, out).await {
                self.events.emit_signaling_error(&err);
            }
        }
    }

    /// Applies an engine callback, provided it belongs to the current
    /// session.
    pub async fn handle_peer_event(&mut self, epoch: Epoch, event: PeerEvent, out: &dyn Outbound) {
        let Some(session) = self.session.as_mut().filter(|s| s.epoch == epoch) else {
            trace!(target = "session", epoch, ?event, "dropping event from a stale peer");
            return;
        };

        match event {
            PeerEvent::LocalCandidate(candidate) => {
                session.negotiation.on_local_candidate(candidate, out);
            }
            PeerEvent::GatheringComplete => session.negotiation.on_gathering_complete(),
            PeerEvent::RemoteTrack(track) => {
                self.sink.attach(&track);
                self.events.emit_remote_track(&track);
            }
            PeerEvent::ChannelOffered(handle) => {
                if let Some(previous) = &session.channel {
                    debug!(
                        target = "session",
                        previous = previous.id(),
                        "replacing data channel reference"
                    );
                }
                info!(target = "session", channel = handle.id(), label = %handle.label(), "remote opened a data channel");
                session.channel = Some(AuxChannel::new(handle));
                self.events.emit_channel(ChannelState::Connecting);
            }
            PeerEvent::Channel { channel, event } => {
                let Some(aux) = session.channel.as_mut().filter(|c| c.id() == channel) else {
                    debug!(target = "session", channel, ?event, "event for a replaced data channel");
                    return;
                };
                match &event {
                    ChannelEvent::Message(text) => self.events.emit_message(text),
                    ChannelEvent::Error(err) => {
                        warn!(target = "session", channel, "data channel error: {err}")
                    }
                    ChannelEvent::Open | ChannelEvent::Closed => {}
                }
                if let Some(state) = aux.observe(&event) {
                    self.events.emit_channel(state);
                }
            }
            PeerEvent::ConnectivityChanged(state) => {
                self.events.emit_connectivity(state);
                match state {
                    ConnectivityState::Connected if self.state == CallState::Negotiating => {
                        self.set_state(CallState::Established);
                    }
                    ConnectivityState::Disconnected | ConnectivityState::Failed => {
                        self.close().await;
                    }
                    _ => {}
                }
            }
        }
    }

    /// Sends over the data channel if one is open.
    pub async fn send_message(&self, text: &str) -> bool {
        match self.session.as_ref().and_then(|s| s.channel.as_ref()) {
            Some(channel) => channel.send(text).await,
            None => {
                debug!(target = "session", "no data channel, dropping message");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::ClientEvent;
    use crate::peer::engine::ChannelHandle;
    use crate::peer::types::{IceCandidate, MediaKind, RemoteTrack, SdpKind, SessionDescription};
    use crate::testing::{
        FailPoint, FakeChannel, FakePeerFactory, PeerCall, RecordingOutbound, RecordingSink,
    };

    struct Fixture {
        lifecycle: Lifecycle,
        factory: Arc<FakePeerFactory>,
        sink: RecordingSink,
        out: RecordingOutbound,
        events: mpsc::UnboundedReceiver<ClientEvent>,
    }

    fn fixture(config: ClientConfig) -> Fixture {
        let factory = Arc::new(FakePeerFactory::default());
        let sink = RecordingSink::default();
        let (events, rx) = EventSink::channel();
        let (lifecycle, _peer_rx) = Lifecycle::new(
            factory.clone(),
            Box::new(sink.clone()),
            events,
            "bob",
            &config,
        );
        Fixture {
            lifecycle,
            factory,
            sink,
            out: RecordingOutbound::default(),
            events: rx,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ClientEvent>) -> Vec<ClientEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    fn offer() -> Signal {
        Signal {
            sdp: Some(SessionDescription::new(SdpKind::Offer, "v=0\r\n")),
            ..Default::default()
        }
    }

    fn track() -> RemoteTrack {
        RemoteTrack {
            kind: MediaKind::Video,
            track_id: "v1".into(),
            stream_id: Some("s1".into()),
        }
    }

    #[tokio::test]
    async fn restart_tears_down_previous_peer_once() {
        let mut f = fixture(ClientConfig::default());
        f.lifecycle.handle_signal(Signal::start("offer"), &f.out).await;
        f.lifecycle.handle_signal(Signal::start("offer"), &f.out).await;

        let peers = f.factory.peers();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].close_count(), 1);
        assert_eq!(peers[1].close_count(), 0);
        assert_eq!(f.lifecycle.state(), CallState::Negotiating);
        assert_eq!(f.lifecycle.session().map(Session::epoch), Some(2));
        assert_eq!(f.out.sent().len(), 2);
    }

    #[tokio::test]
    async fn answer_role_waits_for_the_offer() {
        let mut f = fixture(ClientConfig::default());
        f.lifecycle.handle_signal(Signal::start("answer"), &f.out).await;
        assert_eq!(f.lifecycle.session().map(Session::role), Some(Role::Responder));
        assert!(f.out.sent().is_empty());

        f.lifecycle.handle_signal(offer(), &f.out).await;
        assert_eq!(f.factory.peers().len(), 1);
        let sent = f.out.sent();
        assert_eq!(sent[0].sdp.as_ref().map(|d| d.kind), Some(SdpKind::Answer));
    }

    #[tokio::test]
    async fn unknown_start_role_is_ignored() {
        let mut f = fixture(ClientConfig::default());
        f.lifecycle.handle_signal(Signal::start("listen"), &f.out).await;
        assert!(f.factory.peers().is_empty());
        assert_eq!(f.lifecycle.state(), CallState::Idle);
    }

    #[tokio::test]
    async fn offer_without_session_starts_responder() {
        let mut f = fixture(ClientConfig::default());
        f.lifecycle.handle_signal(offer(), &f.out).await;
        assert_eq!(f.lifecycle.session().map(Session::role), Some(Role::Responder));
        assert_eq!(f.out.sent().len(), 1);
    }

    #[tokio::test]
    async fn stray_candidate_without_session_is_dropped() {
        let mut f = fixture(ClientConfig::default());
        let ice = Signal {
            ice: Some(IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 5000 typ host")),
            ..Default::default()
        };
        f.lifecycle.handle_signal(ice, &f.out).await;
        assert!(f.factory.peers().is_empty());
        assert_eq!(f.lifecycle.state(), CallState::Idle);
    }

    #[tokio::test]
    async fn local_stream_added_before_offer() {
        let mut f = fixture(ClientConfig::default());
        f.lifecycle.replace_local_stream(Some(LocalStream {
            id: "local".into(),
            tracks: Vec::new(),
        }));
        f.lifecycle.start(Role::Initiator, &f.out).await.unwrap();
        let calls = f.factory.latest().unwrap().calls();
        assert_eq!(calls[0], PeerCall::AddStream("local".into()));
        assert_eq!(calls[1], PeerCall::CreateDescription(SdpKind::Offer));
    }

    #[tokio::test]
    async fn connected_establishes_and_failure_closes() {
        let mut f = fixture(ClientConfig::default());
        f.lifecycle.start(Role::Initiator, &f.out).await.unwrap();
        f.lifecycle
            .handle_peer_event(1, PeerEvent::ConnectivityChanged(ConnectivityState::Connected), &f.out)
            .await;
        assert_eq!(f.lifecycle.state(), CallState::Established);

        f.lifecycle
            .handle_peer_event(1, PeerEvent::ConnectivityChanged(ConnectivityState::Failed), &f.out)
            .await;
        assert_eq!(f.lifecycle.state(), CallState::Closed);
        assert!(f.lifecycle.session().is_none());
        assert_eq!(f.factory.peers()[0].close_count(), 1);
    }

    #[tokio::test]
    async fn stale_peer_events_are_ignored() {
        let mut f = fixture(ClientConfig::default());
        f.lifecycle.start(Role::Initiator, &f.out).await.unwrap();
        f.lifecycle.start(Role::Initiator, &f.out).await.unwrap();
        let before = f.out.sent().len();

        let candidate = IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 5000 typ host");
        f.lifecycle
            .handle_peer_event(1, PeerEvent::LocalCandidate(candidate), &f.out)
            .await;
        f.lifecycle
            .handle_peer_event(1, PeerEvent::ConnectivityChanged(ConnectivityState::Connected), &f.out)
            .await;

        assert_eq!(f.out.sent().len(), before);
        assert_eq!(f.lifecycle.state(), CallState::Negotiating);
    }

    #[tokio::test]
    async fn close_releases_remote_media_and_peer() {
        let mut f = fixture(ClientConfig::default());
        f.lifecycle.start(Role::Initiator, &f.out).await.unwrap();
        f.lifecycle
            .handle_peer_event(1, PeerEvent::ConnectivityChanged(ConnectivityState::Connected), &f.out)
            .await;
        f.lifecycle
            .handle_peer_event(1, PeerEvent::RemoteTrack(track()), &f.out)
            .await;
        assert_eq!(f.sink.attached().len(), 1);
        drain(&mut f.events);

        f.lifecycle.handle_signal(Signal::close(), &f.out).await;
        assert!(f.sink.attached().is_empty());
        assert_eq!(f.factory.peers()[0].close_count(), 1);
        assert_eq!(
            drain(&mut f.events),
            vec![
                ClientEvent::RemoteMediaReleased(1),
                ClientEvent::State(CallState::Closed)
            ]
        );

        // re-entrant after close
        f.lifecycle.handle_signal(Signal::start("offer"), &f.out).await;
        assert_eq!(f.lifecycle.state(), CallState::Negotiating);
    }

    #[tokio::test]
    async fn initiator_opens_configured_data_channel() {
        let config = ClientConfig {
            open_data_channel: true,
            ..ClientConfig::default()
        };
        let mut f = fixture(config);
        f.lifecycle.start(Role::Initiator, &f.out).await.unwrap();
        let peer = f.factory.latest().unwrap();
        assert!(peer
            .calls()
            .contains(&PeerCall::CreateChannel("peercall-data".into())));
        assert!(!f.lifecycle.send_message("too early").await);

        let channel = peer.channels()[0].clone();
        f.lifecycle
            .handle_peer_event(
                1,
                PeerEvent::Channel {
                    channel: channel.id(),
                    event: ChannelEvent::Open,
                },
                &f.out,
            )
            .await;
        assert!(f.lifecycle.send_message("hello").await);
        assert_eq!(channel.sent(), vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn offered_channel_replaces_held_reference() {
        let mut f = fixture(ClientConfig::default());
        f.lifecycle.start(Role::Responder, &f.out).await.unwrap();
        let first = Arc::new(FakeChannel::new(10, "a"));
        let second = Arc::new(FakeChannel::new(11, "b"));
        f.lifecycle
            .handle_peer_event(1, PeerEvent::ChannelOffered(first.clone()), &f.out)
            .await;
        f.lifecycle
            .handle_peer_event(1, PeerEvent::ChannelOffered(second.clone()), &f.out)
            .await;
        drain(&mut f.events);

        for channel in [10, 11] {
            f.lifecycle
                .handle_peer_event(
                    1,
                    PeerEvent::Channel {
                        channel,
                        event: ChannelEvent::Message(format!("from {channel}")),
                    },
                    &f.out,
                )
                .await;
        }
        assert_eq!(
            drain(&mut f.events),
            vec![ClientEvent::Message("from 11".into())]
        );
        assert_eq!(f.lifecycle.session().and_then(Session::channel).map(AuxChannel::id), Some(11));
    }

    #[tokio::test]
    async fn negotiation_failure_is_surfaced() {
        let mut f = fixture(ClientConfig::default());
        f.factory.fail_new_peers_on(FailPoint::SetRemote);
        f.lifecycle.handle_signal(offer(), &f.out).await;

        let events = drain(&mut f.events);
        assert!(events
            .iter()
            .any(|e| matches!(e, ClientEvent::SignalingError(_))));
        // the session stays in place
        assert_eq!(f.lifecycle.state(), CallState::Negotiating);
        assert!(f.out.sent().is_empty());
    }

    #[tokio::test]
    async fn disconnected_closes_the_session() {
        let mut f = fixture(ClientConfig::default());
        f.lifecycle.start(Role::Responder, &f.out).await.unwrap();
        f.lifecycle
            .handle_peer_event(1, PeerEvent::ConnectivityChanged(ConnectivityState::Connected), &f.out)
            .await;
        f.lifecycle
            .handle_peer_event(
                1,
                PeerEvent::ConnectivityChanged(ConnectivityState::Disconnected),
                &f.out,
            )
            .await;
        assert_eq!(f.lifecycle.state(), CallState::Closed);
        assert!(f.lifecycle.session().is_none());
        assert_eq!(f.factory.peers()[0].close_count(), 1);
        assert_eq!(f.sink.releases(), 1);
    }

    #[tokio::test]
    async fn refused_restart_leaves_the_call_closed() {
        let mut f = fixture(ClientConfig::default());
        f.lifecycle.start(Role::Initiator, &f.out).await.unwrap();
        f.lifecycle
            .handle_peer_event(1, PeerEvent::ConnectivityChanged(ConnectivityState::Connected), &f.out)
            .await;
        assert_eq!(f.lifecycle.state(), CallState::Established);
        drain(&mut f.events);

        f.factory.refuse_peers();
        f.lifecycle.handle_signal(Signal::start("offer"), &f.out).await;
        assert_eq!(f.lifecycle.state(), CallState::Closed);
        assert!(f.lifecycle.session().is_none());
        assert_eq!(f.factory.peers()[0].close_count(), 1);

        let events = drain(&mut f.events);
        assert!(events.contains(&ClientEvent::State(CallState::Closed)));
        assert!(events
            .iter()
            .any(|e| matches!(e, ClientEvent::SignalingError(_))));
    }
}
