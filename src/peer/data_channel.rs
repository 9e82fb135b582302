use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;

use crate::error::NegotiationError;
use crate::peer::engine::{ChannelEvent, ChannelHandle, ChannelId, PeerEvent, PeerEventTx};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

/// The session's single auxiliary channel, as seen by the controller.
pub struct AuxChannel {
    handle: Arc<dyn ChannelHandle>,
    state: ChannelState,
    last_error: Option<String>,
}

impl AuxChannel {
    pub fn new(handle: Arc<dyn ChannelHandle>) -> Self {
        Self {
            handle,
            state: ChannelState::Connecting,
            last_error: None,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.handle.id()
    }

    pub fn label(&self) -> String {
        self.handle.label()
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Applies a channel event, returning the new state if it changed.
    /// Errors are recorded but never move the state.
    pub fn observe(&mut self, event: &ChannelEvent) -> Option<ChannelState> {
        let next = match (self.state, event) {
            (ChannelState::Connecting, ChannelEvent::Open) => ChannelState::Open,
            (ChannelState::Closed, _) => return None,
            (_, ChannelEvent::Closed) => ChannelState::Closed,
            (_, ChannelEvent::Error(err)) => {
                self.last_error = Some(err.clone());
                return None;
            }
            _ => return None,
        };
        self.state = next;
        Some(next)
    }

    /// Sends only while open; anything else is dropped. Returns whether the
    /// payload went out.
    pub async fn send(&self, payload: &str) -> bool {
        if self.state != ChannelState::Open {
            debug!(
                target = "peer",
                channel = self.id(),
                state = ?self.state,
                "data channel is not open, dropping message"
            );
            return false;
        }
        match self.handle.send_text(payload.to_string()).await {
            Ok(()) => {
                debug!(target = "peer", channel = self.id(), len = payload.len(), "sent message");
                true
            }
            Err(err) => {
                warn!(target = "peer", channel = self.id(), "data channel send failed: {err}");
                false
            }
        }
    }

    pub async fn close(self) {
        self.handle.close().await;
    }
}

/// webrtc-rs data channel.
pub struct RtcChannel {
    id: ChannelId,
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl ChannelHandle for RtcChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn label(&self) -> String {
        self.dc.label().to_string()
    }

    async fn send_text(&self, text: String) -> Result<(), NegotiationError> {
        self.dc
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(|e| NegotiationError::DataChannel(e.to_string()))
    }

    async fn close(&self) {
        if let Err(err) = self.dc.close().await {
            debug!(target = "peer", channel = self.id, "data channel close failed: {err}");
        }
    }
}

/// Routes the channel's callbacks into the peer event stream.
pub fn attach_dc(dc: &Arc<RTCDataChannel>, id: ChannelId, events: &PeerEventTx) -> Arc<RtcChannel> {
    info!(
        target = "peer",
        channel = id,
        label = dc.label(),
        epoch = events.epoch(),
        "attaching data channel"
    );

    dc.on_open(Box::new({
        let events = events.clone();
        move || {
            events.emit(PeerEvent::Channel {
                channel: id,
                event: ChannelEvent::Open,
            });
            Box::pin(async {})
        }
    }));

    dc.on_close(Box::new({
        let events = events.clone();
        move || {
            events.emit(PeerEvent::Channel {
                channel: id,
                event: ChannelEvent::Closed,
            });
            Box::pin(async {})
        }
    }));

    dc.on_error(Box::new({
        let events = events.clone();
        move |err| {
            events.emit(PeerEvent::Channel {
                channel: id,
                event: ChannelEvent::Error(err.to_string()),
            });
            Box::pin(async {})
        }
    }));

    dc.on_message(Box::new({
        let events = events.clone();
        move |msg: DataChannelMessage| {
            let text = String::from_utf8_lossy(&msg.data).into_owned();
            events.emit(PeerEvent::Channel {
                channel: id,
                event: ChannelEvent::Message(text),
            });
            Box::pin(async {})
        }
    }));

    Arc::new(RtcChannel {
        id,
        dc: Arc::clone(dc),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeChannel;

    fn channel() -> (AuxChannel, Arc<FakeChannel>) {
        let fake = Arc::new(FakeChannel::new(1, "chat"));
        (AuxChannel::new(fake.clone()), fake)
    }

    #[tokio::test]
    async fn send_before_open_never_transmits() {
        let (aux, fake) = channel();
        assert_eq!(aux.state(), ChannelState::Connecting);
        assert!(!aux.send("early").await);
        assert!(fake.sent().is_empty());
    }

    #[tokio::test]
    async fn send_while_open_transmits() {
        let (mut aux, fake) = channel();
        assert_eq!(aux.observe(&ChannelEvent::Open), Some(ChannelState::Open));
        assert!(aux.send("hello").await);
        assert_eq!(fake.sent(), vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn send_after_close_is_dropped() {
        let (mut aux, fake) = channel();
        aux.observe(&ChannelEvent::Open);
        assert_eq!(aux.observe(&ChannelEvent::Closed), Some(ChannelState::Closed));
        assert!(!aux.send("late").await);
        assert!(fake.sent().is_empty());
    }

    #[test]
    fn error_does_not_transition() {
        let (mut aux, _) = channel();
        aux.observe(&ChannelEvent::Open);
        assert_eq!(aux.observe(&ChannelEvent::Error("sctp".into())), None);
        assert_eq!(aux.state(), ChannelState::Open);
        assert_eq!(aux.last_error(), Some("sctp"));
    }

    #[test]
    fn closed_is_terminal() {
        let (mut aux, _) = channel();
        aux.observe(&ChannelEvent::Closed);
        assert_eq!(aux.observe(&ChannelEvent::Open), None);
        assert_eq!(aux.state(), ChannelState::Closed);
    }
}
