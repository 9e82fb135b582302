//! Offer/answer exchange and trickle ICE for one peer.
//!
//! Inbound candidates that arrive before any remote description are held
//! back in a [`CandidateQueue`] and replayed, oldest first, once a remote
//! description has been applied. Replaying is a work-list loop over the
//! queue, so a long backlog never recurses.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::NegotiationError;
use crate::logger::dump_candidate;
use crate::peer::engine::PeerHandle;
use crate::peer::ice::{CandidateQueue, CandidateStats};
use crate::peer::types::{IceCandidate, SdpKind, SessionDescription};
use crate::signaling::protocol::Signal;
use crate::signaling::transport::Outbound;

pub struct Negotiation {
    peer: Arc<dyn PeerHandle>,
    remote_id: String,
    queue: CandidateQueue,
    stats: CandidateStats,
}

impl Negotiation {
    pub fn new(peer: Arc<dyn PeerHandle>, remote_id: impl Into<String>) -> Self {
        Self {
            peer,
            remote_id: remote_id.into(),
            queue: CandidateQueue::new(),
            stats: CandidateStats::default(),
        }
    }

    pub fn peer(&self) -> &Arc<dyn PeerHandle> {
        &self.peer
    }

    /// Number of inbound messages waiting for a remote description.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn stats(&self) -> CandidateStats {
        self.stats
    }

    /// Creates and sends the local offer.
    pub async fn create_offer(&mut self, out: &dyn Outbound) -> Result<(), NegotiationError> {
        let offer = self.peer.create_description(SdpKind::Offer).await?;
        self.send_local(offer, out).await
    }

    /// Processes one inbound `sdp`/`ice` message, then drains whatever the
    /// queue can release. A remote offer is answered once the queue has
    /// been drained. A failed candidate does not stop the drain or the
    /// answer; the first such failure is returned afterwards.
    pub async fn handle(
        &mut self,
        message: Signal,
        out: &dyn Outbound,
    ) -> Result<(), NegotiationError> {
        let mut next = Some((message, false));
        let mut answer_due = false;
        let mut candidate_error = None;

        while let Some((message, replayed)) = next.take() {
            if let Some(description) = message.sdp.clone() {
                match description.kind {
                    SdpKind::Offer => {
                        info!(target = "negotiation", "applying remote offer");
                        self.peer.set_remote_description(description).await?;
                        answer_due = true;
                    }
                    SdpKind::Answer => {
                        info!(target = "negotiation", "applying remote answer");
                        self.peer.set_remote_description(description).await?;
                    }
                    SdpKind::Unknown => {
                        warn!(target = "negotiation", "ignoring description of unknown type");
                    }
                }
            }

            if let Some(candidate) = message.ice.clone() {
                let has_remote = self.peer.has_remote_description().await;
                // older deferred candidates go first
                if has_remote && (replayed || self.queue.is_empty()) {
                    if let Err(err) = self.apply_candidate(candidate).await {
                        warn!(target = "negotiation", "{err}");
                        candidate_error.get_or_insert(err);
                    }
                } else {
                    debug!(
                        target = "negotiation",
                        queued = self.queue.len() + 1,
                        has_remote,
                        "deferring candidate"
                    );
                    self.queue.push(message);
                    if !has_remote {
                        continue;
                    }
                }
            }

            if !self.queue.is_empty() && self.peer.has_remote_description().await {
                next = self.queue.pop().map(|queued| (queued, true));
            }
        }

        if answer_due {
            let answer = self.peer.create_description(SdpKind::Answer).await?;
            self.send_local(answer, out).await?;
        }
        match candidate_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Forwards a locally gathered candidate to the remote peer.
    pub fn on_local_candidate(&mut self, candidate: IceCandidate, out: &dyn Outbound) {
        dump_candidate("LOCAL", &candidate);
        self.stats.record(&candidate);
        out.send(Signal::candidate(candidate, &self.remote_id));
    }

    pub fn on_gathering_complete(&self) {
        self.stats.log_summary();
    }

    async fn apply_candidate(&mut self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        dump_candidate("REMOTE", &candidate);
        self.peer.add_candidate(candidate).await
    }

    async fn send_local(
        &mut self,
        description: SessionDescription,
        out: &dyn Outbound,
    ) -> Result<(), NegotiationError> {
        let kind = description.kind;
        self.peer.set_local_description(description).await?;
        let local = self
            .peer
            .local_description()
            .await
            .ok_or(NegotiationError::MissingLocalDescription)?;
        info!(target = "negotiation", %kind, remote = %self.remote_id, "sending local description");
        out.send(Signal::description(local, &self.remote_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::engine::Role;
    use crate::testing::{FailPoint, FakePeer, PeerCall, RecordingOutbound};

    fn ice(n: u32) -> Signal {
        Signal {
            ice: Some(IceCandidate::new(format!(
                "candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000 typ host"
            ))),
            ..Default::default()
        }
    }

    fn sdp(kind: SdpKind) -> Signal {
        Signal {
            sdp: Some(SessionDescription::new(kind, "v=0\r\n")),
            ..Default::default()
        }
    }

    fn negotiation(role: Role) -> (Negotiation, Arc<FakePeer>, RecordingOutbound) {
        let peer = FakePeer::detached(role);
        (
            Negotiation::new(peer.clone(), "bob"),
            peer,
            RecordingOutbound::default(),
        )
    }

    fn added(peer: &FakePeer) -> Vec<String> {
        peer.calls()
            .into_iter()
            .filter_map(|call| match call {
                PeerCall::AddCandidate(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn candidates_before_description_are_queued() {
        let (mut neg, peer, out) = negotiation(Role::Responder);
        for n in 1..=3 {
            neg.handle(ice(n), &out).await.unwrap();
        }
        assert_eq!(neg.queued(), 3);
        assert!(added(&peer).is_empty());
        assert!(out.sent().is_empty());
    }

    #[tokio::test]
    async fn drain_follows_arrival_order() {
        let (mut neg, peer, out) = negotiation(Role::Initiator);
        for n in 1..=3 {
            neg.handle(ice(n), &out).await.unwrap();
        }
        neg.handle(sdp(SdpKind::Answer), &out).await.unwrap();

        assert_eq!(neg.queued(), 0);
        let order = added(&peer);
        assert_eq!(order.len(), 3);
        for (n, candidate) in (1..=3).zip(&order) {
            assert!(candidate.starts_with(&format!("candidate:{n} ")));
        }
    }

    #[tokio::test]
    async fn buffered_candidate_applied_before_answer() {
        let (mut neg, peer, out) = negotiation(Role::Responder);
        neg.handle(ice(1), &out).await.unwrap();
        neg.handle(sdp(SdpKind::Offer), &out).await.unwrap();

        let calls = peer.calls();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[0], PeerCall::SetRemote(SdpKind::Offer));
        assert!(matches!(calls[1], PeerCall::AddCandidate(_)));
        assert_eq!(calls[2], PeerCall::CreateDescription(SdpKind::Answer));
        assert_eq!(calls[3], PeerCall::SetLocal(SdpKind::Answer));

        let sent = out.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].sdp.as_ref().map(|d| d.kind), Some(SdpKind::Answer));
        assert_eq!(sent[0].remote.as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn answer_needs_no_response() {
        let (mut neg, peer, out) = negotiation(Role::Initiator);
        neg.create_offer(&out).await.unwrap();
        neg.handle(sdp(SdpKind::Answer), &out).await.unwrap();

        assert_eq!(out.sent().len(), 1);
        assert_eq!(
            peer.calls().last(),
            Some(&PeerCall::SetRemote(SdpKind::Answer))
        );
    }

    #[tokio::test]
    async fn candidate_after_description_applies_immediately() {
        let (mut neg, peer, out) = negotiation(Role::Responder);
        neg.handle(sdp(SdpKind::Offer), &out).await.unwrap();
        neg.handle(ice(9), &out).await.unwrap();
        assert_eq!(neg.queued(), 0);
        assert_eq!(added(&peer).len(), 1);
    }

    #[tokio::test]
    async fn offer_is_sent_to_the_remote() {
        let (mut neg, peer, out) = negotiation(Role::Initiator);
        neg.create_offer(&out).await.unwrap();
        assert_eq!(
            peer.calls(),
            vec![
                PeerCall::CreateDescription(SdpKind::Offer),
                PeerCall::SetLocal(SdpKind::Offer)
            ]
        );
        let sent = out.sent();
        assert_eq!(sent[0].sdp.as_ref().map(|d| d.kind), Some(SdpKind::Offer));
        assert_eq!(sent[0].remote.as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn local_candidates_are_forwarded_one_by_one() {
        let (mut neg, _peer, out) = negotiation(Role::Initiator);
        let candidate = IceCandidate::new("candidate:1 1 udp 1 1.2.3.4 5000 typ srflx");
        neg.on_local_candidate(candidate.clone(), &out);
        neg.on_local_candidate(candidate.clone(), &out);

        let sent = out.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].ice.as_ref(), Some(&candidate));
        assert_eq!(sent[0].remote.as_deref(), Some("bob"));
        assert_eq!(neg.stats().srflx, 2);
    }

    #[tokio::test]
    async fn remote_description_failure_is_surfaced() {
        let (mut neg, peer, out) = negotiation(Role::Responder);
        peer.fail_on(FailPoint::SetRemote);
        let err = neg.handle(sdp(SdpKind::Offer), &out).await.unwrap_err();
        assert!(matches!(err, NegotiationError::RemoteDescription(_)));
        assert!(out.sent().is_empty());
    }

    #[tokio::test]
    async fn failed_candidate_keeps_draining_in_order() {
        let (mut neg, peer, out) = negotiation(Role::Initiator);
        for n in 1..=3 {
            neg.handle(ice(n), &out).await.unwrap();
        }
        peer.fail_on(FailPoint::AddCandidate);

        let err = neg.handle(sdp(SdpKind::Answer), &out).await.unwrap_err();
        assert!(matches!(err, NegotiationError::Candidate(_)));
        assert_eq!(neg.queued(), 0);

        let _ = neg.handle(ice(4), &out).await;
        let order: Vec<_> = added(&peer)
            .iter()
            .map(|c| c.split_whitespace().next().unwrap_or_default().to_string())
            .collect();
        assert_eq!(
            order,
            ["candidate:1", "candidate:2", "candidate:3", "candidate:4"]
        );
    }

    #[tokio::test]
    async fn failed_candidate_still_answers_the_offer() {
        let (mut neg, peer, out) = negotiation(Role::Responder);
        neg.handle(ice(1), &out).await.unwrap();
        peer.fail_on(FailPoint::AddCandidate);

        let err = neg.handle(sdp(SdpKind::Offer), &out).await.unwrap_err();
        assert!(matches!(err, NegotiationError::Candidate(_)));
        let sent = out.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].sdp.as_ref().map(|d| d.kind), Some(SdpKind::Answer));
        assert_eq!(
            peer.calls().last(),
            Some(&PeerCall::SetLocal(SdpKind::Answer))
        );
    }

    #[tokio::test]
    async fn unknown_description_type_is_ignored() {
        let (mut neg, peer, out) = negotiation(Role::Responder);
        let signal = Signal::decode(r#"{"sdp":{"type":"pranswer","sdp":"v=0\r\n"}}"#).unwrap();
        neg.handle(signal, &out).await.unwrap();
        assert!(peer.calls().is_empty());
        assert!(out.sent().is_empty());
    }
}
