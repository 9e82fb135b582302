use std::collections::VecDeque;

use tracing::{info, warn};

use crate::peer::types::IceCandidate;
use crate::signaling::protocol::Signal;

/// Inbound messages held back until a remote description exists. Whole
/// messages are kept, not just their candidates, so a drained message is
/// re-processed exactly as it arrived.
#[derive(Debug, Default)]
pub struct CandidateQueue {
    pending: VecDeque<Signal>,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: Signal) {
        self.pending.push_back(message);
    }

    /// Oldest deferred message.
    pub fn pop(&mut self) -> Option<Signal> {
        self.pending.pop_front()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Counts of locally gathered candidates by type.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateStats {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
    pub other: usize,
}

impl CandidateStats {
    pub fn record(&mut self, candidate: &IceCandidate) {
        match candidate.kind() {
            Some("host") => self.host += 1,
            Some("srflx") => self.srflx += 1,
            Some("relay") => self.relay += 1,
            _ => self.other += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.host + self.srflx + self.relay + self.other
    }

    pub fn log_summary(&self) {
        info!(
            target = "peer",
            host = self.host,
            srflx = self.srflx,
            relay = self.relay,
            "candidate gathering complete"
        );
        if self.relay == 0 {
            warn!(
                target = "peer",
                "no TURN relay candidates gathered; connection through NAT may fail"
            );
        }
    }
}
