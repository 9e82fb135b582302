//! Relay wire format: one JSON object per frame. Fields are independent
//! and optional; unknown fields are ignored.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TransportError;
use crate::peer::types::{IceCandidate, SdpKind, SessionDescription};
use crate::utils::is_truthy;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub local: String,
    pub remote: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Signal {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open: Option<Registration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pong: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ice: Option<IceCandidate>,
    /// Addressing for outbound `sdp`/`ice`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
}

impl Signal {
    pub fn open(local: &str, remote: &str) -> Self {
        Self {
            open: Some(Registration {
                local: local.to_string(),
                remote: remote.to_string(),
            }),
            ..Default::default()
        }
    }

    pub fn ping() -> Self {
        Self {
            ping: Some(Value::from(1)),
            ..Default::default()
        }
    }

    pub fn pong() -> Self {
        Self {
            pong: Some(Value::from(1)),
            ..Default::default()
        }
    }

    pub fn start(role: &str) -> Self {
        Self {
            start: Some(Value::from(role)),
            ..Default::default()
        }
    }

    pub fn close() -> Self {
        Self {
            close: Some(Value::from(1)),
            ..Default::default()
        }
    }

    pub fn description(sdp: SessionDescription, remote: &str) -> Self {
        Self {
            sdp: Some(sdp),
            remote: Some(remote.to_string()),
            ..Default::default()
        }
    }

    pub fn candidate(ice: IceCandidate, remote: &str) -> Self {
        Self {
            ice: Some(ice),
            remote: Some(remote.to_string()),
            ..Default::default()
        }
    }

    pub fn encode(&self) -> Result<String, TransportError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(frame: &str) -> Result<Self, TransportError> {
        Ok(serde_json::from_str(frame)?)
    }

    pub fn is_ping(&self) -> bool {
        self.ping.as_ref().is_some_and(is_truthy)
    }

    pub fn is_pong(&self) -> bool {
        self.pong.as_ref().is_some_and(is_truthy)
    }

    pub fn is_close(&self) -> bool {
        self.close.as_ref().is_some_and(is_truthy)
    }

    /// The `start` payload when it is a non-empty directive. Non-string
    /// truthy values are rendered as JSON so they can be reported.
    pub fn start_role(&self) -> Option<String> {
        match self.start.as_ref()? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            v if is_truthy(v) => Some(v.to_string()),
            _ => None,
        }
    }

    pub fn offer(&self) -> Option<&SessionDescription> {
        self.sdp.as_ref().filter(|d| d.kind == SdpKind::Offer)
    }

    /// Carries anything beyond keepalive.
    pub fn has_payload(&self) -> bool {
        self.open.is_some()
            || self.start.is_some()
            || self.close.is_some()
            || self.is_negotiation()
    }

    /// Carries something for the negotiation state machine.
    pub fn is_negotiation(&self) -> bool {
        self.sdp.is_some() || self.ice.is_some()
    }
}
