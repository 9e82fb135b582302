use std::fmt;

use serde::{Deserialize, Serialize};

/// Session description in the browser wire shape: `{"type": .., "sdp": ..}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn new(kind: SdpKind, sdp: impl Into<String>) -> Self {
        Self {
            kind,
            sdp: sdp.into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    /// Any type we do not negotiate with (`pranswer`, `rollback`, ...).
    #[serde(other)]
    Unknown,
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
            SdpKind::Unknown => "unknown",
        })
    }
}

/// ICE candidate in the browser `RTCIceCandidate.toJSON()` shape
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    /// `typ` field of the candidate line, e.g. `host`, `srflx`, `relay`.
    pub fn kind(&self) -> Option<&str> {
        let mut parts = self.candidate.split_whitespace();
        parts.find(|p| *p == "typ")?;
        parts.next()
    }
}

/// STUN/TURN server entry
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub id: String,
    pub r#type: String, // 'stun' or 'turn'
    pub url: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        })
    }
}

/// Track announced by the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub kind: MediaKind,
    pub track_id: String,
    /// `None` when the track arrived without an owning stream.
    pub stream_id: Option<String>,
}

impl RemoteTrack {
    /// Stream the track renders into; a bare track gets a stream of its own.
    pub fn stream_key(&self) -> &str {
        self.stream_id.as_deref().unwrap_or(&self.track_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_uses_browser_field_names() {
        let raw = r#"{"candidate":"candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host","sdpMid":"0","sdpMLineIndex":0,"usernameFragment":null}"#;
        let cand: IceCandidate = serde_json::from_str(raw).unwrap();
        assert_eq!(cand.sdp_mid.as_deref(), Some("0"));
        assert_eq!(cand.sdp_mline_index, Some(0));
        assert_eq!(cand.username_fragment, None);
        assert_eq!(cand.kind(), Some("host"));

        let back = serde_json::to_value(&cand).unwrap();
        assert_eq!(back["sdpMLineIndex"], 0);
        assert!(back.get("usernameFragment").is_none());
    }

    #[test]
    fn unknown_description_type_still_parses() {
        let desc: SessionDescription =
            serde_json::from_str(r#"{"type":"pranswer","sdp":"v=0"}"#).unwrap();
        assert_eq!(desc.kind, SdpKind::Unknown);
    }

    #[test]
    fn bare_remote_track_keys_on_its_own_id() {
        let track = RemoteTrack {
            kind: MediaKind::Video,
            track_id: "t1".into(),
            stream_id: None,
        };
        assert_eq!(track.stream_key(), "t1");
    }
}
