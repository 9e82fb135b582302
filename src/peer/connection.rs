use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::NegotiationError;
use crate::media::LocalStream;
use crate::peer::data_channel::attach_dc;
use crate::peer::engine::{
    ChannelHandle, ConnectivityState, PeerEvent, PeerEventTx, PeerFactory, PeerHandle, Role,
};
use crate::peer::types::{
    IceCandidate, MediaKind, RemoteTrack, SdpKind, ServerConfig, SessionDescription,
};
use crate::utils::add_ice_url_scheme;

/// Builds webrtc-rs peer connections with the configured ICE servers.
pub struct RtcPeerFactory {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl RtcPeerFactory {
    pub fn new(servers: &[ServerConfig]) -> Result<Self, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| NegotiationError::Setup(e.to_string()))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| NegotiationError::Setup(e.to_string()))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self {
            api,
            ice_servers: ice_servers(servers),
        })
    }

    fn rtc_config(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            bundle_policy: RTCBundlePolicy::MaxBundle,
            rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
            ..Default::default()
        }
    }
}

/// Converts user-facing server entries into webrtc-rs ICE servers.
pub fn ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create(
        &self,
        role: Role,
        events: PeerEventTx,
    ) -> Result<Arc<dyn PeerHandle>, NegotiationError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.rtc_config())
                .await
                .map_err(|e| NegotiationError::Setup(e.to_string()))?,
        );
        info!(target = "peer", epoch = events.epoch(), ?role, "peer connection created");

        let channel_ids = Arc::new(AtomicU64::new(1));
        wire_callbacks(&pc, &events, &channel_ids);

        Ok(Arc::new(RtcPeer {
            pc,
            events,
            channel_ids,
        }))
    }
}

fn wire_callbacks(pc: &Arc<RTCPeerConnection>, events: &PeerEventTx, channel_ids: &Arc<AtomicU64>) {
    pc.on_ice_candidate(Box::new({
        let events = events.clone();
        move |cand: Option<RTCIceCandidate>| {
            let events = events.clone();
            Box::pin(async move {
                match cand {
                    Some(c) => match c.to_json() {
                        Ok(init) => events.emit(PeerEvent::LocalCandidate(init.into())),
                        Err(err) => warn!(target = "peer", "unserializable local candidate: {err}"),
                    },
                    // end of gathering
                    None => events.emit(PeerEvent::GatheringComplete),
                }
            })
        }
    }));

    pc.on_ice_gathering_state_change(Box::new(move |state| {
        debug!(target = "peer", "ICE gathering state changed to: {:?}", state);
        Box::pin(async {})
    }));

    pc.on_peer_connection_state_change(Box::new({
        let events = events.clone();
        move |st: RTCPeerConnectionState| {
            debug!(target = "peer", "peer connection state changed to: {:?}", st);
            events.emit(PeerEvent::ConnectivityChanged(connectivity_state(st)));
            Box::pin(async {})
        }
    }));

    pc.on_track(Box::new({
        let events = events.clone();
        move |track, _receiver, _transceiver| {
            let kind = match track.kind() {
                RTPCodecType::Audio => Some(MediaKind::Audio),
                RTPCodecType::Video => Some(MediaKind::Video),
                _ => None,
            };
            match kind {
                Some(kind) => {
                    let stream_id = track.stream_id();
                    events.emit(PeerEvent::RemoteTrack(RemoteTrack {
                        kind,
                        track_id: track.id(),
                        stream_id: (!stream_id.is_empty()).then_some(stream_id),
                    }));
                }
                None => debug!(target = "peer", "ignoring remote track of unknown kind"),
            }
            Box::pin(async {})
        }
    }));

    pc.on_data_channel(Box::new({
        let events = events.clone();
        let channel_ids = Arc::clone(channel_ids);
        move |dc: Arc<RTCDataChannel>| {
            let id = channel_ids.fetch_add(1, Ordering::SeqCst);
            let channel = attach_dc(&dc, id, &events);
            events.emit(PeerEvent::ChannelOffered(channel));
            Box::pin(async {})
        }
    }));
}

fn connectivity_state(st: RTCPeerConnectionState) -> ConnectivityState {
    match st {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectivityState::New,
        RTCPeerConnectionState::Connecting => ConnectivityState::Connecting,
        RTCPeerConnectionState::Connected => ConnectivityState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectivityState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectivityState::Failed,
        RTCPeerConnectionState::Closed => ConnectivityState::Closed,
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(c: IceCandidate) -> Self {
        Self {
            candidate: c.candidate,
            sdp_mid: c.sdp_mid,
            sdp_mline_index: c.sdp_mline_index,
            username_fragment: c.username_fragment,
        }
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, String> {
    let parsed = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpKind::Unknown => return Err("session description type is not offer or answer".into()),
    };
    parsed.map_err(|e| e.to_string())
}

fn from_rtc(desc: RTCSessionDescription) -> SessionDescription {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        _ => SdpKind::Unknown,
    };
    SessionDescription::new(kind, desc.sdp)
}

fn codec_for(kind: MediaKind) -> RTCRtpCodecCapability {
    let mime_type = match kind {
        MediaKind::Audio => MIME_TYPE_OPUS,
        MediaKind::Video => MIME_TYPE_VP8,
    };
    RTCRtpCodecCapability {
        mime_type: mime_type.to_owned(),
        ..Default::default()
    }
}

pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    events: PeerEventTx,
    channel_ids: Arc<AtomicU64>,
}

#[async_trait]
impl PeerHandle for RtcPeer {
    async fn add_local_stream(&self, stream: &LocalStream) -> Result<(), NegotiationError> {
        for local in &stream.tracks {
            let track = Arc::new(TrackLocalStaticSample::new(
                codec_for(local.kind),
                local.id.clone(),
                stream.id.clone(),
            ));
            self.pc
                .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| NegotiationError::LocalMedia(e.to_string()))?;
            debug!(target = "peer", kind = %local.kind, track = %local.id, "local track added");
        }
        Ok(())
    }

    async fn create_description(
        &self,
        kind: SdpKind,
    ) -> Result<SessionDescription, NegotiationError> {
        let created = match kind {
            SdpKind::Offer => self.pc.create_offer(None).await,
            SdpKind::Answer => self.pc.create_answer(None).await,
            SdpKind::Unknown => {
                return Err(NegotiationError::CreateDescription(
                    kind,
                    "only offers and answers can be created".into(),
                ))
            }
        };
        created
            .map(from_rtc)
            .map_err(|e| NegotiationError::CreateDescription(kind, e.to_string()))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let desc = to_rtc(description).map_err(NegotiationError::LocalDescription)?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(|e| NegotiationError::LocalDescription(e.to_string()))
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.pc.local_description().await.map(from_rtc)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let desc = to_rtc(description).map_err(NegotiationError::RemoteDescription)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| NegotiationError::RemoteDescription(e.to_string()))
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.pc
            .add_ice_candidate(candidate.into())
            .await
            .map_err(|e| NegotiationError::Candidate(e.to_string()))
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn ChannelHandle>, NegotiationError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(|e| NegotiationError::DataChannel(e.to_string()))?;
        let id = self.channel_ids.fetch_add(1, Ordering::SeqCst);
        Ok(attach_dc(&dc, id, &self.events))
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.pc
            .close()
            .await
            .map_err(|e| NegotiationError::Close(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_description_type_is_rejected() {
        assert!(to_rtc(SessionDescription::new(SdpKind::Unknown, "v=0\r\n")).is_err());
    }

    #[test]
    fn candidate_converts_to_engine_init() {
        let mut candidate = IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 5000 typ host");
        candidate.sdp_mid = Some("0".into());
        candidate.sdp_mline_index = Some(0);
        let init = RTCIceCandidateInit::from(candidate.clone());
        assert_eq!(init.sdp_mid.as_deref(), Some("0"));
        assert_eq!(IceCandidate::from(init), candidate);
    }

    #[test]
    fn turn_servers_keep_credentials() {
        let servers = ice_servers(&[ServerConfig {
            id: "turn".into(),
            r#type: "turn".into(),
            url: "turn.example.org:3478".into(),
            username: Some("alice".into()),
            credential: Some("secret".into()),
        }]);
        assert_eq!(servers[0].urls, vec!["turn:turn.example.org:3478".to_string()]);
        assert_eq!(servers[0].username, "alice");
        assert_eq!(servers[0].credential, "secret");
    }

    #[tokio::test]
    async fn offer_from_real_engine() {
        let factory = RtcPeerFactory::new(&[]).unwrap();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let peer = factory
            .create(Role::Initiator, PeerEventTx::new(1, tx))
            .await
            .unwrap();
        peer.create_data_channel("probe").await.unwrap();
        let offer = peer.create_description(SdpKind::Offer).await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        peer.set_local_description(offer).await.unwrap();
        assert!(peer.local_description().await.is_some());
        assert!(!peer.has_remote_description().await);
        peer.close().await.unwrap();
    }
}
