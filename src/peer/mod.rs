pub mod connection;
pub mod data_channel;
pub mod engine;
pub mod ice;
pub mod types;

pub use connection::RtcPeerFactory;
pub use data_channel::{AuxChannel, ChannelState};
pub use engine::{
    ChannelEvent, ChannelHandle, ConnectivityState, Epoch, PeerEvent, PeerEventTx, PeerFactory,
    PeerHandle, Role,
};
pub use types::{IceCandidate, RemoteTrack, SdpKind, ServerConfig, SessionDescription};
