//! Relay-signaled WebRTC call client.
//!
//! The client registers with a relay server over WebSocket, waits for a
//! `start` directive and then runs an offer/answer exchange with trickle
//! ICE against the remote peer. Media and rendering stay behind the
//! [`media`] traits; the connectivity engine stays behind the
//! [`peer::engine`] traits.

pub mod client;
pub mod config;
pub mod error;
pub mod logger;
pub mod media;
pub mod negotiation;
pub mod peer;
pub mod session;
pub mod signaling;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod utils;

pub use client::{Client, ClientHandle};
pub use config::{ClientConfig, PeerIds};
pub use error::{Error, Result};
pub use logger::{ClientEvent, EventSink};
pub use session::CallState;
