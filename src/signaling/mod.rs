//! Relay signaling: wire format, the reconnecting transport and its
//! WebSocket backend.

pub mod protocol;
pub mod transport;
pub mod websocket;

pub use protocol::{Registration, Signal};
pub use transport::{Connector, Outbound, SignalTransport, TransportEvent, WireChannel};
pub use websocket::WebSocketConnector;
