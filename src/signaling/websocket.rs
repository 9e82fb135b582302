use async_trait::async_trait;
use futures::future;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::TransportError;
use crate::signaling::transport::{Connector, WireChannel};

/// Connects to the relay over WebSocket; one text message per frame.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: Url,
}

impl WebSocketConnector {
    pub fn new(url: Url) -> Self {
        Self { url }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<WireChannel, TransportError> {
        debug!(target = "signaling", url = %self.url, "connecting to relay");
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        let (write, read) = ws_stream.split();

        let sink = write
            .sink_map_err(|err| TransportError::Send(err.to_string()))
            .with(|frame: String| future::ready(Ok::<_, TransportError>(Message::Text(frame))));

        let stream = read.filter_map(|msg| future::ready(frame_text(msg)));

        Ok(WireChannel {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

/// Maps one WebSocket message onto a relay frame. `None` skips it.
fn frame_text(msg: Result<Message, WsError>) -> Option<Result<String, TransportError>> {
    match msg {
        Ok(Message::Text(text)) => Some(Ok(text)),
        Ok(Message::Binary(data)) => match String::from_utf8(data) {
            Ok(text) => Some(Ok(text)),
            Err(err) => {
                warn!(target = "signaling", "ignoring non-UTF-8 binary frame: {err}");
                None
            }
        },
        Ok(Message::Close(frame)) => {
            trace!(target = "signaling", ?frame, "relay sent close");
            Some(Err(TransportError::Closed))
        }
        // tungstenite answers pings itself
        Ok(_) => None,
        Err(err) => Some(Err(TransportError::Receive(err.to_string()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_frames_are_decoded_or_skipped() {
        let text = frame_text(Ok(Message::Binary(br#"{"close":1}"#.to_vec())));
        assert_eq!(text.unwrap().unwrap(), r#"{"close":1}"#);
        assert!(frame_text(Ok(Message::Binary(vec![0xff, 0xfe]))).is_none());
    }

    #[test]
    fn close_frame_ends_the_channel() {
        assert!(matches!(
            frame_text(Ok(Message::Close(None))),
            Some(Err(TransportError::Closed))
        ));
    }

    #[tokio::test]
    async fn unreachable_relay_is_a_connect_error() {
        // nothing listens on port 9 of the loopback
        let connector = WebSocketConnector::new(Url::parse("ws://127.0.0.1:9/").unwrap());
        assert!(matches!(
            connector.connect().await,
            Err(TransportError::Connect(_))
        ));
    }
}
