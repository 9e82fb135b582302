//! The reactor that owns the transport and the session controller.
//!
//! Relay frames, engine callbacks and operator commands all arrive on
//! channels and are handled one at a time on a single task, so no state
//! here is shared or locked.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, PeerIds};
use crate::error::Error;
use crate::logger::EventSink;
use crate::media::{MediaSink, MediaSource};
use crate::peer::engine::PeerFactory;
use crate::session::Lifecycle;
use crate::signaling::transport::{Connector, SignalTransport};

#[derive(Debug)]
enum Command {
    SendMessage(String),
    Shutdown,
}

/// Cloneable control surface for a running [`Client`].
#[derive(Clone, Debug)]
pub struct ClientHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl ClientHandle {
    /// Queues a data channel message. Returns false once the client has
    /// stopped; a queued message is still dropped if no channel is open.
    pub fn send_message(&self, text: impl Into<String>) -> bool {
        self.tx.send(Command::SendMessage(text.into())).is_ok()
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }
}

pub struct Client {
    ids: PeerIds,
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    factory: Arc<dyn PeerFactory>,
    source: Box<dyn MediaSource>,
    sink: Box<dyn MediaSink>,
    events: EventSink,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl Client {
    pub fn new(
        ids: PeerIds,
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        factory: Arc<dyn PeerFactory>,
        source: Box<dyn MediaSource>,
        sink: Box<dyn MediaSink>,
        events: EventSink,
    ) -> (Self, ClientHandle) {
        let (tx, commands) = mpsc::unbounded_channel();
        (
            Self {
                ids,
                config,
                connector,
                factory,
                source,
                sink,
                events,
                commands,
            },
            ClientHandle { tx },
        )
    }

    /// Acquires local media, connects to the relay and serves events until
    /// shut down. A device error ends the run before any connection is
    /// attempted.
    pub async fn run(self) -> Result<(), Error> {
        let Client {
            ids,
            config,
            connector,
            factory,
            mut source,
            sink,
            events,
            mut commands,
        } = self;
        config.validate()?;

        let (mut lifecycle, mut peer_rx) =
            Lifecycle::new(factory, sink, events.clone(), ids.remote(), &config);

        let stream = match source.acquire(&config.constraints).await {
            Ok(stream) => stream,
            Err(err) => {
                events.emit_device_error(&err);
                return Err(err.into());
            }
        };
        if let Some(previous) = lifecycle.replace_local_stream(Some(stream)) {
            source.stop(previous);
        }

        let (mut transport, mut transport_rx) = SignalTransport::new(
            connector,
            ids.clone(),
            config.ping_interval,
            config.reconnect_delay,
        );
        transport.connect();
        info!(
            target = "session",
            local = ids.local(),
            remote = ids.remote(),
            "client running"
        );

        loop {
            tokio::select! {
                Some(event) = transport_rx.recv() => {
                    let was_open = transport.is_open();
                    if let Some(signal) = transport.handle(event) {
                        lifecycle.handle_signal(signal, &transport).await;
                    }
                    if transport.is_open() != was_open {
                        events.emit_transport(transport.is_open());
                    }
                }
                Some((epoch, event)) = peer_rx.recv() => {
                    lifecycle.handle_peer_event(epoch, event, &transport).await;
                }
                command = commands.recv() => match command {
                    Some(Command::SendMessage(text)) => {
                        if !lifecycle.send_message(&text).await {
                            warn!(target = "session", "message not sent, data channel is not open");
                        }
                    }
                    Some(Command::Shutdown) | None => {
                        debug!(target = "session", "shutdown requested");
                        break;
                    }
                },
            }
        }

        lifecycle.close().await;
        transport.shutdown();
        if let Some(stream) = lifecycle.replace_local_stream(None) {
            source.stop(stream);
        }
        info!(target = "session", "client stopped");
        Ok(())
    }
}
