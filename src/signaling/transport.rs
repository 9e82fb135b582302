//! Reconnecting relay channel.
//!
//! Each connection attempt gets a new generation and runs in its own task
//! together with its ping timer, so the timer dies with the channel. The
//! owner feeds every [`TransportEvent`] back through
//! [`SignalTransport::handle`], which drops events from superseded
//! generations and schedules at most one reconnect per closed channel.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::PeerIds;
use crate::error::TransportError;
use crate::signaling::protocol::Signal;

pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// An open message-oriented duplex channel carrying text frames.
pub struct WireChannel {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<WireChannel, TransportError>;
}

/// Outgoing signaling path used by the negotiation code.
pub trait Outbound: Send + Sync {
    fn send(&self, signal: Signal);
}

#[derive(Debug)]
pub enum TransportEvent {
    Opened { generation: u64 },
    Message { generation: u64, signal: Signal },
    Closed { generation: u64 },
    ReconnectDue { generation: u64 },
}

struct ActiveChannel {
    outbound: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
}

pub struct SignalTransport {
    connector: Arc<dyn Connector>,
    ids: PeerIds,
    ping_interval: Duration,
    reconnect_delay: Duration,
    events: mpsc::UnboundedSender<TransportEvent>,
    generation: u64,
    active: Option<ActiveChannel>,
    open: bool,
    reconnect_pending: Option<u64>,
    reconnects_scheduled: u64,
    shut_down: bool,
}

impl SignalTransport {
    pub fn new(
        connector: Arc<dyn Connector>,
        ids: PeerIds,
        ping_interval: Duration,
        reconnect_delay: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                connector,
                ids,
                ping_interval,
                reconnect_delay,
                events,
                generation: 0,
                active: None,
                open: false,
                reconnect_pending: None,
                reconnects_scheduled: 0,
                shut_down: false,
            },
            rx,
        )
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn reconnects_scheduled(&self) -> u64 {
        self.reconnects_scheduled
    }

    /// Replaces whatever channel exists with a fresh one.
    pub fn connect(&mut self) {
        if let Some(previous) = self.active.take() {
            debug!(
                target = "signaling",
                generation = self.generation,
                "closing existing relay connection"
            );
            previous.task.abort();
        }
        self.generation += 1;
        self.open = false;
        self.shut_down = false;

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_channel(
            Arc::clone(&self.connector),
            self.generation,
            Signal::open(self.ids.local(), self.ids.remote()),
            self.ping_interval,
            outbound_rx,
            self.events.clone(),
        ));
        info!(
            target = "signaling",
            generation = self.generation,
            local = self.ids.local(),
            remote = self.ids.remote(),
            "starting relay connection"
        );
        self.active = Some(ActiveChannel { outbound, task });
    }

    /// Closes the current channel; the usual reconnect follows.
    pub fn close(&mut self) {
        if let Some(active) = self.active.take() {
            active.task.abort();
            let _ = self.events.send(TransportEvent::Closed {
                generation: self.generation,
            });
        }
        self.open = false;
    }

    /// Closes for good: no reconnect is scheduled afterwards.
    pub fn shutdown(&mut self) {
        self.shut_down = true;
        if let Some(active) = self.active.take() {
            active.task.abort();
        }
        self.open = false;
    }

    /// Applies a channel event. Returns inbound signals of the current
    /// generation for the caller to dispatch.
    pub fn handle(&mut self, event: TransportEvent) -> Option<Signal> {
        match event {
            TransportEvent::Opened { generation } if generation == self.generation => {
                info!(target = "signaling", generation, "relay connection opened");
                self.open = true;
                None
            }
            TransportEvent::Message { generation, signal } if generation == self.generation => {
                Some(signal)
            }
            TransportEvent::Closed { generation } if generation == self.generation => {
                self.open = false;
                self.active = None;
                if self.shut_down {
                    debug!(target = "signaling", generation, "relay closed after shutdown");
                } else if self.reconnect_pending == Some(generation) {
                    debug!(target = "signaling", generation, "reconnect already scheduled");
                } else {
                    info!(
                        target = "signaling",
                        generation,
                        delay_ms = self.reconnect_delay.as_millis() as u64,
                        "relay connection closed, reconnecting"
                    );
                    self.schedule_reconnect(generation);
                }
                None
            }
            TransportEvent::ReconnectDue { generation } => {
                if self.reconnect_pending == Some(generation) {
                    self.reconnect_pending = None;
                }
                if generation == self.generation && !self.shut_down && self.active.is_none() {
                    self.connect();
                } else {
                    debug!(
                        target = "signaling",
                        generation,
                        current = self.generation,
                        "superseded reconnect ignored"
                    );
                }
                None
            }
            stale => {
                trace!(target = "signaling", ?stale, "dropping stale transport event");
                None
            }
        }
    }

    fn schedule_reconnect(&mut self, generation: u64) {
        self.reconnect_pending = Some(generation);
        self.reconnects_scheduled += 1;
        let events = self.events.clone();
        let delay = self.reconnect_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(TransportEvent::ReconnectDue { generation });
        });
    }

    pub fn try_send(&self, signal: &Signal) -> Result<(), TransportError> {
        let active = match (&self.active, self.open) {
            (Some(active), true) => active,
            _ => return Err(TransportError::NotOpen),
        };
        let frame = signal.encode()?;
        active
            .outbound
            .send(frame)
            .map_err(|_| TransportError::Closed)
    }
}

impl Outbound for SignalTransport {
    fn send(&self, signal: Signal) {
        if let Err(err) = self.try_send(&signal) {
            warn!(target = "signaling", "dropping outbound signal: {err}");
        }
    }
}

impl Drop for SignalTransport {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.task.abort();
        }
    }
}

async fn send_signal(sink: &mut FrameSink, signal: &Signal) -> Result<(), TransportError> {
    sink.send(signal.encode()?).await
}

async fn run_channel(
    connector: Arc<dyn Connector>,
    generation: u64,
    registration: Signal,
    ping_interval: Duration,
    mut outbound: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let WireChannel {
        mut sink,
        mut stream,
    } = match connector.connect().await {
        Ok(channel) => channel,
        Err(err) => {
            warn!(target = "signaling", generation, "relay connect failed: {err}");
            let _ = events.send(TransportEvent::Closed { generation });
            return;
        }
    };

    if let Err(err) = send_signal(&mut sink, &registration).await {
        warn!(target = "signaling", generation, "relay registration failed: {err}");
        let _ = events.send(TransportEvent::Closed { generation });
        return;
    }
    let _ = events.send(TransportEvent::Opened { generation });

    let mut ticker = interval_at(Instant::now() + ping_interval, ping_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                trace!(target = "signaling", generation, "sending ping");
                if let Err(err) = send_signal(&mut sink, &Signal::ping()).await {
                    debug!(target = "signaling", generation, "ping failed: {err}");
                    break;
                }
            }
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                trace!(target = "signaling", generation, len = frame.len(), "ws_out");
                if let Err(err) = sink.send(frame).await {
                    debug!(target = "signaling", generation, "send failed: {err}");
                    break;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(text)) => match Signal::decode(&text) {
                    Ok(signal) => {
                        let ping = signal.is_ping();
                        if signal.is_pong() {
                            trace!(target = "signaling", generation, "pong received");
                        }
                        if signal.has_payload() {
                            let _ = events.send(TransportEvent::Message { generation, signal });
                        }
                        if ping {
                            trace!(target = "signaling", generation, "ping received, sending pong");
                            if let Err(err) = send_signal(&mut sink, &Signal::pong()).await {
                                debug!(target = "signaling", generation, "pong failed: {err}");
                                break;
                            }
                        }
                    }
                    Err(err) => {
                        warn!(target = "signaling", generation, "ignoring malformed frame: {err}");
                    }
                },
                Some(Err(err)) => {
                    debug!(target = "signaling", generation, "relay channel ended: {err}");
                    break;
                }
                None => {
                    debug!(target = "signaling", generation, "relay closed the channel");
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
    let _ = events.send(TransportEvent::Closed { generation });
}
