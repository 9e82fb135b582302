//! Platform media collaborators: local capture and remote rendering.
//!
//! Neither side encodes or decodes anything. A [`LocalStream`] only
//! describes the tracks the peer connection should send; a [`MediaSink`]
//! is told which remote tracks to render and when to stop.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::DeviceError;
use crate::peer::types::{MediaKind, RemoteTrack};
use crate::utils::random_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub kind: MediaKind,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalStream {
    pub id: String,
    pub tracks: Vec<LocalTrack>,
}

/// Camera/microphone access.
#[async_trait]
pub trait MediaSource: Send {
    async fn acquire(&mut self, constraints: &MediaConstraints) -> Result<LocalStream, DeviceError>;

    /// Stops every track of a stream acquired earlier.
    fn stop(&mut self, stream: LocalStream);
}

/// Renders remote media.
pub trait MediaSink: Send + Sync {
    fn attach(&mut self, track: &RemoteTrack);

    /// Stops every attached track, returns how many were released.
    fn release(&mut self) -> usize;
}

/// Source that hands out track descriptors without touching a device.
/// Samples for these tracks are produced elsewhere.
#[derive(Debug, Default)]
pub struct SyntheticSource {
    active: Option<String>,
}

#[async_trait]
impl MediaSource for SyntheticSource {
    async fn acquire(&mut self, constraints: &MediaConstraints) -> Result<LocalStream, DeviceError> {
        if !constraints.audio && !constraints.video {
            return Err(DeviceError::NoTracksRequested);
        }
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(LocalTrack {
                kind: MediaKind::Audio,
                id: format!("audio-{}", random_id()),
            });
        }
        if constraints.video {
            tracks.push(LocalTrack {
                kind: MediaKind::Video,
                id: format!("video-{}", random_id()),
            });
        }
        let stream = LocalStream {
            id: random_id(),
            tracks,
        };
        info!(
            target = "media",
            stream = %stream.id,
            tracks = stream.tracks.len(),
            "local media obtained"
        );
        self.active = Some(stream.id.clone());
        Ok(stream)
    }

    fn stop(&mut self, stream: LocalStream) {
        debug!(target = "media", stream = %stream.id, "local stream stopped");
        if self.active.as_deref() == Some(stream.id.as_str()) {
            self.active = None;
        }
    }
}

/// Sink that only logs, grouping tracks by stream.
#[derive(Debug, Default)]
pub struct LoggingSink {
    streams: BTreeMap<String, Vec<RemoteTrack>>,
}

impl MediaSink for LoggingSink {
    fn attach(&mut self, track: &RemoteTrack) {
        info!(
            target = "media",
            kind = %track.kind,
            track = %track.track_id,
            stream = %track.stream_key(),
            "remote track attached"
        );
        self.streams
            .entry(track.stream_key().to_string())
            .or_default()
            .push(track.clone());
    }

    fn release(&mut self) -> usize {
        let released: usize = self.streams.values().map(Vec::len).sum();
        self.streams.clear();
        if released > 0 {
            info!(target = "media", released, "remote media stopped");
        }
        released
    }
}
