//! Local media: tracks, streams, and the capture gate that owns the
//! local stream for the duration of one call.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

#[derive(Debug)]
struct TrackState {
    enabled: AtomicBool,
    ended: AtomicBool,
}

/// A media track handle.
///
/// Clones share state: muting the track held by the capture gate mutes the
/// same track the peer connection is sending.
#[derive(Debug, Clone)]
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    label: String,
    state: Arc<TrackState>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, label: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            label: label.into(),
            state: Arc::new(TrackState {
                enabled: AtomicBool::new(true),
                ended: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_enabled(&self) -> bool {
        self.state.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.state.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Stop the track. Stopping twice is harmless.
    pub fn stop(&self) {
        self.state.ended.store(true, Ordering::SeqCst);
    }

    pub fn is_ended(&self) -> bool {
        self.state.ended.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    pub fn add_track(&mut self, track: MediaTrack) {
        if !self.tracks.iter().any(|t| t.id() == track.id()) {
            self.tracks.push(track);
        }
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Which kinds of media to request from the device.
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

#[derive(Debug, Clone, thiserror::Error)]
pub enum MediaError {
    #[error("permission to use camera/microphone was denied")]
    PermissionDenied,

    #[error("no media kinds requested")]
    NothingRequested,
}

/// Source of local device media.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(&self, constraints: MediaConstraints)
        -> Result<MediaStream, MediaError>;
}

/// Acquires and releases the local stream and carries the mute flags.
pub struct MediaCaptureGate {
    devices: Arc<dyn MediaDevices>,
    constraints: MediaConstraints,
    stream: Option<MediaStream>,
    audio_enabled: bool,
    video_enabled: bool,
}

impl MediaCaptureGate {
    pub fn new(devices: Arc<dyn MediaDevices>, constraints: MediaConstraints) -> Self {
        Self {
            devices,
            constraints,
            stream: None,
            audio_enabled: true,
            video_enabled: true,
        }
    }

    /// Acquire the local stream, or return the one already held.
    ///
    /// Tracks of a fresh stream start with the current mute flags applied.
    pub async fn acquire(&mut self) -> Result<MediaStream, MediaError> {
        if let Some(stream) = &self.stream {
            return Ok(stream.clone());
        }

        let stream = self.devices.get_user_media(self.constraints).await?;
        for track in stream.tracks_of(TrackKind::Audio) {
            track.set_enabled(self.audio_enabled);
        }
        for track in stream.tracks_of(TrackKind::Video) {
            track.set_enabled(self.video_enabled);
        }

        tracing::info!(
            "Local media acquired: {} track(s) in stream {}",
            stream.tracks().len(),
            stream.id()
        );
        self.stream = Some(stream.clone());
        Ok(stream)
    }

    /// Stop every held track. Returns false if nothing was held.
    pub fn release(&mut self) -> bool {
        self.audio_enabled = true;
        self.video_enabled = true;
        match self.stream.take() {
            Some(stream) => {
                stream.stop_all();
                tracing::info!("Local media released (stream {})", stream.id());
                true
            }
            None => false,
        }
    }

    pub fn stream(&self) -> Option<&MediaStream> {
        self.stream.as_ref()
    }

    pub fn audio_enabled(&self) -> bool {
        self.audio_enabled
    }

    pub fn video_enabled(&self) -> bool {
        self.video_enabled
    }

    /// Flip the audio `enabled` flag on existing tracks. Returns the new state.
    pub fn toggle_audio(&mut self) -> bool {
        self.audio_enabled = !self.audio_enabled;
        self.apply(TrackKind::Audio, self.audio_enabled);
        self.audio_enabled
    }

    /// Flip the video `enabled` flag on existing tracks. Returns the new state.
    pub fn toggle_video(&mut self) -> bool {
        self.video_enabled = !self.video_enabled;
        self.apply(TrackKind::Video, self.video_enabled);
        self.video_enabled
    }

    fn apply(&self, kind: TrackKind, enabled: bool) {
        if let Some(stream) = &self.stream {
            for track in stream.tracks_of(kind) {
                track.set_enabled(enabled);
            }
        }
        tracing::debug!("Local {} {}", kind, if enabled { "enabled" } else { "muted" });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calling::testing::FakeDevices;

    fn gate(devices: FakeDevices) -> MediaCaptureGate {
        MediaCaptureGate::new(Arc::new(devices), MediaConstraints::default())
    }

    #[tokio::test]
    async fn test_acquire_returns_audio_and_video() {
        let mut gate = gate(FakeDevices::working());
        let stream = gate.acquire().await.unwrap();
        assert_eq!(stream.tracks_of(TrackKind::Audio).count(), 1);
        assert_eq!(stream.tracks_of(TrackKind::Video).count(), 1);

        // Second acquire hands back the same stream.
        let again = gate.acquire().await.unwrap();
        assert_eq!(again.id(), stream.id());
    }

    #[tokio::test]
    async fn test_acquire_denied() {
        let mut gate = gate(FakeDevices::denied());
        let err = gate.acquire().await.unwrap_err();
        assert!(matches!(err, MediaError::PermissionDenied));
        assert!(gate.stream().is_none());
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let mut gate = gate(FakeDevices::working());
        let stream = gate.acquire().await.unwrap();

        assert!(gate.release());
        assert!(stream.tracks().iter().all(|t| t.is_ended()));
        assert!(!gate.release());
        assert!(gate.stream().is_none());
        assert!(stream.tracks().iter().all(|t| t.is_ended()));
    }

    #[tokio::test]
    async fn test_toggle_flips_existing_tracks() {
        let mut gate = gate(FakeDevices::working());
        let stream = gate.acquire().await.unwrap();

        assert!(!gate.toggle_audio());
        assert!(stream.tracks_of(TrackKind::Audio).all(|t| !t.is_enabled()));
        assert!(stream.tracks_of(TrackKind::Video).all(|t| t.is_enabled()));

        assert!(!gate.toggle_video());
        assert!(stream.tracks_of(TrackKind::Video).all(|t| !t.is_enabled()));

        assert!(gate.toggle_audio());
        assert!(stream.tracks_of(TrackKind::Audio).all(|t| t.is_enabled()));
    }

    #[tokio::test]
    async fn test_mute_before_acquire_applies_to_new_tracks() {
        let mut gate = gate(FakeDevices::working());
        gate.toggle_video();
        let stream = gate.acquire().await.unwrap();
        assert!(stream.tracks_of(TrackKind::Video).all(|t| !t.is_enabled()));

        gate.release();
        assert!(gate.video_enabled());
    }

    #[test]
    fn test_stream_add_track_dedupes() {
        let track = MediaTrack::new(TrackKind::Audio, "mic");
        let mut stream = MediaStream::new(vec![]);
        stream.add_track(track.clone());
        stream.add_track(track);
        assert_eq!(stream.tracks().len(), 1);
    }
}
