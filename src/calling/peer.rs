//! Peer connection seam and the manager that owns the single live
//! connection of a call.
//!
//! The manager creates the connection lazily, attaches local tracks once,
//! runs the offer/answer steps, trickles local ICE candidates to the
//! current remote participant, and closes everything on teardown. Each
//! connection gets a generation number; events still in flight from a
//! connection that was torn down are recognised as stale and dropped.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::channel::SignalSink;

use super::error::CallError;
use super::media::{MediaStream, MediaTrack};
use super::signal::{IceCandidateInit, ParticipantId, SessionDescription, Signal, SignalKind};

/// One ICE server entry, `{ urls }` as in a browser `RTCIceServer`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: String,
}

#[derive(Debug, Clone, Default)]
pub struct RtcConfiguration {
    pub ice_servers: Vec<IceServer>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    /// States that end the call.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            PeerConnectionState::Disconnected | PeerConnectionState::Failed
        )
    }
}

impl fmt::Display for PeerConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerConnectionState::New => "new",
            PeerConnectionState::Connecting => "connecting",
            PeerConnectionState::Connected => "connected",
            PeerConnectionState::Disconnected => "disconnected",
            PeerConnectionState::Failed => "failed",
            PeerConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum PeerError {
    #[error("peer connection is closed")]
    Closed,

    #[error("no peer connection")]
    NoConnection,

    #[error("invalid session description: {0}")]
    InvalidDescription(String),

    #[error("invalid ICE candidate: {0}")]
    InvalidCandidate(String),
}

#[derive(Debug, Clone)]
pub enum PeerEventKind {
    IceCandidate(IceCandidateInit),
    Track(MediaTrack),
    ConnectionState(PeerConnectionState),
}

#[derive(Debug, Clone)]
pub struct PeerEvent {
    pub generation: u64,
    pub kind: PeerEventKind,
}

/// Where a connection reports its events. Stamped with the connection's
/// generation by the manager.
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerEventSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn emit(&self, kind: PeerEventKind) {
        let event = PeerEvent {
            generation: self.generation,
            kind,
        };
        if self.tx.send(event).is_err() {
            tracing::debug!("Peer event dropped: call session is gone");
        }
    }
}

/// The underlying WebRTC peer connection.
#[async_trait]
pub trait PeerConnection: Send {
    fn add_track(&mut self, track: MediaTrack) -> Result<(), PeerError>;
    async fn create_offer(&mut self) -> Result<SessionDescription, PeerError>;
    async fn create_answer(&mut self) -> Result<SessionDescription, PeerError>;
    async fn set_local_description(&mut self, desc: SessionDescription) -> Result<(), PeerError>;
    async fn set_remote_description(&mut self, desc: SessionDescription)
        -> Result<(), PeerError>;
    async fn add_ice_candidate(&mut self, candidate: IceCandidateInit) -> Result<(), PeerError>;
    fn close(&mut self);
}

pub trait PeerConnectionFactory: Send + Sync {
    fn create(
        &self,
        config: &RtcConfiguration,
        events: PeerEventSink,
    ) -> Result<Box<dyn PeerConnection>, PeerError>;
}

/// What a peer event means for the call.
#[derive(Debug, Clone)]
pub enum PeerUpdate {
    RemoteTrack(MediaTrack),
    State(PeerConnectionState),
}

pub struct PeerConnectionManager {
    factory: Arc<dyn PeerConnectionFactory>,
    config: RtcConfiguration,
    signals: Arc<dyn SignalSink>,
    local_participant_id: ParticipantId,
    events: mpsc::UnboundedSender<PeerEvent>,
    connection: Option<Box<dyn PeerConnection>>,
    attached_tracks: HashSet<String>,
    current_remote_participant_id: Option<ParticipantId>,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidateInit>,
    generation: u64,
    created: usize,
}

impl PeerConnectionManager {
    pub fn new(
        factory: Arc<dyn PeerConnectionFactory>,
        config: RtcConfiguration,
        signals: Arc<dyn SignalSink>,
        local_participant_id: ParticipantId,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        Self {
            factory,
            config,
            signals,
            local_participant_id,
            events,
            connection: None,
            attached_tracks: HashSet::new(),
            current_remote_participant_id: None,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            generation: 0,
            created: 0,
        }
    }

    pub fn has_connection(&self) -> bool {
        self.connection.is_some()
    }

    /// Number of connections created over the manager's lifetime.
    pub fn connections_created(&self) -> usize {
        self.created
    }

    pub fn current_remote_participant_id(&self) -> Option<&ParticipantId> {
        self.current_remote_participant_id.as_ref()
    }

    /// Return the live connection, creating it if absent.
    pub fn ensure_connection(&mut self) -> Result<&mut Box<dyn PeerConnection>, PeerError> {
        if self.connection.is_none() {
            self.generation += 1;
            let sink = PeerEventSink::new(self.generation, self.events.clone());
            let connection = self.factory.create(&self.config, sink)?;
            self.created += 1;
            tracing::info!(
                "Peer connection created (generation {}, {} ICE server(s))",
                self.generation,
                self.config.ice_servers.len()
            );
            self.connection = Some(connection);
        }
        self.connection.as_mut().ok_or(PeerError::NoConnection)
    }

    /// Add every track of `stream` to the connection, each at most once.
    /// Returns how many tracks were newly attached.
    pub fn attach_local_tracks(&mut self, stream: &MediaStream) -> Result<usize, PeerError> {
        self.ensure_connection()?;
        let connection = self.connection.as_mut().ok_or(PeerError::NoConnection)?;

        let mut attached = 0;
        for track in stream.tracks() {
            if !self.attached_tracks.insert(track.id().to_string()) {
                continue;
            }
            if let Err(e) = connection.add_track(track.clone()) {
                self.attached_tracks.remove(track.id());
                return Err(e);
            }
            attached += 1;
        }
        if attached > 0 {
            tracing::debug!("Attached {} local track(s)", attached);
        }
        Ok(attached)
    }

    fn prepare(
        &mut self,
        target: &ParticipantId,
        local: Option<&MediaStream>,
    ) -> Result<(), PeerError> {
        self.current_remote_participant_id = Some(target.clone());
        match local {
            Some(stream) => self.attach_local_tracks(stream).map(|_| ()),
            None => self.ensure_connection().map(|_| ()),
        }
    }

    /// Create an offer, apply it locally and send it to `target`.
    pub async fn create_offer(
        &mut self,
        target: &ParticipantId,
        local: Option<&MediaStream>,
    ) -> Result<(), CallError> {
        self.prepare(target, local)?;
        let connection = self.connection.as_mut().ok_or(PeerError::NoConnection)?;

        let offer = connection.create_offer().await?;
        connection.set_local_description(offer.clone()).await?;

        tracing::info!("Sending SDP offer to {}", target);
        self.send(SignalKind::Offer(offer), target)?;
        Ok(())
    }

    /// Apply `remote_offer`, create an answer, apply it locally and send it
    /// to `target`.
    pub async fn create_answer(
        &mut self,
        target: &ParticipantId,
        remote_offer: SessionDescription,
        local: Option<&MediaStream>,
    ) -> Result<(), CallError> {
        self.prepare(target, local)?;
        let connection = self.connection.as_mut().ok_or(PeerError::NoConnection)?;

        connection.set_remote_description(remote_offer).await?;
        self.remote_description_set = true;
        self.flush_pending_candidates().await;

        let connection = self.connection.as_mut().ok_or(PeerError::NoConnection)?;
        let answer = connection.create_answer().await?;
        connection.set_local_description(answer.clone()).await?;

        tracing::info!("Sending SDP answer to {}", target);
        self.send(SignalKind::Answer(answer), target)?;
        Ok(())
    }

    /// Apply the remote answer to the live connection.
    pub async fn apply_answer(&mut self, answer: SessionDescription) -> Result<(), PeerError> {
        let connection = self.connection.as_mut().ok_or(PeerError::NoConnection)?;
        connection.set_remote_description(answer).await?;
        self.remote_description_set = true;
        tracing::info!("Remote SDP answer applied");
        self.flush_pending_candidates().await;
        Ok(())
    }

    /// Apply a remote ICE candidate. Candidates that arrive before the
    /// remote description are held until it is applied.
    pub async fn add_remote_candidate(
        &mut self,
        candidate: IceCandidateInit,
    ) -> Result<(), PeerError> {
        let connection = self.connection.as_mut().ok_or(PeerError::NoConnection)?;
        if !self.remote_description_set {
            tracing::debug!("Queueing remote ICE candidate until remote description is set");
            self.pending_candidates.push(candidate);
            return Ok(());
        }
        connection.add_ice_candidate(candidate).await
    }

    async fn flush_pending_candidates(&mut self) {
        let pending = std::mem::take(&mut self.pending_candidates);
        if pending.is_empty() {
            return;
        }
        tracing::debug!("Applying {} queued ICE candidate(s)", pending.len());
        for candidate in pending {
            let Some(connection) = self.connection.as_mut() else {
                return;
            };
            if let Err(e) = connection.add_ice_candidate(candidate).await {
                tracing::warn!("Ignoring queued ICE candidate: {}", e);
            }
        }
    }

    /// Interpret an event from the connection.
    ///
    /// Local ICE candidates are forwarded to the remote participant here;
    /// everything the call state machine cares about is returned.
    pub fn handle_event(&mut self, event: PeerEvent) -> Option<PeerUpdate> {
        if event.generation != self.generation || self.connection.is_none() {
            tracing::trace!("Dropping stale peer event from generation {}", event.generation);
            return None;
        }

        match event.kind {
            PeerEventKind::IceCandidate(candidate) => {
                match self.current_remote_participant_id.clone() {
                    Some(remote) => {
                        if let Err(e) = self.send(SignalKind::Ice(candidate), &remote) {
                            tracing::warn!("Failed to send local ICE candidate: {}", e);
                        }
                    }
                    None => tracing::debug!("No remote participant; local ICE candidate dropped"),
                }
                None
            }
            PeerEventKind::Track(track) => Some(PeerUpdate::RemoteTrack(track)),
            PeerEventKind::ConnectionState(state) => Some(PeerUpdate::State(state)),
        }
    }

    /// Close the connection and forget everything tied to it. Safe to call
    /// when no connection exists. Returns whether a connection was closed.
    pub fn teardown(&mut self) -> bool {
        self.attached_tracks.clear();
        self.pending_candidates.clear();
        self.remote_description_set = false;
        self.current_remote_participant_id = None;

        match self.connection.take() {
            Some(mut connection) => {
                connection.close();
                tracing::info!("Peer connection closed (generation {})", self.generation);
                true
            }
            None => false,
        }
    }

    fn send(
        &self,
        kind: SignalKind,
        to: &ParticipantId,
    ) -> Result<(), crate::channel::ChannelError> {
        self.signals.send(Signal::new(
            kind,
            self.local_participant_id.clone(),
            to.clone(),
        ))
    }
}
