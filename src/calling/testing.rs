//! Test doubles for the call core: a sink that records outbound signals,
//! scripted media devices, and a peer connection factory whose connections
//! can be inspected and driven from tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::channel::{ChannelError, SignalSink};

use super::media::{MediaConstraints, MediaDevices, MediaError, MediaStream, MediaTrack, TrackKind};
use super::peer::{
    PeerConnection, PeerConnectionFactory, PeerError, PeerEventKind, PeerEventSink,
    RtcConfiguration,
};
use super::signal::{IceCandidateInit, SessionDescription, Signal};

#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<Signal>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Signal> {
        self.sent.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }

    pub fn types(&self) -> Vec<&'static str> {
        self.sent().iter().map(|s| s.kind.type_name()).collect()
    }
}

impl SignalSink for RecordingSink {
    fn send(&self, signal: Signal) -> Result<(), ChannelError> {
        // Encode like the real channel so payload shapes are exercised.
        signal.encode()?;
        self.sent.lock().unwrap().push(signal);
        Ok(())
    }
}

pub struct FakeDevices {
    deny: bool,
    requests: Mutex<usize>,
}

impl FakeDevices {
    pub fn working() -> Self {
        Self {
            deny: false,
            requests: Mutex::new(0),
        }
    }

    pub fn denied() -> Self {
        Self {
            deny: true,
            requests: Mutex::new(0),
        }
    }

    pub fn requests(&self) -> usize {
        *self.requests.lock().unwrap()
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<MediaStream, MediaError> {
        *self.requests.lock().unwrap() += 1;
        if self.deny {
            return Err(MediaError::PermissionDenied);
        }
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(MediaTrack::new(TrackKind::Audio, "fake-mic"));
        }
        if constraints.video {
            tracks.push(MediaTrack::new(TrackKind::Video, "fake-cam"));
        }
        Ok(MediaStream::new(tracks))
    }
}

#[derive(Default)]
struct FakePeerState {
    tracks: Vec<MediaTrack>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    candidates: Vec<IceCandidateInit>,
    offers: usize,
    closed: bool,
    close_calls: usize,
    reject_candidates: bool,
}

/// Shared handle to a fake connection; the factory keeps one clone and
/// hands the other to the manager.
#[derive(Clone)]
pub struct FakePeer {
    state: Arc<Mutex<FakePeerState>>,
    events: PeerEventSink,
}

impl FakePeer {
    pub fn emit(&self, kind: PeerEventKind) {
        self.events.emit(kind);
    }

    pub fn tracks_added(&self) -> usize {
        self.state.lock().unwrap().tracks.len()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().unwrap().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().unwrap().remote.clone()
    }

    pub fn candidates(&self) -> Vec<IceCandidateInit> {
        self.state.lock().unwrap().candidates.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub fn close_calls(&self) -> usize {
        self.state.lock().unwrap().close_calls
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    fn add_track(&mut self, track: MediaTrack) -> Result<(), PeerError> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(PeerError::Closed);
        }
        state.tracks.push(track);
        Ok(())
    }

    async fn create_offer(&mut self) -> Result<SessionDescription, PeerError> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(PeerError::Closed);
        }
        state.offers += 1;
        Ok(SessionDescription::offer(format!(
            "v=0\r\ns=fake-offer-{}\r\n",
            state.offers
        )))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, PeerError> {
        let state = self.state.lock().unwrap();
        if state.remote.is_none() {
            return Err(PeerError::InvalidDescription("no remote offer".into()));
        }
        Ok(SessionDescription::answer("v=0\r\ns=fake-answer\r\n"))
    }

    async fn set_local_description(&mut self, desc: SessionDescription) -> Result<(), PeerError> {
        self.state.lock().unwrap().local = Some(desc);
        Ok(())
    }

    async fn set_remote_description(
        &mut self,
        desc: SessionDescription,
    ) -> Result<(), PeerError> {
        if desc.sdp.is_empty() {
            return Err(PeerError::InvalidDescription("empty SDP".into()));
        }
        self.state.lock().unwrap().remote = Some(desc);
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: IceCandidateInit) -> Result<(), PeerError> {
        let mut state = self.state.lock().unwrap();
        if state.reject_candidates {
            return Err(PeerError::InvalidCandidate("rejected by fake".into()));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        state.close_calls += 1;
    }
}

#[derive(Default)]
pub struct FakePeerFactory {
    peers: Mutex<Vec<FakePeer>>,
    last_config: Mutex<Option<RtcConfiguration>>,
    reject_candidates: bool,
}

impl FakePeerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connections from this factory fail every `add_ice_candidate`.
    pub fn rejecting_candidates() -> Self {
        Self {
            reject_candidates: true,
            ..Self::default()
        }
    }

    pub fn created(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn peer(&self, index: usize) -> FakePeer {
        self.peers.lock().unwrap()[index].clone()
    }

    pub fn last_config(&self) -> Option<RtcConfiguration> {
        self.last_config.lock().unwrap().clone()
    }
}

impl PeerConnectionFactory for FakePeerFactory {
    fn create(
        &self,
        config: &RtcConfiguration,
        events: PeerEventSink,
    ) -> Result<Box<dyn PeerConnection>, PeerError> {
        *self.last_config.lock().unwrap() = Some(config.clone());
        let peer = FakePeer {
            state: Arc::new(Mutex::new(FakePeerState {
                reject_candidates: self.reject_candidates,
                ..FakePeerState::default()
            })),
            events,
        };
        self.peers.lock().unwrap().push(peer.clone());
        Ok(Box::new(peer))
    }
}
