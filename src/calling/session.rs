//! The call state machine.
//!
//! `CallSession` owns everything one call needs: the status, who is on
//! the other end, the local media gate and the peer connection manager.
//! Local actions (`start_call`, `accept_call`, `reject_call`, `end_call`)
//! and inbound signals both drive it; every transition runs to completion
//! before the next event is looked at.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::channel::{ChannelError, SignalSink};

use super::error::CallError;
use super::media::{MediaCaptureGate, MediaConstraints, MediaDevices, MediaStream};
use super::peer::{
    PeerConnectionFactory, PeerConnectionManager, PeerConnectionState, PeerError, PeerEvent,
    PeerUpdate, RtcConfiguration,
};
use super::signal::{
    IceCandidateInit, ParticipantId, RejectReason, SessionDescription, Signal, SignalFamily,
    SignalKind,
};
use super::CallStatus;

/// Why a call ended.
#[derive(Debug, Clone, PartialEq)]
pub enum EndReason {
    /// Local hang-up.
    Local,
    /// The other side sent `call.end`.
    Remote,
    /// The peer connection went to `disconnected` or `failed`.
    ConnectionLost(PeerConnectionState),
    /// Offer/answer could not be completed.
    NegotiationFailed(String),
    /// The signal channel dropped while the call was still ringing.
    TransportLost,
}

/// User-facing notifications emitted by the session.
#[derive(Debug, Clone)]
pub enum CallNotice {
    Status(CallStatus),
    IncomingCall {
        from: ParticipantId,
    },
    /// A second caller was turned away with `busy`.
    BusyRejected {
        caller: ParticipantId,
    },
    Rejected {
        by: ParticipantId,
        reason: Option<RejectReason>,
    },
    Ended {
        with: Option<ParticipantId>,
        reason: EndReason,
    },
    Connected,
    MediaError(String),
    RemoteStream(MediaStream),
}

/// Collaborators injected into a session.
pub struct SessionDeps {
    pub signals: Arc<dyn SignalSink>,
    pub peers: Arc<dyn PeerConnectionFactory>,
    pub devices: Arc<dyn MediaDevices>,
    pub rtc: RtcConfiguration,
    pub constraints: MediaConstraints,
}

/// Queues the session's owner must drain: peer connection events go back
/// into [`CallSession::handle_peer_event`], notices go to the user.
pub struct SessionChannels {
    pub peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    pub notices: mpsc::UnboundedReceiver<CallNotice>,
}

pub struct CallSession {
    status: CallStatus,
    local_participant_id: ParticipantId,
    remote_participant_id: Option<ParticipantId>,
    media: MediaCaptureGate,
    peer: PeerConnectionManager,
    remote_stream: Option<MediaStream>,
    signals: Arc<dyn SignalSink>,
    notices: mpsc::UnboundedSender<CallNotice>,
}

impl CallSession {
    pub fn new(local_participant_id: ParticipantId, deps: SessionDeps) -> (Self, SessionChannels) {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();

        let peer = PeerConnectionManager::new(
            deps.peers,
            deps.rtc,
            deps.signals.clone(),
            local_participant_id.clone(),
            peer_tx,
        );

        let session = Self {
            status: CallStatus::Idle,
            local_participant_id,
            remote_participant_id: None,
            media: MediaCaptureGate::new(deps.devices, deps.constraints),
            peer,
            remote_stream: None,
            signals: deps.signals,
            notices: notice_tx,
        };

        let channels = SessionChannels {
            peer_events: peer_rx,
            notices: notice_rx,
        };
        (session, channels)
    }

    pub fn status(&self) -> CallStatus {
        self.status
    }

    pub fn local_participant_id(&self) -> &ParticipantId {
        &self.local_participant_id
    }

    pub fn remote_participant_id(&self) -> Option<&ParticipantId> {
        self.remote_participant_id.as_ref()
    }

    /// Who is ringing us, while `Incoming`.
    pub fn incoming_caller(&self) -> Option<&ParticipantId> {
        match self.status {
            CallStatus::Incoming => self.remote_participant_id.as_ref(),
            _ => None,
        }
    }

    pub fn local_stream(&self) -> Option<&MediaStream> {
        self.media.stream()
    }

    pub fn remote_stream(&self) -> Option<&MediaStream> {
        self.remote_stream.as_ref()
    }

    pub fn audio_enabled(&self) -> bool {
        self.media.audio_enabled()
    }

    pub fn video_enabled(&self) -> bool {
        self.media.video_enabled()
    }

    pub fn toggle_audio(&mut self) -> bool {
        self.media.toggle_audio()
    }

    pub fn toggle_video(&mut self) -> bool {
        self.media.toggle_video()
    }

    pub fn peer(&self) -> &PeerConnectionManager {
        &self.peer
    }

    // -----------------------------------------------------------------------
    // Local actions
    // -----------------------------------------------------------------------

    /// Ring `target`: acquire local media, then send `call.start`.
    pub async fn start_call(&mut self, target: ParticipantId) -> Result<(), CallError> {
        self.require(CallStatus::Idle, "start a call")?;
        if target == self.local_participant_id {
            return Err(CallError::SelfCall);
        }

        if let Err(e) = self.media.acquire().await {
            tracing::warn!("Cannot call {}: {}", target, e);
            self.notify(CallNotice::MediaError(e.to_string()));
            return Err(e.into());
        }

        if let Err(e) = self.send_to(SignalKind::CallStart, &target) {
            self.reset();
            return Err(e.into());
        }

        tracing::info!("Calling {}", target);
        self.remote_participant_id = Some(target);
        self.set_status(CallStatus::Outgoing);
        Ok(())
    }

    /// Answer the ringing call: acquire local media, then send `call.accept`.
    pub async fn accept_call(&mut self) -> Result<(), CallError> {
        self.require(CallStatus::Incoming, "accept a call")?;
        let caller = self
            .remote_participant_id
            .clone()
            .ok_or(CallError::UnknownCaller)?;

        if let Err(e) = self.media.acquire().await {
            tracing::warn!("Cannot answer {}: {}", caller, e);
            self.notify(CallNotice::MediaError(e.to_string()));
            let reject = SignalKind::CallReject {
                reason: Some(RejectReason::MediaUnavailable),
            };
            if let Err(send_err) = self.send_to(reject, &caller) {
                tracing::warn!("Failed to notify {} of rejection: {}", caller, send_err);
            }
            self.reset();
            return Err(e.into());
        }

        if let Err(e) = self.send_to(SignalKind::CallAccept, &caller) {
            self.reset();
            return Err(e.into());
        }

        tracing::info!("Accepted call from {}", caller);
        self.set_status(CallStatus::Active);
        Ok(())
    }

    /// Decline the ringing call.
    pub fn reject_call(&mut self) -> Result<(), CallError> {
        self.require(CallStatus::Incoming, "reject a call")?;

        let sent = match self.remote_participant_id.clone() {
            Some(caller) => {
                tracing::info!("Rejecting call from {}", caller);
                let reject = SignalKind::CallReject {
                    reason: Some(RejectReason::Declined),
                };
                self.send_to(reject, &caller)
            }
            None => Ok(()),
        };
        self.reset();
        sent.map_err(Into::into)
    }

    /// Hang up. Tells the other side with `call.end`. No-op while idle.
    pub fn end_call(&mut self) -> Result<(), CallError> {
        if self.status == CallStatus::Idle {
            tracing::debug!("end_call while idle; nothing to do");
            return Ok(());
        }
        let sent = self.notify_remote_end();
        self.finish(EndReason::Local);
        sent.map_err(Into::into)
    }

    /// The signal channel went away. A ringing call cannot be answered or
    /// declined without it, so it ends here; nothing is sent. An active
    /// call keeps its peer connection and ends only on its own state.
    pub fn transport_lost(&mut self) {
        match self.status {
            CallStatus::Outgoing | CallStatus::Incoming => {
                tracing::info!("Signal channel lost while {}; ending call", self.status);
                self.finish(EndReason::TransportLost);
            }
            CallStatus::Active => {
                tracing::debug!("Signal channel lost during an active call; call continues");
            }
            CallStatus::Idle => {}
        }
    }

    // -----------------------------------------------------------------------
    // Inbound signals
    // -----------------------------------------------------------------------

    /// Handle a signal already known to be addressed to us.
    pub async fn handle_signal(&mut self, signal: Signal) {
        match signal.kind.family() {
            SignalFamily::Call => self.handle_call_signal(signal).await,
            SignalFamily::Media => self.handle_media_signal(signal).await,
        }
    }

    /// `call.*` lifecycle signals.
    pub async fn handle_call_signal(&mut self, signal: Signal) {
        let Some(from) = signal.from else {
            tracing::warn!("{} without sender dropped", signal.kind.type_name());
            return;
        };

        match signal.kind {
            SignalKind::CallStart => self.on_call_start(from),
            SignalKind::CallAccept => self.on_call_accept(from).await,
            SignalKind::CallReject { reason } => self.on_call_reject(from, reason),
            SignalKind::CallEnd => self.on_call_end(from),
            other => tracing::debug!("{} is not a call lifecycle signal", other.type_name()),
        }
    }

    /// `webrtc.*` negotiation signals.
    pub async fn handle_media_signal(&mut self, signal: Signal) {
        if let (Some(from), Some(remote)) = (&signal.from, &self.remote_participant_id) {
            if from != remote {
                tracing::debug!(
                    "{} from {} dropped; current remote is {}",
                    signal.kind.type_name(),
                    from,
                    remote
                );
                return;
            }
        }

        match signal.kind {
            SignalKind::Offer(offer) => self.on_offer(signal.from, offer).await,
            SignalKind::Answer(answer) => self.on_answer(answer).await,
            SignalKind::Ice(candidate) => self.on_ice(candidate).await,
            other => tracing::debug!("{} is not a negotiation signal", other.type_name()),
        }
    }

    fn on_call_start(&mut self, from: ParticipantId) {
        match self.status {
            CallStatus::Idle => {
                tracing::info!("Incoming call from {}", from);
                self.remote_participant_id = Some(from.clone());
                self.set_status(CallStatus::Incoming);
                self.notify(CallNotice::IncomingCall { from });
            }
            CallStatus::Incoming if self.is_remote(&from) => {
                tracing::debug!("Duplicate call.start from {} ignored", from);
            }
            status => {
                tracing::info!("Busy ({}); rejecting call from {}", status, from);
                let reject = SignalKind::CallReject {
                    reason: Some(RejectReason::Busy),
                };
                if let Err(e) = self.send_to(reject, &from) {
                    tracing::warn!("Failed to send busy to {}: {}", from, e);
                }
                self.notify(CallNotice::BusyRejected { caller: from });
            }
        }
    }

    async fn on_call_accept(&mut self, from: ParticipantId) {
        if self.status != CallStatus::Outgoing {
            tracing::debug!("call.accept from {} ignored while {}", from, self.status);
            return;
        }
        if !self.is_remote(&from) {
            tracing::debug!("call.accept from {} who was not called; ignored", from);
            return;
        }

        tracing::info!("{} accepted; starting negotiation", from);
        let local = self.media.stream().cloned();
        match self.peer.create_offer(&from, local.as_ref()).await {
            Ok(()) => self.set_status(CallStatus::Active),
            Err(e) => {
                tracing::warn!("Offer to {} failed: {}", from, e);
                self.terminate(EndReason::NegotiationFailed(e.to_string()));
            }
        }
    }

    fn on_call_reject(&mut self, from: ParticipantId, reason: Option<RejectReason>) {
        if self.status == CallStatus::Idle || !self.is_remote(&from) {
            tracing::debug!("call.reject from {} ignored while {}", from, self.status);
            return;
        }
        match reason {
            Some(reason) => tracing::info!("{} rejected the call ({})", from, reason),
            None => tracing::info!("{} rejected the call", from),
        }
        self.reset();
        self.notify(CallNotice::Rejected { by: from, reason });
    }

    fn on_call_end(&mut self, from: ParticipantId) {
        if self.status == CallStatus::Idle || !self.is_remote(&from) {
            tracing::debug!("call.end from {} ignored while {}", from, self.status);
            return;
        }
        tracing::info!("{} hung up", from);
        self.finish(EndReason::Remote);
    }

    async fn on_offer(&mut self, from: Option<ParticipantId>, offer: SessionDescription) {
        if self.status != CallStatus::Active {
            tracing::debug!("webrtc.offer ignored while {}", self.status);
            return;
        }
        let Some(target) = from.or_else(|| self.remote_participant_id.clone()) else {
            tracing::warn!("webrtc.offer with no known sender dropped");
            return;
        };

        let local = self.media.stream().cloned();
        if let Err(e) = self.peer.create_answer(&target, offer, local.as_ref()).await {
            tracing::warn!("Answer to {} failed: {}", target, e);
            self.terminate(EndReason::NegotiationFailed(e.to_string()));
        }
    }

    async fn on_answer(&mut self, answer: SessionDescription) {
        if !self.peer.has_connection() {
            tracing::debug!("webrtc.answer without a peer connection ignored");
            return;
        }
        if let Err(e) = self.peer.apply_answer(answer).await {
            tracing::warn!("Remote answer rejected: {}", e);
            self.terminate(EndReason::NegotiationFailed(e.to_string()));
        }
    }

    async fn on_ice(&mut self, candidate: IceCandidateInit) {
        match self.peer.add_remote_candidate(candidate).await {
            Ok(()) => {}
            Err(PeerError::NoConnection) => {
                tracing::debug!("webrtc.ice before any peer connection ignored");
            }
            Err(e) => tracing::warn!("Ignoring remote ICE candidate: {}", e),
        }
    }

    // -----------------------------------------------------------------------
    // Peer connection events
    // -----------------------------------------------------------------------

    pub fn handle_peer_event(&mut self, event: PeerEvent) {
        match self.peer.handle_event(event) {
            None => {}
            Some(PeerUpdate::RemoteTrack(track)) => {
                tracing::info!("Remote {} track received", track.kind());
                let stream = self
                    .remote_stream
                    .get_or_insert_with(|| MediaStream::new(Vec::new()));
                stream.add_track(track);
                let stream = stream.clone();
                self.notify(CallNotice::RemoteStream(stream));
            }
            Some(PeerUpdate::State(state)) => {
                tracing::debug!("Peer connection state: {}", state);
                if state == PeerConnectionState::Connected {
                    self.notify(CallNotice::Connected);
                } else if state.is_failure() && self.status != CallStatus::Idle {
                    tracing::info!("Peer connection {}; ending call", state);
                    self.terminate(EndReason::ConnectionLost(state));
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn require(&self, expected: CallStatus, action: &'static str) -> Result<(), CallError> {
        if self.status == expected {
            Ok(())
        } else {
            Err(CallError::InvalidState {
                action,
                status: self.status,
            })
        }
    }

    fn is_remote(&self, id: &ParticipantId) -> bool {
        self.remote_participant_id.as_ref() == Some(id)
    }

    fn send_to(&self, kind: SignalKind, to: &ParticipantId) -> Result<(), ChannelError> {
        self.signals.send(Signal::new(
            kind,
            self.local_participant_id.clone(),
            to.clone(),
        ))
    }

    fn notify(&self, notice: CallNotice) {
        if self.notices.send(notice).is_err() {
            tracing::trace!("Call notice dropped: no listener");
        }
    }

    fn set_status(&mut self, next: CallStatus) {
        if self.status != next {
            tracing::info!("Call status {} -> {}", self.status, next);
            self.status = next;
            self.notify(CallNotice::Status(next));
        }
    }

    fn notify_remote_end(&self) -> Result<(), ChannelError> {
        match &self.remote_participant_id {
            Some(remote) => self.send_to(SignalKind::CallEnd, remote),
            None => Ok(()),
        }
    }

    /// End the call from inside the state machine: best-effort `call.end`,
    /// then reset.
    fn terminate(&mut self, reason: EndReason) {
        if let Err(e) = self.notify_remote_end() {
            tracing::warn!("Failed to send call.end: {}", e);
        }
        self.finish(reason);
    }

    fn finish(&mut self, reason: EndReason) {
        let with = self.remote_participant_id.clone();
        self.reset();
        self.notify(CallNotice::Ended { with, reason });
    }

    /// Release every call resource and return to `Idle`.
    fn reset(&mut self) {
        self.peer.teardown();
        self.media.release();
        if let Some(stream) = self.remote_stream.take() {
            stream.stop_all();
        }
        self.remote_participant_id = None;
        self.set_status(CallStatus::Idle);
    }
}
