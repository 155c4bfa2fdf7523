//! Peer connection backend used by the CLI.
//!
//! Does real offer/answer, trickles host and server-reflexive candidates
//! and runs ICE connectivity checks over one UDP socket, but carries no
//! media. The connection reports `connected` only after a Binding check to
//! the peer has been answered, `failed` when no check is answered in time,
//! and `disconnected` when the selected pair stops answering consent checks.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use super::ice::{
    self, CheckTimers, Checklist, Connectivity, IceCandidate, IceCredentials, PacketOutcome,
    Transport,
};
use super::media::{MediaTrack, TrackKind};
use super::peer::{
    PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerError, PeerEventKind,
    PeerEventSink, RtcConfiguration,
};
use super::sdp::{self, SessionSdp};
use super::signal::{IceCandidateInit, SdpType, SessionDescription};

#[derive(Debug, Default)]
pub struct LocalPeerFactory {
    timers: CheckTimers,
}

impl LocalPeerFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PeerConnectionFactory for LocalPeerFactory {
    fn create(
        &self,
        config: &RtcConfiguration,
        events: PeerEventSink,
    ) -> Result<Box<dyn PeerConnection>, PeerError> {
        Ok(Box::new(LocalPeerConnection::new(config, events, self.timers)))
    }
}

/// Connection state, written by both the connection and its ICE task.
#[derive(Debug, Clone)]
struct SharedState {
    state: Arc<Mutex<PeerConnectionState>>,
    events: PeerEventSink,
}

impl SharedState {
    fn get(&self) -> PeerConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move to `next` and report it. `Closed` is final.
    fn set(&self, next: PeerConnectionState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == next || *state == PeerConnectionState::Closed {
            return;
        }
        tracing::debug!("Local peer {} -> {}", *state, next);
        *state = next;
        self.events.emit(PeerEventKind::ConnectionState(next));
    }
}

enum AgentCommand {
    RemoteCredentials(IceCredentials),
    RemoteCandidate(SocketAddr),
}

pub struct LocalPeerConnection {
    stun_server: Option<String>,
    timers: CheckTimers,
    /// Kept for the connection's lifetime so renegotiated descriptions do
    /// not invalidate checks already running.
    credentials: IceCredentials,
    events: PeerEventSink,
    state: SharedState,
    local_tracks: Vec<MediaTrack>,
    local: Option<SessionSdp>,
    remote: Option<SessionSdp>,
    /// Remote track per mid, so renegotiation does not announce twice.
    remote_tracks: HashMap<String, MediaTrack>,
    agent_tx: mpsc::UnboundedSender<AgentCommand>,
    agent_rx: Option<mpsc::UnboundedReceiver<AgentCommand>>,
    agent: Option<JoinHandle<()>>,
}

impl LocalPeerConnection {
    pub fn new(config: &RtcConfiguration, events: PeerEventSink, timers: CheckTimers) -> Self {
        let stun_server = config
            .ice_servers
            .iter()
            .find_map(|s| ice::stun_server_address(&s.urls));
        let (agent_tx, agent_rx) = mpsc::unbounded_channel();
        Self {
            stun_server,
            timers,
            credentials: IceCredentials {
                ufrag: sdp::generate_ice_ufrag(),
                pwd: sdp::generate_ice_pwd(),
            },
            state: SharedState {
                state: Arc::new(Mutex::new(PeerConnectionState::New)),
                events: events.clone(),
            },
            events,
            local_tracks: Vec::new(),
            local: None,
            remote: None,
            remote_tracks: HashMap::new(),
            agent_tx,
            agent_rx: Some(agent_rx),
            agent: None,
        }
    }

    pub fn state(&self) -> PeerConnectionState {
        self.state.get()
    }

    fn ensure_open(&self) -> Result<(), PeerError> {
        if self.state.get() == PeerConnectionState::Closed {
            Err(PeerError::Closed)
        } else {
            Ok(())
        }
    }

    fn sending_kinds(&self) -> Vec<TrackKind> {
        let mut kinds: Vec<TrackKind> = self.local_tracks.iter().map(|t| t.kind()).collect();
        kinds.dedup();
        kinds
    }

    fn with_credentials(&self, mut sdp: SessionSdp) -> SessionSdp {
        sdp.ice_ufrag = self.credentials.ufrag.clone();
        sdp.ice_pwd = self.credentials.pwd.clone();
        sdp
    }

    fn advance(&mut self) {
        if self.state.get() == PeerConnectionState::New
            && self.local.is_some()
            && self.remote.is_some()
        {
            self.state.set(PeerConnectionState::Connecting);
        }
    }

    fn tell_agent(&self, command: AgentCommand) {
        if self.agent_tx.send(command).is_err() {
            tracing::debug!("ICE task has finished; remote ICE data dropped");
        }
    }

    fn add_remote_candidate(&self, candidate: &IceCandidate) {
        match candidate.socket_addr() {
            Some(addr) if candidate.transport == Transport::Udp && candidate.component == 1 => {
                self.tell_agent(AgentCommand::RemoteCandidate(addr));
            }
            _ => tracing::debug!(
                "Remote candidate {}:{} not checkable; skipped",
                candidate.address,
                candidate.port
            ),
        }
    }

    fn start_agent(&mut self, controlling: bool) {
        let (Some(local), Some(commands)) = (&self.local, self.agent_rx.take()) else {
            return;
        };
        let setup = AgentSetup {
            mids: local.media.iter().map(|m| m.mid.clone()).collect(),
            credentials: self.credentials.clone(),
            controlling,
            stun_server: self.stun_server.clone(),
            timers: self.timers,
            events: self.events.clone(),
            state: self.state.clone(),
        };
        self.agent = Some(tokio::spawn(run_agent(setup, commands)));
    }
}

struct AgentSetup {
    mids: Vec<String>,
    credentials: IceCredentials,
    controlling: bool,
    stun_server: Option<String>,
    timers: CheckTimers,
    events: PeerEventSink,
    state: SharedState,
}

/// Bind the socket, trickle local candidates, then check remote candidates
/// until a verdict or until the connection goes away.
async fn run_agent(setup: AgentSetup, mut commands: mpsc::UnboundedReceiver<AgentCommand>) {
    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(socket) => socket,
        Err(e) => {
            tracing::warn!("ICE failed to bind a UDP socket: {}", e);
            setup.state.set(PeerConnectionState::Failed);
            return;
        }
    };
    gather(&socket, &setup).await;

    let mut checklist = Checklist::new(setup.credentials.clone(), setup.controlling, setup.timers);
    let mut ticker = time::interval(setup.timers.interval);
    let mut buf = [0u8; 1500];

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(AgentCommand::RemoteCredentials(remote)) => {
                    checklist.set_remote_credentials(remote, Instant::now());
                }
                Some(AgentCommand::RemoteCandidate(addr)) => {
                    if checklist.add_remote_candidate(addr) {
                        tracing::debug!("Checking remote candidate {}", addr);
                    }
                }
                None => return,
            },
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, from)) => match checklist.handle_packet(&buf[..len], from, Instant::now()) {
                    PacketOutcome::Reply(bytes) => {
                        if let Err(e) = socket.send_to(&bytes, from).await {
                            tracing::debug!("ICE response to {} failed: {}", from, e);
                        }
                    }
                    PacketOutcome::Selected(addr) => {
                        tracing::info!("ICE connected to {}", addr);
                        setup.state.set(PeerConnectionState::Connected);
                    }
                    PacketOutcome::Ignored => {}
                },
                Err(e) => tracing::debug!("ICE socket receive failed: {}", e),
            },
            _ = ticker.tick() => {
                let round = checklist.poll(Instant::now());
                for (to, bytes) in &round.requests {
                    if let Err(e) = socket.send_to(bytes, *to).await {
                        tracing::trace!("ICE check to {} failed: {}", to, e);
                    }
                }
                if let Some(verdict) = round.verdict {
                    let next = match verdict {
                        Connectivity::Failed => PeerConnectionState::Failed,
                        Connectivity::Disconnected => PeerConnectionState::Disconnected,
                    };
                    tracing::info!("ICE {}", next);
                    setup.state.set(next);
                    return;
                }
            }
        }
    }
}

async fn gather(socket: &UdpSocket, setup: &AgentSetup) {
    let mut candidates = Vec::new();
    match socket.local_addr() {
        Ok(addr) => candidates.push(ice::gather_host_candidate(addr)),
        Err(e) => tracing::warn!("ICE gathering: no local address: {}", e),
    }
    if let Some(server) = &setup.stun_server {
        match ice::gather_srflx_candidate(socket, server).await {
            Some(c) => candidates.push(c),
            None => tracing::debug!("No server-reflexive candidate from {}", server),
        }
    }

    tracing::debug!("Gathered {} local ICE candidate(s)", candidates.len());
    for candidate in &candidates {
        for (index, mid) in setup.mids.iter().enumerate() {
            setup.events.emit(PeerEventKind::IceCandidate(IceCandidateInit {
                candidate: candidate.to_attribute(),
                sdp_mid: Some(mid.clone()),
                sdp_m_line_index: u16::try_from(index).ok(),
                username_fragment: Some(setup.credentials.ufrag.clone()),
            }));
        }
    }
}

fn parse_description(desc: &SessionDescription) -> Result<SessionSdp, PeerError> {
    SessionSdp::parse(&desc.sdp).map_err(|e| PeerError::InvalidDescription(e.to_string()))
}

#[async_trait]
impl PeerConnection for LocalPeerConnection {
    fn add_track(&mut self, track: MediaTrack) -> Result<(), PeerError> {
        self.ensure_open()?;
        self.local_tracks.push(track);
        Ok(())
    }

    async fn create_offer(&mut self) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        let sdp = SessionSdp::offer(
            ice::local_ip(),
            &self.sending_kinds(),
            &[TrackKind::Audio, TrackKind::Video],
        );
        Ok(SessionDescription::offer(self.with_credentials(sdp).to_sdp()))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        let remote = self
            .remote
            .as_ref()
            .ok_or_else(|| PeerError::InvalidDescription("no remote offer to answer".into()))?;
        let sdp = SessionSdp::answer(ice::local_ip(), remote, &self.sending_kinds());
        Ok(SessionDescription::answer(self.with_credentials(sdp).to_sdp()))
    }

    async fn set_local_description(&mut self, desc: SessionDescription) -> Result<(), PeerError> {
        self.ensure_open()?;
        let local = parse_description(&desc)?;
        self.local = Some(local);
        self.advance();
        self.start_agent(desc.sdp_type == SdpType::Offer);
        Ok(())
    }

    async fn set_remote_description(
        &mut self,
        desc: SessionDescription,
    ) -> Result<(), PeerError> {
        self.ensure_open()?;
        let remote = parse_description(&desc)?;
        if desc.sdp_type == SdpType::Answer && self.local.is_none() {
            return Err(PeerError::InvalidDescription(
                "answer received without a local offer".into(),
            ));
        }

        for section in remote.media.iter().filter(|m| m.direction.sends()) {
            if self.remote_tracks.contains_key(&section.mid) {
                continue;
            }
            let track = MediaTrack::new(section.kind, format!("remote-{}", section.kind));
            self.remote_tracks.insert(section.mid.clone(), track.clone());
            self.events.emit(PeerEventKind::Track(track));
        }

        self.tell_agent(AgentCommand::RemoteCredentials(IceCredentials {
            ufrag: remote.ice_ufrag.clone(),
            pwd: remote.ice_pwd.clone(),
        }));
        for candidate in remote.media.iter().flat_map(|m| &m.candidates) {
            self.add_remote_candidate(candidate);
        }

        self.remote = Some(remote);
        self.advance();
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: IceCandidateInit) -> Result<(), PeerError> {
        self.ensure_open()?;
        if candidate.is_end_of_candidates() {
            return Ok(());
        }
        let remote = self
            .remote
            .as_ref()
            .ok_or_else(|| PeerError::InvalidCandidate("no remote description".into()))?;

        let known_mid = candidate
            .sdp_mid
            .as_deref()
            .map(|mid| remote.section(mid).is_some());
        let known_index = candidate
            .sdp_m_line_index
            .map(|i| usize::from(i) < remote.media.len());
        if known_mid == Some(false) && known_index != Some(true) {
            return Err(PeerError::InvalidCandidate(format!(
                "unknown media section {:?}",
                candidate.sdp_mid
            )));
        }

        let parsed = ice::parse_candidate(&candidate.candidate)
            .map_err(|e| PeerError::InvalidCandidate(e.to_string()))?;
        tracing::debug!(
            "Remote {} candidate {}:{}",
            parsed.candidate_type,
            parsed.address,
            parsed.port
        );
        self.add_remote_candidate(&parsed);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(task) = self.agent.take() {
            task.abort();
        }
        self.agent_rx = None;
        for track in self.remote_tracks.values() {
            track.stop();
        }
        self.state.set(PeerConnectionState::Closed);
    }
}
