//! ICE: candidates, gathering, and the connectivity checks that decide
//! whether a peer is actually reachable.
//!
//! Covers the parts of RFC 8445 the local peer backend needs: candidate
//! attribute parsing and formatting, candidate priority, host and
//! server-reflexive discovery, and a checklist that runs Binding checks
//! against remote candidates and keeps consent on the selected pair.

use std::collections::VecDeque;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::net::UdpSocket;
use tokio::time::Instant;

use super::stun::{self, attr, MessageType, StunMessage, TransactionId};

const STUN_DEFAULT_PORT: u16 = 3478;
const STUN_TIMEOUT: Duration = Duration::from_secs(2);
const STUN_ATTEMPTS: u32 = 2;

/// Outstanding checks remembered per pair; older ones no longer count.
const MAX_IN_FLIGHT: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    Relay,
}

impl CandidateType {
    fn type_preference(self) -> u32 {
        match self {
            CandidateType::Host => 126,
            CandidateType::ServerReflexive => 100,
            CandidateType::Relay => 0,
        }
    }
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CandidateType::Host => f.write_str("host"),
            CandidateType::ServerReflexive => f.write_str("srflx"),
            CandidateType::Relay => f.write_str("relay"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

/// A parsed `candidate:` attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub foundation: String,
    pub component: u8,
    pub transport: Transport,
    pub priority: u32,
    pub address: String,
    pub port: u16,
    pub candidate_type: CandidateType,
    pub raddr: Option<String>,
    pub rport: Option<u16>,
}

impl IceCandidate {
    /// A component-1 UDP candidate with its priority computed from the type.
    pub fn udp(foundation: &str, candidate_type: CandidateType, addr: SocketAddr) -> Self {
        Self {
            foundation: foundation.to_string(),
            component: 1,
            transport: Transport::Udp,
            priority: compute_priority(candidate_type, 65535, 1),
            address: addr.ip().to_string(),
            port: addr.port(),
            candidate_type,
            raddr: None,
            rport: None,
        }
    }

    pub fn with_related(mut self, related: SocketAddr) -> Self {
        self.raddr = Some(related.ip().to_string());
        self.rport = Some(related.port());
        self
    }

    /// Candidate attribute value without the `a=` prefix.
    pub fn to_attribute(&self) -> String {
        let transport = match self.transport {
            Transport::Udp => "UDP",
            Transport::Tcp => "TCP",
        };
        let mut line = format!(
            "candidate:{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            transport,
            self.priority,
            self.address,
            self.port,
            self.candidate_type
        );
        if let (Some(raddr), Some(rport)) = (&self.raddr, self.rport) {
            line.push_str(&format!(" raddr {} rport {}", raddr, rport));
        }
        line
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        let ip: IpAddr = self.address.parse().ok()?;
        Some(SocketAddr::new(ip, self.port))
    }
}

/// Parse an `a=candidate:` line or a bare `candidate:` attribute value.
pub fn parse_candidate(line: &str) -> Result<IceCandidate> {
    let line = line.trim();
    let content = line
        .strip_prefix("a=candidate:")
        .or_else(|| line.strip_prefix("candidate:"));
    let Some(content) = content else {
        bail!("not a candidate line: {}", line);
    };

    let parts: Vec<&str> = content.split_whitespace().collect();
    if parts.len() < 8 {
        bail!("candidate line too short: {}", line);
    }

    let foundation = parts[0].to_string();
    let component: u8 = parts[1].parse().context("bad component")?;
    let transport = match parts[2].to_ascii_uppercase().as_str() {
        "UDP" => Transport::Udp,
        "TCP" => Transport::Tcp,
        other => bail!("unsupported transport: {}", other),
    };
    let priority: u32 = parts[3].parse().context("bad priority")?;
    let address = parts[4].to_string();
    let port: u16 = parts[5].parse().context("bad port")?;

    if parts[6] != "typ" {
        bail!("expected 'typ' at position 6, got: {}", parts[6]);
    }
    let candidate_type = match parts[7] {
        "host" => CandidateType::Host,
        "srflx" => CandidateType::ServerReflexive,
        "relay" => CandidateType::Relay,
        other => bail!("unknown candidate type: {}", other),
    };

    let mut raddr = None;
    let mut rport = None;
    let mut rest = parts[8..].iter();
    while let Some(key) = rest.next() {
        match *key {
            "raddr" => raddr = rest.next().map(|v| v.to_string()),
            "rport" => {
                if let Some(v) = rest.next() {
                    rport = Some(v.parse().context("bad rport")?);
                }
            }
            // Extensions like generation/ufrag/network-id come in pairs.
            _ => {
                rest.next();
            }
        }
    }

    Ok(IceCandidate {
        foundation,
        component,
        transport,
        priority,
        address,
        port,
        candidate_type,
        raddr,
        rport,
    })
}

/// Candidate priority per RFC 8445 section 5.1.2.1.
pub fn compute_priority(ctype: CandidateType, local_preference: u16, component: u8) -> u32 {
    (ctype.type_preference() << 24) | ((local_preference as u32) << 8) | (256 - component as u32)
}

/// Host/port of a `stun:` URL, or None for other schemes (`turn:` etc.).
pub fn stun_server_address(url: &str) -> Option<String> {
    let rest = url.trim().strip_prefix("stun:")?;
    let rest = rest.split('?').next().unwrap_or(rest);
    if rest.is_empty() {
        return None;
    }
    if rest.rsplit_once(':').is_some_and(|(_, port)| port.parse::<u16>().is_ok()) {
        Some(rest.to_string())
    } else {
        Some(format!("{}:{}", rest, STUN_DEFAULT_PORT))
    }
}

/// The address the OS would use to reach the public internet. Connecting a
/// UDP socket sends nothing; it only selects the outbound interface.
pub fn local_ip() -> IpAddr {
    if let Ok(socket) = std::net::UdpSocket::bind("0.0.0.0:0") {
        if socket.connect("8.8.8.8:80").is_ok() {
            if let Ok(addr) = socket.local_addr() {
                return addr.ip();
            }
        }
    }
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

/// Host candidate for a socket bound to `local_addr`.
pub fn gather_host_candidate(local_addr: SocketAddr) -> IceCandidate {
    let addr = if local_addr.ip().is_unspecified() {
        SocketAddr::new(local_ip(), local_addr.port())
    } else {
        local_addr
    };
    IceCandidate::udp("1", CandidateType::Host, addr)
}

/// Ask `stun_server` (host:port) for our public mapping. None if the server
/// is unreachable or never answers.
pub async fn gather_srflx_candidate(socket: &UdpSocket, stun_server: &str) -> Option<IceCandidate> {
    let server = match tokio::net::lookup_host(stun_server).await {
        Ok(mut addrs) => addrs.find(|a| a.is_ipv4())?,
        Err(e) => {
            tracing::debug!("Failed to resolve STUN server {}: {}", stun_server, e);
            return None;
        }
    };
    let local = socket.local_addr().ok()?;

    let request = StunMessage::binding_request();
    let bytes = request.encode(None);
    let mut buf = [0u8; 512];

    for attempt in 1..=STUN_ATTEMPTS {
        if let Err(e) = socket.send_to(&bytes, server).await {
            tracing::debug!("STUN send to {} failed: {}", server, e);
            return None;
        }

        let reply = tokio::time::timeout(STUN_TIMEOUT, async {
            loop {
                let (len, from) = socket.recv_from(&mut buf).await?;
                if from != server {
                    continue;
                }
                match StunMessage::decode(&buf[..len]) {
                    Some(m) if m.transaction_id == request.transaction_id => {
                        return Ok::<_, std::io::Error>(m)
                    }
                    _ => continue,
                }
            }
        })
        .await;

        match reply {
            Ok(Ok(message)) => {
                let mapped = message.mapped_address()?;
                let related = gather_host_candidate(local).socket_addr().unwrap_or(local);
                return Some(
                    IceCandidate::udp("2", CandidateType::ServerReflexive, mapped)
                        .with_related(related),
                );
            }
            Ok(Err(e)) => {
                tracing::debug!("STUN receive from {} failed: {}", server, e);
                return None;
            }
            Err(_) => tracing::debug!("STUN request to {} timed out (attempt {})", server, attempt),
        }
    }

    None
}

/// Short-term credentials from `a=ice-ufrag` / `a=ice-pwd`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCredentials {
    pub ufrag: String,
    pub pwd: String,
}

/// Pacing for connectivity checks and consent freshness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckTimers {
    /// Gap between check rounds.
    pub interval: Duration,
    /// How long after the remote credentials arrive a pair must have worked.
    pub connect_timeout: Duration,
    /// Gap between consent checks on the selected pair.
    pub keepalive: Duration,
    /// Silence on the selected pair for this long means the path is gone.
    pub consent_timeout: Duration,
}

impl Default for CheckTimers {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(10),
            keepalive: Duration::from_secs(2),
            consent_timeout: Duration::from_secs(8),
        }
    }
}

/// Terminal outcomes of the checklist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    /// No pair answered before the connect timeout.
    Failed,
    /// The selected pair stopped answering consent checks.
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketOutcome {
    /// A valid check from the peer. Send these bytes back to the sender.
    Reply(Vec<u8>),
    /// The first successful check. The pair to this address is in use.
    Selected(SocketAddr),
    Ignored,
}

/// Requests to send this round, and a verdict once checking is over.
#[derive(Debug, Default)]
pub struct CheckRound {
    pub requests: Vec<(SocketAddr, Vec<u8>)>,
    pub verdict: Option<Connectivity>,
}

#[derive(Debug)]
struct Pair {
    remote: SocketAddr,
    in_flight: VecDeque<TransactionId>,
}

/// Connectivity checks for one component over one local socket.
///
/// Pure state: the caller owns the socket, feeds in every datagram with
/// [`Checklist::handle_packet`] and calls [`Checklist::poll`] on a timer.
#[derive(Debug)]
pub struct Checklist {
    local: IceCredentials,
    remote: Option<IceCredentials>,
    controlling: bool,
    tie_breaker: u64,
    priority: u32,
    timers: CheckTimers,
    pairs: Vec<Pair>,
    selected: Option<SocketAddr>,
    started: Option<Instant>,
    last_heard: Option<Instant>,
    last_keepalive: Option<Instant>,
}

impl Checklist {
    pub fn new(local: IceCredentials, controlling: bool, timers: CheckTimers) -> Self {
        let id = uuid::Uuid::new_v4();
        let mut tie_breaker = [0u8; 8];
        tie_breaker.copy_from_slice(&id.as_bytes()[..8]);
        Self {
            local,
            remote: None,
            controlling,
            tie_breaker: u64::from_be_bytes(tie_breaker),
            priority: compute_priority(CandidateType::Host, 65535, 1),
            timers,
            pairs: Vec::new(),
            selected: None,
            started: None,
            last_heard: None,
            last_keepalive: None,
        }
    }

    pub fn selected(&self) -> Option<SocketAddr> {
        self.selected
    }

    /// Checks start once the remote credentials are known; so does the
    /// connect timeout.
    pub fn set_remote_credentials(&mut self, remote: IceCredentials, now: Instant) {
        self.remote = Some(remote);
        self.started.get_or_insert(now);
    }

    /// Returns false if the address was already on the list.
    pub fn add_remote_candidate(&mut self, remote: SocketAddr) -> bool {
        if self.pairs.iter().any(|p| p.remote == remote) {
            return false;
        }
        self.pairs.push(Pair {
            remote,
            in_flight: VecDeque::new(),
        });
        true
    }

    pub fn handle_packet(&mut self, data: &[u8], from: SocketAddr, now: Instant) -> PacketOutcome {
        let Some(message) = StunMessage::decode(data) else {
            return PacketOutcome::Ignored;
        };
        match message.message_type {
            MessageType::BindingRequest => self.on_request(&message, data, from),
            MessageType::BindingSuccess => self.on_success(&message, data, now),
            MessageType::BindingError => {
                tracing::debug!("Binding error response from {}", from);
                PacketOutcome::Ignored
            }
        }
    }

    fn on_request(&mut self, message: &StunMessage, data: &[u8], from: SocketAddr) -> PacketOutcome {
        let ours = message
            .username()
            .and_then(|u| u.split_once(':'))
            .is_some_and(|(ufrag, _)| ufrag == self.local.ufrag);
        if !ours {
            tracing::trace!("Check from {} for another username ignored", from);
            return PacketOutcome::Ignored;
        }
        if !stun::verify_integrity(data, self.local.pwd.as_bytes()) {
            tracing::debug!("Check from {} failed MESSAGE-INTEGRITY", from);
            return PacketOutcome::Ignored;
        }

        if self.add_remote_candidate(from) {
            tracing::debug!("Peer-reflexive remote candidate {}", from);
        }
        let response = StunMessage::success_response(message.transaction_id, from);
        PacketOutcome::Reply(response.encode(Some(self.local.pwd.as_bytes())))
    }

    fn on_success(&mut self, message: &StunMessage, data: &[u8], now: Instant) -> PacketOutcome {
        let Some(remote) = &self.remote else {
            return PacketOutcome::Ignored;
        };
        let Some(pair) = self
            .pairs
            .iter_mut()
            .find(|p| p.in_flight.contains(&message.transaction_id))
        else {
            return PacketOutcome::Ignored;
        };
        if !stun::verify_integrity(data, remote.pwd.as_bytes()) {
            tracing::debug!("Response from {} failed MESSAGE-INTEGRITY", pair.remote);
            return PacketOutcome::Ignored;
        }

        pair.in_flight.clear();
        let addr = pair.remote;
        self.last_heard = Some(now);
        if self.selected.is_some() {
            return PacketOutcome::Ignored;
        }
        tracing::info!("ICE pair to {} succeeded", addr);
        self.selected = Some(addr);
        PacketOutcome::Selected(addr)
    }

    /// Work due at `now`: checks on every pair until one succeeds, then
    /// consent checks on the selected pair only.
    pub fn poll(&mut self, now: Instant) -> CheckRound {
        let mut round = CheckRound::default();
        let Some(remote) = self.remote.clone() else {
            return round;
        };

        match self.selected {
            None => {
                let waited = self
                    .started
                    .map_or(Duration::ZERO, |t| now.saturating_duration_since(t));
                if waited >= self.timers.connect_timeout {
                    round.verdict = Some(Connectivity::Failed);
                    return round;
                }
                for index in 0..self.pairs.len() {
                    round.requests.push(self.request(index, &remote));
                }
            }
            Some(selected) => {
                let heard = self.last_heard.unwrap_or(now);
                if now.saturating_duration_since(heard) >= self.timers.consent_timeout {
                    round.verdict = Some(Connectivity::Disconnected);
                    return round;
                }
                let due = self
                    .last_keepalive
                    .map_or(true, |t| now.saturating_duration_since(t) >= self.timers.keepalive);
                if due {
                    if let Some(index) = self.pairs.iter().position(|p| p.remote == selected) {
                        round.requests.push(self.request(index, &remote));
                    }
                    self.last_keepalive = Some(now);
                }
            }
        }
        round
    }

    fn request(&mut self, index: usize, remote: &IceCredentials) -> (SocketAddr, Vec<u8>) {
        let message = StunMessage::binding_request()
            .with(attr::USERNAME, format!("{}:{}", remote.ufrag, self.local.ufrag))
            .with(attr::PRIORITY, self.priority.to_be_bytes());
        let message = if self.controlling {
            message
                .with(attr::ICE_CONTROLLING, self.tie_breaker.to_be_bytes())
                .with(attr::USE_CANDIDATE, Vec::new())
        } else {
            message.with(attr::ICE_CONTROLLED, self.tie_breaker.to_be_bytes())
        };

        let pair = &mut self.pairs[index];
        pair.in_flight.push_back(message.transaction_id);
        if pair.in_flight.len() > MAX_IN_FLIGHT {
            pair.in_flight.pop_front();
        }
        (pair.remote, message.encode(Some(remote.pwd.as_bytes())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_candidate() {
        let c = parse_candidate("a=candidate:1 1 UDP 2130706431 10.0.0.1 21730 typ host").unwrap();
        assert_eq!(c.foundation, "1");
        assert_eq!(c.component, 1);
        assert_eq!(c.transport, Transport::Udp);
        assert_eq!(c.priority, 2130706431);
        assert_eq!(c.address, "10.0.0.1");
        assert_eq!(c.port, 21730);
        assert_eq!(c.candidate_type, CandidateType::Host);
        assert!(c.raddr.is_none());
    }

    #[test]
    fn test_parse_browser_srflx_candidate() {
        let c = parse_candidate(
            "candidate:842163049 1 udp 1677729535 203.0.113.7 54400 typ srflx \
             raddr 192.168.1.5 rport 54400 generation 0 ufrag Ab12 network-cost 999",
        )
        .unwrap();
        assert_eq!(c.candidate_type, CandidateType::ServerReflexive);
        assert_eq!(c.raddr.as_deref(), Some("192.168.1.5"));
        assert_eq!(c.rport, Some(54400));
        assert_eq!(
            c.socket_addr(),
            Some("203.0.113.7:54400".parse().unwrap())
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_candidate("candidate:bogus").is_err());
        assert!(parse_candidate("a=mid:0").is_err());
        assert!(parse_candidate("candidate:1 1 UDP 1 10.0.0.1 9 typ weird").is_err());
        assert!(parse_candidate("candidate:1 1 SCTP 1 10.0.0.1 9 typ host").is_err());
    }

    #[test]
    fn test_attribute_round_trip() {
        let c = IceCandidate::udp(
            "2",
            CandidateType::ServerReflexive,
            "198.51.100.4:40000".parse().unwrap(),
        )
        .with_related("192.168.0.9:40000".parse().unwrap());
        let attr = c.to_attribute();
        assert!(attr.starts_with("candidate:2 1 UDP "));
        assert!(attr.ends_with("typ srflx raddr 192.168.0.9 rport 40000"));
        assert_eq!(parse_candidate(&attr).unwrap(), c);
    }

    #[test]
    fn test_compute_priority() {
        assert_eq!(compute_priority(CandidateType::Host, 65535, 1), 2130706431);
        assert!(
            compute_priority(CandidateType::Host, 65535, 1)
                > compute_priority(CandidateType::ServerReflexive, 65535, 1)
        );
        assert!(
            compute_priority(CandidateType::ServerReflexive, 65535, 1)
                > compute_priority(CandidateType::Relay, 65535, 1)
        );
    }

    #[test]
    fn test_stun_server_address() {
        assert_eq!(
            stun_server_address("stun:stun.l.google.com:19302").as_deref(),
            Some("stun.l.google.com:19302")
        );
        assert_eq!(
            stun_server_address("stun:stun.example.org").as_deref(),
            Some("stun.example.org:3478")
        );
        assert_eq!(stun_server_address("turn:turn.example.org:3478"), None);
        assert_eq!(stun_server_address("stun:"), None);
    }

    #[test]
    fn test_host_candidate_for_bound_address() {
        let c = gather_host_candidate("192.168.1.20:5000".parse().unwrap());
        assert_eq!(c.address, "192.168.1.20");
        assert_eq!(c.port, 5000);
        assert_eq!(c.candidate_type, CandidateType::Host);

        let c = gather_host_candidate("0.0.0.0:6000".parse().unwrap());
        assert_eq!(c.port, 6000);
        assert_ne!(c.address, "0.0.0.0");
    }

    #[tokio::test]
    async fn test_srflx_against_local_responder() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(len, stun::HEADER_LEN);
            let request = StunMessage::decode(&buf[..len]).unwrap();
            let mapped = "198.51.100.1:4242".parse().unwrap();
            let response = StunMessage::success_response(request.transaction_id, mapped);
            server.send_to(&response.encode(None), from).await.unwrap();
        });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let c = gather_srflx_candidate(&client, &server_addr.to_string())
            .await
            .unwrap();
        assert_eq!(c.candidate_type, CandidateType::ServerReflexive);
        assert_eq!(c.address, "198.51.100.1");
        assert_eq!(c.port, 4242);
        assert_eq!(c.raddr.as_deref(), Some("127.0.0.1"));
    }

    fn creds(ufrag: &str) -> IceCredentials {
        IceCredentials {
            ufrag: ufrag.to_string(),
            pwd: format!("{}-0123456789abcdef", ufrag),
        }
    }

    fn timers() -> CheckTimers {
        CheckTimers {
            interval: Duration::from_millis(10),
            connect_timeout: Duration::from_secs(1),
            keepalive: Duration::from_millis(100),
            consent_timeout: Duration::from_millis(500),
        }
    }

    const A: &str = "10.0.0.1:5000";
    const B: &str = "10.0.0.2:6000";

    /// Controlling `a` and controlled `b`, each knowing the other's credentials.
    fn agents(now: Instant) -> (Checklist, Checklist) {
        let mut a = Checklist::new(creds("aaaa"), true, timers());
        let mut b = Checklist::new(creds("bbbb"), false, timers());
        a.set_remote_credentials(creds("bbbb"), now);
        b.set_remote_credentials(creds("aaaa"), now);
        (a, b)
    }

    fn reply(outcome: PacketOutcome) -> Vec<u8> {
        match outcome {
            PacketOutcome::Reply(bytes) => bytes,
            other => panic!("expected a reply, got {:?}", other),
        }
    }

    #[test]
    fn test_check_selects_pair_on_both_sides() {
        let now = Instant::now();
        let (a_addr, b_addr): (SocketAddr, SocketAddr) = (A.parse().unwrap(), B.parse().unwrap());
        let (mut a, mut b) = agents(now);
        assert!(a.add_remote_candidate(b_addr));
        assert!(!a.add_remote_candidate(b_addr));

        let round = a.poll(now);
        assert!(round.verdict.is_none());
        assert_eq!(round.requests.len(), 1);
        let (to, request) = &round.requests[0];
        assert_eq!(*to, b_addr);
        let decoded = StunMessage::decode(request).unwrap();
        assert_eq!(decoded.username(), Some("bbbb:aaaa"));
        assert!(decoded.attribute(attr::USE_CANDIDATE).is_some());

        let response = reply(b.handle_packet(request, a_addr, now));
        assert_eq!(
            a.handle_packet(&response, b_addr, now),
            PacketOutcome::Selected(b_addr)
        );
        assert_eq!(a.selected(), Some(b_addr));
        // A replayed response no longer matches anything in flight.
        assert_eq!(a.handle_packet(&response, b_addr, now), PacketOutcome::Ignored);

        // b learned a from the incoming check and now checks it back.
        let round = b.poll(now);
        assert_eq!(round.requests.len(), 1);
        assert_eq!(round.requests[0].0, a_addr);
        let response = reply(a.handle_packet(&round.requests[0].1, b_addr, now));
        assert_eq!(
            b.handle_packet(&response, a_addr, now),
            PacketOutcome::Selected(a_addr)
        );
    }

    #[test]
    fn test_check_with_wrong_credentials_is_ignored() {
        let now = Instant::now();
        let (mut a, _) = agents(now);
        a.add_remote_candidate(B.parse().unwrap());
        let request = a.poll(now).requests.remove(0).1;

        let mut wrong_pwd = Checklist::new(
            IceCredentials {
                ufrag: "bbbb".into(),
                pwd: "some-other-password".into(),
            },
            false,
            timers(),
        );
        let from: SocketAddr = A.parse().unwrap();
        assert_eq!(wrong_pwd.handle_packet(&request, from, now), PacketOutcome::Ignored);

        let mut wrong_ufrag = Checklist::new(creds("cccc"), false, timers());
        assert_eq!(wrong_ufrag.handle_packet(&request, from, now), PacketOutcome::Ignored);
        assert_eq!(wrong_ufrag.handle_packet(b"\x80junk", from, now), PacketOutcome::Ignored);
    }

    #[test]
    fn test_no_checks_before_remote_credentials() {
        let now = Instant::now();
        let mut a = Checklist::new(creds("aaaa"), true, timers());
        a.add_remote_candidate(B.parse().unwrap());
        let round = a.poll(now + Duration::from_secs(60));
        assert!(round.requests.is_empty());
        assert!(round.verdict.is_none());
    }

    #[test]
    fn test_unanswered_checks_fail() {
        let now = Instant::now();
        let (mut a, _) = agents(now);
        a.add_remote_candidate("192.0.2.1:9".parse().unwrap());

        assert_eq!(a.poll(now).requests.len(), 1);
        assert!(a.poll(now + Duration::from_millis(900)).verdict.is_none());
        let round = a.poll(now + Duration::from_secs(1));
        assert_eq!(round.verdict, Some(Connectivity::Failed));
        assert!(round.requests.is_empty());
    }

    #[test]
    fn test_no_candidates_at_all_fails() {
        let now = Instant::now();
        let (mut a, _) = agents(now);
        assert_eq!(
            a.poll(now + Duration::from_secs(2)).verdict,
            Some(Connectivity::Failed)
        );
    }

    #[test]
    fn test_consent_keeps_pair_alive_until_peer_goes_quiet() {
        let now = Instant::now();
        let (a_addr, b_addr): (SocketAddr, SocketAddr) = (A.parse().unwrap(), B.parse().unwrap());
        let (mut a, mut b) = agents(now);
        a.add_remote_candidate(b_addr);
        let request = a.poll(now).requests.remove(0).1;
        let response = reply(b.handle_packet(&request, a_addr, now));
        assert_eq!(a.handle_packet(&response, b_addr, now), PacketOutcome::Selected(b_addr));

        // Consent check answered at 400ms pushes the deadline out.
        let at = now + Duration::from_millis(400);
        let round = a.poll(at);
        assert!(round.verdict.is_none());
        assert_eq!(round.requests.len(), 1);
        let response = reply(b.handle_packet(&round.requests[0].1, a_addr, at));
        assert_eq!(a.handle_packet(&response, b_addr, at), PacketOutcome::Ignored);
        assert!(a.poll(now + Duration::from_millis(800)).verdict.is_none());

        // Nothing answered after that.
        let round = a.poll(now + Duration::from_millis(900));
        assert_eq!(round.verdict, Some(Connectivity::Disconnected));
    }
}
