//! SDP offer/answer generation and parsing for the local peer backend.
//!
//! Emits one `m=` section per media kind with its own `a=mid`, fresh ICE
//! credentials at session level, and `a=rtcp-mux`. Parsing extracts the
//! credentials, the audio/video sections with their direction, and any
//! candidates carried inline.

use std::fmt;
use std::net::IpAddr;

use anyhow::{bail, Result};

use super::ice::{self, IceCandidate};
use super::media::TrackKind;

const AUDIO_CODEC: (u8, &str) = (111, "opus/48000/2");
const VIDEO_CODEC: (u8, &str) = (96, "VP8/90000");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl Direction {
    fn from_flags(send: bool, recv: bool) -> Self {
        match (send, recv) {
            (true, true) => Direction::SendRecv,
            (true, false) => Direction::SendOnly,
            (false, true) => Direction::RecvOnly,
            (false, false) => Direction::Inactive,
        }
    }

    pub fn sends(self) -> bool {
        matches!(self, Direction::SendRecv | Direction::SendOnly)
    }

    pub fn receives(self) -> bool {
        matches!(self, Direction::SendRecv | Direction::RecvOnly)
    }

    /// Our direction in an answer to a section offered as `self`.
    pub fn answer(self, have_local: bool) -> Self {
        Self::from_flags(have_local && self.receives(), self.sends())
    }

    fn parse(attr: &str) -> Option<Self> {
        match attr {
            "sendrecv" => Some(Direction::SendRecv),
            "sendonly" => Some(Direction::SendOnly),
            "recvonly" => Some(Direction::RecvOnly),
            "inactive" => Some(Direction::Inactive),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Direction::SendRecv => "sendrecv",
            Direction::SendOnly => "sendonly",
            Direction::RecvOnly => "recvonly",
            Direction::Inactive => "inactive",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaSection {
    pub kind: TrackKind,
    pub mid: String,
    pub direction: Direction,
    pub candidates: Vec<IceCandidate>,
}

/// A session description reduced to what negotiation needs.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSdp {
    pub session_id: u64,
    pub address: IpAddr,
    pub ice_ufrag: String,
    pub ice_pwd: String,
    pub media: Vec<MediaSection>,
}

impl SessionSdp {
    /// One section per kind we send or want to receive, in audio, video
    /// order.
    pub fn offer(address: IpAddr, sending: &[TrackKind], receiving: &[TrackKind]) -> Self {
        let mut media = Vec::new();
        for kind in [TrackKind::Audio, TrackKind::Video] {
            let send = sending.contains(&kind);
            let recv = receiving.contains(&kind);
            if !send && !recv {
                continue;
            }
            media.push(MediaSection {
                kind,
                mid: media.len().to_string(),
                direction: Direction::from_flags(send, recv),
                candidates: Vec::new(),
            });
        }
        Self::with_media(address, media)
    }

    /// Answer `offer` section by section, keeping its mids and order.
    pub fn answer(address: IpAddr, offer: &SessionSdp, sending: &[TrackKind]) -> Self {
        let media = offer
            .media
            .iter()
            .map(|m| MediaSection {
                kind: m.kind,
                mid: m.mid.clone(),
                direction: m.direction.answer(sending.contains(&m.kind)),
                candidates: Vec::new(),
            })
            .collect();
        Self::with_media(address, media)
    }

    fn with_media(address: IpAddr, media: Vec<MediaSection>) -> Self {
        let (high, _) = uuid::Uuid::new_v4().as_u64_pair();
        Self {
            session_id: high >> 1,
            address,
            ice_ufrag: generate_ice_ufrag(),
            ice_pwd: generate_ice_pwd(),
            media,
        }
    }

    pub fn section(&self, mid: &str) -> Option<&MediaSection> {
        self.media.iter().find(|m| m.mid == mid)
    }

    pub fn to_sdp(&self) -> String {
        let ip_version = if self.address.is_ipv4() { "IP4" } else { "IP6" };
        let mut sdp = String::new();
        sdp.push_str("v=0\r\n");
        sdp.push_str(&format!(
            "o=- {} 2 IN {} {}\r\n",
            self.session_id, ip_version, self.address
        ));
        sdp.push_str("s=-\r\n");
        sdp.push_str("t=0 0\r\n");
        sdp.push_str(&format!("a=ice-ufrag:{}\r\n", self.ice_ufrag));
        sdp.push_str(&format!("a=ice-pwd:{}\r\n", self.ice_pwd));

        for m in &self.media {
            let (pt, rtpmap) = match m.kind {
                TrackKind::Audio => AUDIO_CODEC,
                TrackKind::Video => VIDEO_CODEC,
            };
            let port = m.candidates.first().map(|c| c.port).unwrap_or(9);
            sdp.push_str(&format!("m={} {} UDP/TLS/RTP/SAVPF {}\r\n", m.kind, port, pt));
            sdp.push_str(&format!("c=IN {} {}\r\n", ip_version, self.address));
            sdp.push_str(&format!("a=mid:{}\r\n", m.mid));
            sdp.push_str(&format!("a={}\r\n", m.direction));
            sdp.push_str("a=rtcp-mux\r\n");
            sdp.push_str(&format!("a=rtpmap:{} {}\r\n", pt, rtpmap));
            for c in &m.candidates {
                sdp.push_str(&format!("a={}\r\n", c.to_attribute()));
            }
        }
        sdp
    }

    /// Parse a remote description. Sections other than audio/video are
    /// skipped; a section without `a=mid` is named after its index.
    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
        if lines.next() != Some("v=0") {
            bail!("SDP must start with v=0");
        }

        let mut session_id = 0;
        let mut address: Option<IpAddr> = None;
        let mut ufrag = None;
        let mut pwd = None;
        let mut media: Vec<MediaSection> = Vec::new();
        // Whether the current m= section is one we keep.
        let mut in_kept = false;
        let mut index = 0usize;

        for line in lines {
            if let Some(m) = line.strip_prefix("m=") {
                let kind = match m.split_whitespace().next() {
                    Some("audio") => Some(TrackKind::Audio),
                    Some("video") => Some(TrackKind::Video),
                    _ => None,
                };
                in_kept = kind.is_some();
                if let Some(kind) = kind {
                    media.push(MediaSection {
                        kind,
                        mid: index.to_string(),
                        direction: Direction::SendRecv,
                        candidates: Vec::new(),
                    });
                }
                index += 1;
                continue;
            }

            if let Some(o) = line.strip_prefix("o=") {
                let fields: Vec<&str> = o.split_whitespace().collect();
                session_id = fields.get(1).and_then(|v| v.parse().ok()).unwrap_or(0);
                if address.is_none() {
                    address = fields.get(5).and_then(|v| v.parse().ok());
                }
                continue;
            }
            if let Some(c) = line.strip_prefix("c=") {
                if let Some(ip) = c.split_whitespace().nth(2).and_then(|v| v.parse().ok()) {
                    address = Some(ip);
                }
                continue;
            }

            let Some(attr) = line.strip_prefix("a=") else {
                continue;
            };
            if let Some(v) = attr.strip_prefix("ice-ufrag:") {
                ufrag.get_or_insert_with(|| v.to_string());
                continue;
            }
            if let Some(v) = attr.strip_prefix("ice-pwd:") {
                pwd.get_or_insert_with(|| v.to_string());
                continue;
            }

            let section = match media.last_mut() {
                Some(section) if in_kept => section,
                _ => continue,
            };
            if let Some(mid) = attr.strip_prefix("mid:") {
                section.mid = mid.to_string();
            } else if let Some(direction) = Direction::parse(attr) {
                section.direction = direction;
            } else if attr.starts_with("candidate:") {
                match ice::parse_candidate(attr) {
                    Ok(c) => section.candidates.push(c),
                    Err(e) => tracing::debug!("Skipping SDP candidate: {}", e),
                }
            }
        }

        let (Some(ice_ufrag), Some(ice_pwd)) = (ufrag, pwd) else {
            bail!("SDP has no ICE credentials");
        };
        if media.is_empty() {
            bail!("SDP has no audio or video section");
        }

        Ok(Self {
            session_id,
            address: address.unwrap_or(IpAddr::from([0, 0, 0, 0])),
            ice_ufrag,
            ice_pwd,
            media,
        })
    }
}

/// 8 alphanumeric characters (ICE requires at least 4).
pub fn generate_ice_ufrag() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// 24 hex characters (ICE requires 22 to 256).
pub fn generate_ice_pwd() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..24].to_string()
}
