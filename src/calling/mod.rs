//! Calling: ring signaling (`call.*`), WebRTC negotiation (`webrtc.*`) and
//! the peer connection / local media they drive.

pub mod driver;
pub mod error;
pub mod ice;
pub mod local_peer;
pub mod media;
pub mod peer;
pub mod router;
pub mod sdp;
pub mod session;
pub mod signal;
pub mod stun;
pub mod synthetic;

#[cfg(test)]
mod testing;

use std::fmt;

/// Where the local side is in the call lifecycle. Exactly one at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Idle,
    /// We rang someone and are waiting for an answer.
    Outgoing,
    /// Someone is ringing us.
    Incoming,
    Active,
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallStatus::Idle => "idle",
            CallStatus::Outgoing => "outgoing",
            CallStatus::Incoming => "incoming",
            CallStatus::Active => "active",
        };
        f.write_str(s)
    }
}
