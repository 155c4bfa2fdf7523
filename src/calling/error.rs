//! Errors surfaced by call operations.

use crate::channel::ChannelError;

use super::media::MediaError;
use super::peer::PeerError;
use super::CallStatus;

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("cannot {action} while {status}")]
    InvalidState {
        action: &'static str,
        status: CallStatus,
    },

    #[error("cannot call yourself")]
    SelfCall,

    #[error("no caller recorded for the incoming call")]
    UnknownCaller,

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}
