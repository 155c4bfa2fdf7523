//! Signal channel adapter.
//!
//! Wraps the chat socket used for signaling. The call core only sees
//! [`SignalSink::send`] and a queue of inbound frames; connecting,
//! reconnecting and closing the socket happen in a background task that
//! knows nothing about call state.

mod websocket;

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::calling::signal::{ParticipantId, Signal, SignalError};

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("signal channel closed")]
    Closed,

    #[error(transparent)]
    Encode(#[from] SignalError),
}

/// Outbound half of the signal channel.
pub trait SignalSink: Send + Sync {
    fn send(&self, signal: Signal) -> Result<(), ChannelError>;
}

/// Connection lifecycle changes, reported alongside inbound frames.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Connected,
    Disconnected(String),
}

/// Items delivered from the channel task, in socket order.
#[derive(Debug)]
pub enum Inbound {
    Frame(String),
    Lifecycle(ChannelEvent),
}

enum Command {
    Send(String),
    Close,
}

#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Upper bound for the reconnect backoff.
    pub max_backoff: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            max_backoff: Duration::from_secs(64),
        }
    }
}

/// Handle for sending signals and closing the channel.
#[derive(Clone)]
pub struct ChannelHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl ChannelHandle {
    /// Ask the channel task to close the socket and stop reconnecting.
    pub fn close(&self) {
        if self.commands.send(Command::Close).is_err() {
            tracing::debug!("Signal channel already stopped");
        }
    }
}

impl SignalSink for ChannelHandle {
    fn send(&self, signal: Signal) -> Result<(), ChannelError> {
        let text = signal.encode()?;
        tracing::debug!("Signal out: {} -> {:?}", signal.kind.type_name(), signal.to);
        self.commands
            .send(Command::Send(text))
            .map_err(|_| ChannelError::Closed)
    }
}

/// Build the socket URL for `participant`: the base URL with a
/// `participant=<id>` query parameter appended.
pub fn endpoint(base: &str, participant: &ParticipantId) -> Result<String> {
    anyhow::ensure!(
        base.starts_with("ws://") || base.starts_with("wss://"),
        "signaling URL must use ws:// or wss://, got {}",
        base
    );
    let sep = if base.contains('?') { '&' } else { '?' };
    Ok(format!("{}{}participant={}", base, sep, participant))
}

/// A running signal channel: the send/close handle, inbound frames, and
/// the background task (await it after `close()` to let queued signals
/// go out).
pub struct SignalChannel {
    pub handle: ChannelHandle,
    pub inbound: mpsc::UnboundedReceiver<Inbound>,
    pub task: JoinHandle<()>,
}

/// Spawn the channel task for `url`.
///
/// Signals sent before the socket is up (or while it is reconnecting) are
/// queued and flushed once connected.
pub fn spawn(url: &str, options: ChannelOptions) -> Result<SignalChannel> {
    let url = url.to_string();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();

    let task = tokio::runtime::Handle::try_current()
        .context("Signal channel needs a running tokio runtime")?
        .spawn(websocket::run(url, options, cmd_rx, in_tx));

    Ok(SignalChannel {
        handle: ChannelHandle { commands: cmd_tx },
        inbound: in_rx,
        task,
    })
}
