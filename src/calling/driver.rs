//! The call driver: owns the session and feeds it inbound frames, peer
//! connection events and user commands, one at a time.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::channel::{ChannelEvent, Inbound, SignalChannel};

use super::router::SignalRouter;
use super::session::{CallNotice, CallSession, EndReason, SessionChannels};
use super::signal::ParticipantId;
use super::CallStatus;

/// How long to wait for queued signals (e.g. the final `call.end`) to go
/// out after the channel is closed.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq)]
pub enum UserCommand {
    Call(ParticipantId),
    Accept,
    Reject,
    End,
    Mute,
    Video,
    Status,
    Quit,
}

impl FromStr for UserCommand {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            bail!("empty command");
        };
        let command = match verb.to_ascii_lowercase().as_str() {
            "call" => match words.next() {
                Some(target) => UserCommand::Call(target.into()),
                None => bail!("usage: call <participant>"),
            },
            "accept" | "a" => UserCommand::Accept,
            "reject" | "r" => UserCommand::Reject,
            "end" | "hangup" => UserCommand::End,
            "mute" | "m" => UserCommand::Mute,
            "video" | "v" => UserCommand::Video,
            "status" | "s" => UserCommand::Status,
            "quit" | "exit" | "q" => UserCommand::Quit,
            other => bail!("unknown command: {}", other),
        };
        Ok(command)
    }
}

pub const HELP: &str =
    "Commands: call <id>, accept, reject, end, mute, video, status, quit";

/// Read commands from stdin until EOF. Lines that do not parse are
/// reported and skipped.
pub fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<UserCommand> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match line.parse::<UserCommand>() {
                    Ok(cmd) => {
                        if tx.send(cmd).is_err() {
                            return;
                        }
                    }
                    Err(e) => println!("{}. {}", e, HELP),
                },
                Ok(None) => return,
                Err(e) => {
                    tracing::warn!("stdin read failed: {}", e);
                    return;
                }
            }
        }
    });
    rx
}

pub struct CallDriver {
    session: CallSession,
    channels: SessionChannels,
    router: SignalRouter,
    channel: SignalChannel,
}

impl CallDriver {
    pub fn new(session: CallSession, channels: SessionChannels, channel: SignalChannel) -> Self {
        let router = SignalRouter::new(session.local_participant_id().clone());
        Self {
            session,
            channels,
            router,
            channel,
        }
    }

    /// Run until `quit`, Ctrl-C, or the channel task stops. Any call in
    /// progress is ended before returning.
    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<UserCommand>,
        dial: Option<ParticipantId>,
    ) -> Result<()> {
        if let Some(target) = dial {
            self.execute(UserCommand::Call(target)).await;
        }

        let mut commands_open = true;
        loop {
            tokio::select! {
                item = self.channel.inbound.recv() => match item {
                    Some(item) => handle_inbound(&self.router, &mut self.session, item).await,
                    None => {
                        tracing::warn!("Signal channel task stopped");
                        break;
                    }
                },
                Some(event) = self.channels.peer_events.recv() => {
                    self.session.handle_peer_event(event);
                }
                Some(notice) = self.channels.notices.recv() => {
                    print_notice(&notice);
                }
                cmd = commands.recv(), if commands_open => match cmd {
                    Some(UserCommand::Quit) => break,
                    Some(cmd) => self.execute(cmd).await,
                    None => {
                        tracing::debug!("Command input closed");
                        commands_open = false;
                    }
                },
                _ = tokio::signal::ctrl_c() => {
                    println!("Shutting down...");
                    break;
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn execute(&mut self, cmd: UserCommand) {
        let result = match cmd {
            UserCommand::Call(target) => self.session.start_call(target).await,
            UserCommand::Accept => self.session.accept_call().await,
            UserCommand::Reject => self.session.reject_call(),
            UserCommand::End => self.session.end_call(),
            UserCommand::Mute => {
                let on = self.session.toggle_audio();
                println!("Microphone {}", if on { "on" } else { "muted" });
                Ok(())
            }
            UserCommand::Video => {
                let on = self.session.toggle_video();
                println!("Camera {}", if on { "on" } else { "off" });
                Ok(())
            }
            UserCommand::Status => {
                self.print_status();
                Ok(())
            }
            UserCommand::Quit => Ok(()),
        };
        if let Err(e) = result {
            println!("Error: {}", e);
        }
    }

    fn print_status(&self) {
        let session = &self.session;
        match session.remote_participant_id() {
            Some(remote) => println!("Status: {} ({})", session.status(), remote),
            None => println!("Status: {}", session.status()),
        }
        if let Some(stream) = session.local_stream() {
            println!(
                "  Local: {} track(s), mic {}, camera {}",
                stream.tracks().len(),
                if session.audio_enabled() { "on" } else { "muted" },
                if session.video_enabled() { "on" } else { "off" },
            );
        }
        if let Some(stream) = session.remote_stream() {
            println!("  Remote: {} track(s)", stream.tracks().len());
        }
        if let Some(peer) = session.peer().current_remote_participant_id() {
            println!(
                "  Negotiating with {} ({} connection(s) so far)",
                peer,
                session.peer().connections_created()
            );
        }
    }

    async fn shutdown(mut self) {
        if self.session.status() != CallStatus::Idle {
            if let Err(e) = self.session.end_call() {
                tracing::warn!("Failed to end call on shutdown: {}", e);
            }
        }
        while let Ok(notice) = self.channels.notices.try_recv() {
            print_notice(&notice);
        }

        self.channel.handle.close();
        if tokio::time::timeout(FLUSH_TIMEOUT, &mut self.channel.task)
            .await
            .is_err()
        {
            tracing::debug!("Signal channel did not close in time");
            self.channel.task.abort();
        }
    }
}

/// Apply one item from the signal channel to the session.
pub async fn handle_inbound(router: &SignalRouter, session: &mut CallSession, item: Inbound) {
    match item {
        Inbound::Frame(frame) => {
            router.dispatch(session, &frame).await;
        }
        Inbound::Lifecycle(ChannelEvent::Connected) => {
            println!("Signal channel connected as {}", session.local_participant_id());
        }
        Inbound::Lifecycle(ChannelEvent::Disconnected(reason)) => {
            println!("Signal channel lost ({}); reconnecting...", reason);
            session.transport_lost();
        }
    }
}

fn timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}

pub fn print_notice(notice: &CallNotice) {
    let ts = timestamp();
    match notice {
        CallNotice::Status(status) => tracing::debug!("Status now {}", status),
        CallNotice::IncomingCall { from } => {
            println!("[{}] Incoming call from {} (accept / reject)", ts, from);
        }
        CallNotice::BusyRejected { caller } => {
            println!("[{}] {} called while busy; rejected", ts, caller);
        }
        CallNotice::Rejected { by, reason } => match reason {
            Some(reason) => println!("[{}] {} rejected the call ({})", ts, by, reason),
            None => println!("[{}] {} rejected the call", ts, by),
        },
        CallNotice::Ended { with, reason } => {
            let who = with
                .as_ref()
                .map(|p| format!(" with {}", p))
                .unwrap_or_default();
            let why = match reason {
                EndReason::Local => "hung up".to_string(),
                EndReason::Remote => "remote hung up".to_string(),
                EndReason::ConnectionLost(state) => format!("connection {}", state),
                EndReason::NegotiationFailed(e) => format!("negotiation failed: {}", e),
                EndReason::TransportLost => "signal channel lost".to_string(),
            };
            println!("[{}] Call{} ended ({})", ts, who, why);
        }
        CallNotice::Connected => println!("[{}] Media connected", ts),
        CallNotice::MediaError(e) => println!("[{}] Media error: {}", ts, e),
        CallNotice::RemoteStream(stream) => {
            let labels: Vec<String> = stream
                .tracks()
                .iter()
                .map(|t| format!("{} ({})", t.kind(), t.label()))
                .collect();
            println!("[{}] Remote stream: {}", ts, labels.join(", "));
        }
    }
}
