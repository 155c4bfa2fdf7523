//! WebSocket connection and reconnect loop for the signal channel.

use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::{ChannelEvent, ChannelOptions, Command, Inbound};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

struct SignalSocket {
    stream: WsStream,
}

impl SignalSocket {
    async fn connect(url: &str) -> Result<Self> {
        tracing::info!("Connecting signal channel to {}", url);

        let (stream, response) = connect_async(url)
            .await
            .context("WebSocket connection failed")?;

        tracing::info!("Signal channel connected (status={})", response.status());

        Ok(Self { stream })
    }

    async fn send_text(&mut self, msg: String) -> Result<()> {
        tracing::trace!("WS send: {}", msg);
        self.stream
            .send(Message::Text(msg))
            .await
            .context("Failed to send WebSocket message")
    }

    /// Receive the next text frame, answering pings along the way.
    ///
    /// Returns `Ok(None)` when the server closed the connection.
    async fn recv_frame(&mut self) -> Result<Option<String>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    tracing::trace!("WS recv: {}", text);
                    return Ok(Some(text));
                }
                Some(Ok(Message::Ping(data))) => {
                    self.stream
                        .send(Message::Pong(data))
                        .await
                        .context("Failed to send pong")?;
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!("WebSocket closed: {:?}", frame);
                    return Ok(None);
                }
                Some(Ok(other)) => {
                    tracing::debug!("WS frame (ignored): {:?}", other);
                }
                Some(Err(e)) => {
                    return Err(e).context("WebSocket receive error");
                }
                None => {
                    return Ok(None);
                }
            }
        }
    }

    async fn close(mut self) {
        if let Err(e) = self.stream.close(None).await {
            tracing::debug!("WebSocket close failed: {}", e);
        }
    }
}

/// Why the pump loop for one connection returned.
enum PumpExit {
    /// Close requested or the owning side went away. Do not reconnect.
    Shutdown,
    /// Socket error or server-initiated close. Reconnect.
    Lost(anyhow::Error),
}

/// Run the channel until closed, reconnecting with exponential backoff
/// (1s, 2s, 4s, ... capped at `max_backoff`).
pub(super) async fn run(
    url: String,
    options: ChannelOptions,
    mut commands: mpsc::UnboundedReceiver<Command>,
    inbound: mpsc::UnboundedSender<Inbound>,
) {
    let mut backoff = Duration::from_secs(1);
    let mut pending: VecDeque<String> = VecDeque::new();

    loop {
        match SignalSocket::connect(&url).await {
            Ok(mut socket) => {
                backoff = Duration::from_secs(1);
                if inbound.send(Inbound::Lifecycle(ChannelEvent::Connected)).is_err() {
                    socket.close().await;
                    return;
                }

                match pump(&mut socket, &mut commands, &inbound, &mut pending).await {
                    PumpExit::Shutdown => {
                        socket.close().await;
                        tracing::info!("Signal channel closed");
                        return;
                    }
                    PumpExit::Lost(e) => {
                        tracing::warn!(
                            "Signal channel lost: {:#}. Reconnecting in {}s...",
                            e,
                            backoff.as_secs()
                        );
                        let event = ChannelEvent::Disconnected(format!("{:#}", e));
                        if inbound.send(Inbound::Lifecycle(event)).is_err() {
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(
                    "Signal channel connect failed: {:#}. Retrying in {}s...",
                    e,
                    backoff.as_secs()
                );
            }
        }

        // Keep queueing outbound signals while waiting to reconnect.
        let sleep = time::sleep(backoff);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                cmd = commands.recv() => match cmd {
                    Some(Command::Send(text)) => pending.push_back(text),
                    Some(Command::Close) | None => return,
                },
            }
        }

        backoff = (backoff * 2).min(options.max_backoff);
    }
}

async fn pump(
    socket: &mut SignalSocket,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    inbound: &mpsc::UnboundedSender<Inbound>,
    pending: &mut VecDeque<String>,
) -> PumpExit {
    while let Some(text) = pending.pop_front() {
        if let Err(e) = socket.send_text(text.clone()).await {
            pending.push_front(text);
            return PumpExit::Lost(e);
        }
    }

    loop {
        tokio::select! {
            frame = socket.recv_frame() => match frame {
                Ok(Some(text)) => {
                    if inbound.send(Inbound::Frame(text)).is_err() {
                        return PumpExit::Shutdown;
                    }
                }
                Ok(None) => return PumpExit::Lost(anyhow::anyhow!("WebSocket closed by server")),
                Err(e) => return PumpExit::Lost(e),
            },
            cmd = commands.recv() => match cmd {
                Some(Command::Send(text)) => {
                    if let Err(e) = socket.send_text(text.clone()).await {
                        pending.push_back(text);
                        return PumpExit::Lost(e);
                    }
                }
                Some(Command::Close) | None => return PumpExit::Shutdown,
            },
        }
    }
}
