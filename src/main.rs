//! p2p-call - peer-to-peer calls over a chat socket
//!
//! Rings another participant over a websocket signal channel and negotiates
//! a WebRTC peer connection with them.

mod calling;
mod channel;
mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use calling::driver::{self, CallDriver};
use calling::local_peer::LocalPeerFactory;
use calling::session::{CallSession, SessionDeps};
use calling::signal::ParticipantId;
use calling::synthetic::SyntheticDevices;
use config::Config;

#[derive(Parser)]
#[command(name = "p2p-call")]
#[command(about = "Peer-to-peer audio/video call signaling client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Participant id to register as (overrides the config file)
    #[arg(long, global = true)]
    id: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and wait for incoming calls
    Listen,

    /// Connect and call a participant
    Call {
        /// Participant id to ring
        target: String,
    },

    /// Show the effective configuration
    Config {
        /// Write the default configuration file
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let mut config = Config::load(cli.config.as_deref()).context("Failed to load config")?;
    if let Some(id) = cli.id {
        config.participant_id = id;
    }

    match cli.command {
        Commands::Listen => run(config, None).await?,
        Commands::Call { target } => run(config, Some(target.into())).await?,
        Commands::Config { init } => {
            if init {
                let path = match cli.config {
                    Some(path) => path,
                    None => Config::default_path()?,
                };
                Config::default().save_to(&path)?;
                println!("Wrote default configuration to {}", path.display());
            } else {
                let text = toml::to_string_pretty(&config).context("Failed to serialize config")?;
                print!("{}", text);
            }
        }
    }

    Ok(())
}

async fn run(config: Config, dial: Option<ParticipantId>) -> Result<()> {
    let local = ParticipantId::new(config.participant_id.clone());
    anyhow::ensure!(!local.as_str().is_empty(), "participant_id must not be empty");

    let url = channel::endpoint(&config.signaling_url, &local)?;
    let signal_channel = channel::spawn(&url, config.channel_options())?;

    let (session, channels) = CallSession::new(
        local,
        SessionDeps {
            signals: Arc::new(signal_channel.handle.clone()),
            peers: Arc::new(LocalPeerFactory::new()),
            devices: Arc::new(SyntheticDevices::new(config.media.deny)),
            rtc: config.rtc_configuration(),
            constraints: config.media_constraints(),
        },
    );

    println!("{} (Ctrl-C to stop)", driver::HELP);
    let commands = driver::spawn_stdin_reader();
    CallDriver::new(session, channels, signal_channel)
        .run(commands, dial)
        .await
}
