//! PeerDrop command-line peer entry point.

mod app;
mod config;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "peerdrop", version, about = "Peer-to-peer resumable file transfer")]
struct Cli {
    /// Configuration file (defaults to the per-user location)
    #[arg(long, global = true, env = "PEERDROP_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Wait for peers and receive their files
    Listen {
        /// Address to bind (overrides `listen_addr`)
        #[arg(long)]
        addr: Option<String>,

        /// Directory for received files (overrides `download_dir`)
        #[arg(long)]
        download_dir: Option<String>,
    },
    /// Send files to a listening peer
    Send {
        /// Peer address, e.g. ws://192.168.1.20:9470
        #[arg(long, env = "PEERDROP_PEER")]
        peer: String,

        /// Chat message sent before the files
        #[arg(long)]
        message: Option<String>,

        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    // Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting PeerDrop");

    let mut config = match &cli.config {
        Some(path) => config::Config::load_from(path)?,
        None => config::Config::load()?,
    };

    let rt = tokio::runtime::Runtime::new()?;
    match cli.command {
        Command::Listen { addr, download_dir } => {
            if let Some(dir) = download_dir {
                config.download_dir = dir;
            }
            let addr = addr.unwrap_or_else(|| config.listen_addr.clone());
            rt.block_on(app::listen(config, &addr))?;
        }
        Command::Send {
            peer,
            message,
            files,
        } => {
            rt.block_on(app::send(config, &peer, &files, message.as_deref()))?;
        }
    }

    tracing::info!("peer shut down cleanly");
    Ok(())
}
