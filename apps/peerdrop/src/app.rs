//! Command runners: wire the data channel, chunk store and session together.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use peerdrop_data_channel::broker::generate_peer_id;
use peerdrop_data_channel::{ChannelMode, ws};
use peerdrop_session::{SessionEvent, SessionManager};
use peerdrop_transfer::{ChunkStore, FsChunkStore, TransferEvent};
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::config::Config;

/// Accepts peers on `addr` until interrupted.
pub async fn listen(config: Config, addr: &str) -> anyhow::Result<()> {
    let store: Arc<dyn ChunkStore> =
        Arc::new(FsChunkStore::open(config.store_path(), config.quota_bytes).await?);
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;

    tracing::info!(
        %local,
        peer_id = %generate_peer_id(),
        store = %config.store_path().display(),
        "listening for peers"
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("SIGINT received, shutting down");
                break;
            }
            accepted = listener.accept() => {
                let (stream, remote) = match accepted {
                    Ok(a) => a,
                    Err(e) => {
                        tracing::warn!("accept failed: {e}");
                        continue;
                    }
                };
                let config = config.clone();
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    if let Err(e) = serve_peer(stream, config, store).await {
                        tracing::warn!(%remote, "peer session ended with error: {e}");
                    }
                });
            }
        }
    }

    Ok(())
}

async fn serve_peer(
    stream: tokio::net::TcpStream,
    config: Config,
    store: Arc<dyn ChunkStore>,
) -> anyhow::Result<()> {
    let (channel, inbound) = ws::accept(stream, ChannelMode::Broker).await?;
    let manager = SessionManager::start(channel, inbound, store, config.session_config());
    let Some(events) = manager.take_events().await else {
        return Ok(());
    };
    report_events(events, Some(config.download_path())).await;
    Ok(())
}

/// Connects to `peer`, sends each file in turn, then hangs up.
pub async fn send(
    config: Config,
    peer: &str,
    files: &[PathBuf],
    message: Option<&str>,
) -> anyhow::Result<()> {
    let (channel, inbound) = ws::connect(peer, ChannelMode::Broker).await?;
    // Outgoing transfers never touch the ledger; a scratch store is enough.
    let store: Arc<dyn ChunkStore> = Arc::new(peerdrop_transfer::MemoryChunkStore::new());
    let manager = SessionManager::start(channel, inbound, store, config.session_config());

    if let Some(events) = manager.take_events().await {
        tokio::spawn(report_events(events, None));
    }

    if let Some(text) = message {
        manager.send_chat(text)?;
    }

    let mut failures = 0usize;
    for path in files {
        match manager.send_file(path).await {
            Ok(summary) => tracing::info!(
                file = %path.display(),
                transfer = %summary.transfer_id,
                resumed_from = summary.resume_index,
                chunks = summary.chunks_sent,
                "file sent"
            ),
            Err(e) => {
                failures += 1;
                tracing::error!(file = %path.display(), "send failed: {e}");
            }
        }
    }

    drain(&manager).await;
    manager.close();

    if failures > 0 {
        anyhow::bail!("{failures} of {} file(s) failed", files.len());
    }
    Ok(())
}

/// Waits for queued frames to reach the socket before hanging up.
async fn drain(manager: &SessionManager) {
    let channel = manager.channel();
    while channel.buffered_amount() > 0 && !channel.is_closed() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Logs session events; received files are saved into `save_dir`.
async fn report_events(mut events: UnboundedReceiver<SessionEvent>, save_dir: Option<PathBuf>) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Chat(chat) => {
                tracing::info!(at = chat.timestamp, "peer says: {}", chat.text)
            }
            SessionEvent::Disconnected => {
                tracing::info!("peer disconnected");
                break;
            }
            SessionEvent::Transfer(event) => on_transfer(event, save_dir.as_deref()).await,
        }
    }
}

async fn on_transfer(event: TransferEvent, save_dir: Option<&Path>) {
    match event {
        TransferEvent::Started { meta, direction } => tracing::info!(
            transfer = %meta.transfer_id,
            file = %meta.name,
            size = meta.size,
            ?direction,
            "transfer started"
        ),
        TransferEvent::SendProgress {
            transfer_id,
            percent,
            ..
        }
        | TransferEvent::ReceiveProgress {
            transfer_id,
            percent,
            ..
        } => tracing::debug!(transfer = %transfer_id, "{percent:.1}%"),
        TransferEvent::SendComplete { transfer_id } => {
            tracing::debug!(transfer = %transfer_id, "all chunks queued")
        }
        TransferEvent::FileReceived { transfer_id, file } => {
            let Some(dir) = save_dir else { return };
            let verified = file.verified;
            match file.save_to(dir).await {
                Ok(path) => tracing::info!(
                    transfer = %transfer_id,
                    path = %path.display(),
                    verified,
                    "file received"
                ),
                Err(e) => tracing::error!(transfer = %transfer_id, "could not save file: {e}"),
            }
        }
        TransferEvent::FileSaved { transfer_id, path } => {
            tracing::info!(transfer = %transfer_id, path = %path.display(), "file saved")
        }
        TransferEvent::Failed {
            transfer_id,
            kind,
            message,
        } => tracing::warn!(transfer = %transfer_id, ?kind, "transfer failed: {message}"),
    }
}
