//! Broker-assisted channels addressed by short numeric peer ids.
//!
//! A peer registers a 4-digit id with the broker and shares it out of band.
//! The other side connects to that id and both get a broker-mode channel.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info};

use crate::channel::{Channel, Inbound};
use crate::codec::ChannelMode;
use crate::memory;

/// Lowest peer id handed out.
pub const PEER_ID_MIN: u16 = 1000;
/// Highest peer id handed out.
pub const PEER_ID_MAX: u16 = 9999;
/// Attempts before [`register_peer`] gives up on collisions.
pub const MAX_REGISTER_ATTEMPTS: usize = 32;

/// Errors from a broker.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("peer id {0} is already taken")]
    IdUnavailable(String),

    #[error("peer {0} not found")]
    PeerNotFound(String),

    #[error("peer {0} is not registered")]
    NotRegistered(String),

    #[error("broker closed")]
    Closed,

    #[error("broker transport error: {0}")]
    Transport(String),
}

/// Rendezvous service that pairs two peers into a data channel.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Claims `id` for the calling peer.
    async fn register(&self, id: &str) -> Result<(), BrokerError>;

    /// Opens a channel from `local` to the peer registered as `remote`.
    async fn connect(&self, local: &str, remote: &str) -> Result<(Channel, Inbound), BrokerError>;

    /// Waits for the next incoming channel addressed to `local`.
    async fn accept(&self, local: &str) -> Result<(Channel, Inbound), BrokerError>;
}

/// Generates a random 4-digit peer id.
pub fn generate_peer_id() -> String {
    rand::thread_rng()
        .gen_range(PEER_ID_MIN..=PEER_ID_MAX)
        .to_string()
}

/// Registers with the broker, retrying on id collisions.
///
/// Uses `preferred` for the first attempt when given. Every
/// [`BrokerError::IdUnavailable`] is retried with a fresh random id; other
/// errors are returned as is.
pub async fn register_peer(
    broker: &dyn Broker,
    preferred: Option<String>,
) -> Result<String, BrokerError> {
    let mut candidate = preferred.unwrap_or_else(generate_peer_id);
    let mut last_err = None;

    for attempt in 1..=MAX_REGISTER_ATTEMPTS {
        match broker.register(&candidate).await {
            Ok(()) => {
                info!(peer = %candidate, attempt, "registered with broker");
                return Ok(candidate);
            }
            Err(BrokerError::IdUnavailable(id)) => {
                debug!(peer = %id, "peer id taken, retrying");
                last_err = Some(BrokerError::IdUnavailable(id));
                candidate = generate_peer_id();
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_err.unwrap_or(BrokerError::Closed))
}

// ---------------------------------------------------------------------------
// In-process broker
// ---------------------------------------------------------------------------

type Incoming = (Channel, Inbound);

struct Registration {
    tx: mpsc::UnboundedSender<Incoming>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Incoming>>>,
}

/// Broker living inside the current process.
///
/// Channels are in-memory links in broker mode.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    peers: Arc<Mutex<HashMap<String, Registration>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Releases a registered id.
    pub async fn unregister(&self, id: &str) {
        self.peers.lock().await.remove(id);
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn register(&self, id: &str) -> Result<(), BrokerError> {
        let mut peers = self.peers.lock().await;
        if peers.contains_key(id) {
            return Err(BrokerError::IdUnavailable(id.to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        peers.insert(
            id.to_string(),
            Registration {
                tx,
                rx: Arc::new(Mutex::new(rx)),
            },
        );
        Ok(())
    }

    async fn connect(&self, local: &str, remote: &str) -> Result<(Channel, Inbound), BrokerError> {
        let peers = self.peers.lock().await;
        let target = peers
            .get(remote)
            .ok_or_else(|| BrokerError::PeerNotFound(remote.to_string()))?;

        let (ours, theirs) = memory::link(ChannelMode::Broker);
        target.tx.send(theirs).map_err(|_| BrokerError::Closed)?;
        debug!(from = %local, to = %remote, "broker channel opened");
        Ok(ours)
    }

    async fn accept(&self, local: &str) -> Result<(Channel, Inbound), BrokerError> {
        let rx = {
            let peers = self.peers.lock().await;
            peers
                .get(local)
                .map(|r| r.rx.clone())
                .ok_or_else(|| BrokerError::NotRegistered(local.to_string()))?
        };
        let mut rx = rx.lock().await;
        rx.recv().await.ok_or(BrokerError::Closed)
    }
}
