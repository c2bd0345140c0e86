//! Session manager: one per open data channel.
//!
//! Owns the receiving sessions for the connection, the pending answers for
//! outgoing offers, and the event stream the application listens to.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use peerdrop_data_channel::{Channel, ChannelMode, DataChannelError, Inbound};
use peerdrop_protocol::{ChatMessage, Message};
use peerdrop_transfer::{
    Acceptance, ChunkStore, EventCallback, ReceiveSession, SendSession, SendSummary, SourceFile,
    TransferError, TransferEvent,
};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::info;

use crate::dispatch::dispatch_loop;
use crate::heartbeat::heartbeat_pump;
use crate::types::{SessionConfig, SessionEvent};

/// State shared between the manager handle and its dispatch task.
pub(crate) struct Inner {
    pub(crate) channel: Channel,
    pub(crate) store: Arc<dyn ChunkStore>,
    pub(crate) config: SessionConfig,
    pub(crate) receivers: Mutex<HashMap<String, ReceiveSession>>,
    pub(crate) pending: Mutex<HashMap<String, oneshot::Sender<Acceptance>>>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl Inner {
    pub(crate) fn emit(&self, event: SessionEvent) {
        let _ = self.events_tx.send(event);
    }

    pub(crate) fn emit_transfer(&self, event: TransferEvent) {
        self.emit(SessionEvent::Transfer(event));
    }

    fn transfer_callback(&self) -> EventCallback {
        let tx = self.events_tx.clone();
        Arc::new(move |event| {
            let _ = tx.send(SessionEvent::Transfer(event));
        })
    }
}

/// Drives all transfers over one data channel.
pub struct SessionManager {
    inner: Arc<Inner>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
    _dispatch: JoinHandle<()>,
    _heartbeat: JoinHandle<()>,
}

impl SessionManager {
    /// Starts dispatching `inbound` and sending heartbeats on `channel`.
    pub fn start(
        channel: Channel,
        inbound: Inbound,
        store: Arc<dyn ChunkStore>,
        config: SessionConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let heartbeat = config.heartbeat_interval;

        let inner = Arc::new(Inner {
            channel: channel.clone(),
            store,
            config,
            receivers: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            events_tx,
        });

        let dispatch = tokio::spawn(dispatch_loop(inner.clone(), inbound));
        let heartbeat = tokio::spawn(heartbeat_pump(channel.clone(), heartbeat));

        info!(mode = ?channel.mode(), "session started");

        Self {
            inner,
            events_rx: Mutex::new(Some(events_rx)),
            _dispatch: dispatch,
            _heartbeat: heartbeat,
        }
    }

    /// Takes the event receiver. Can only be called once.
    pub async fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events_rx.lock().await.take()
    }

    pub fn mode(&self) -> ChannelMode {
        self.inner.channel.mode()
    }

    pub fn channel(&self) -> &Channel {
        &self.inner.channel
    }

    pub fn is_closed(&self) -> bool {
        self.inner.channel.is_closed()
    }

    /// Ids of the incoming transfers currently open.
    pub async fn incoming_transfers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.receivers.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Offers a file to the peer and streams it once accepted.
    ///
    /// Resolves when the last chunk has been handed to the channel.
    pub async fn send_file(&self, path: &Path) -> Result<SendSummary, TransferError> {
        let source = SourceFile::open(path).await?;
        let mut session = SendSession::prepare(source)
            .await
            .with_accept_timeout(self.inner.config.accept_timeout);
        let id = session.transfer_id().to_string();

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock().await;
            if pending.contains_key(&id) {
                return Err(TransferError::AlreadyActive(id));
            }
            pending.insert(id.clone(), tx);
        }

        let events = self.inner.transfer_callback();
        let result = session.run(&self.inner.channel, rx, &events).await;

        // Clean up pending entry on any exit path.
        self.inner.pending.lock().await.remove(&id);
        result
    }

    /// Sends a chat message stamped with the current time.
    pub fn send_chat(&self, text: &str) -> Result<(), DataChannelError> {
        self.inner.channel.send(&Message::Chat(ChatMessage {
            text: text.to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }))
    }

    /// Drops a transfer for good: aborts it and deletes its ledger.
    ///
    /// Returns `true` if an open incoming transfer was aborted.
    pub async fn abandon(&self, transfer_id: &str) -> Result<bool, TransferError> {
        // A pending outgoing offer fails as if the channel had gone away.
        self.inner.pending.lock().await.remove(transfer_id);

        let session = self.inner.receivers.lock().await.remove(transfer_id);
        match session {
            Some(session) => {
                session.abandon().await?;
                Ok(true)
            }
            None => {
                self.inner.store.delete_all_for(transfer_id).await?;
                Ok(false)
            }
        }
    }

    /// Closes the channel. Open transfers are aborted by the dispatch task.
    pub fn close(&self) {
        self.inner.channel.close();
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.inner.channel.close();
    }
}
