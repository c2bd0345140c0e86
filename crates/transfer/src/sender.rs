//! Sending side of a transfer.
//!
//! ```text
//! AwaitingAcceptance ──accepted──► Streaming ──last chunk──► Completed
//!        │
//!        ├── rejected ──► Rejected
//!        ├── timeout ───► TimedOut
//!        └── closed ────► Failed
//! ```

use std::time::Duration;

use peerdrop_data_channel::{Channel, DataChannelError};
use peerdrop_protocol::constants::{ACCEPT_TIMEOUT, YIELD_EVERY_CHUNKS};
use peerdrop_protocol::{ChunkMessage, Message, RejectReason, TransferMeta};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::chunked::{ChunkReader, SourceFile};
use crate::integrity::calculate_file_checksum;
use crate::{Direction, EventCallback, TransferError, TransferEvent, percent};

/// Lifecycle of a [`SendSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    AwaitingAcceptance,
    Streaming,
    Completed,
    Rejected,
    TimedOut,
    Failed,
}

/// The receiver's answer to a meta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceptance {
    Accepted { resume_index: u32 },
    Rejected(RejectReason),
}

/// Outcome of a completed send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendSummary {
    pub transfer_id: String,
    pub resume_index: u32,
    pub chunks_sent: u32,
}

/// One outgoing file.
pub struct SendSession {
    source: SourceFile,
    meta: TransferMeta,
    state: SendState,
    accept_timeout: Duration,
}

impl SendSession {
    /// Builds the meta for `source`, digesting the file on a blocking worker.
    ///
    /// A digest failure is logged and the transfer proceeds without one.
    pub async fn prepare(source: SourceFile) -> Self {
        let hash = match calculate_file_checksum(&source.path).await {
            Ok(h) => Some(h),
            Err(e) => {
                warn!(file = %source.name, "digest failed, sending without one: {e}");
                None
            }
        };
        Self::with_meta(source.meta(hash), source)
    }

    /// Builds a session around a precomputed meta.
    pub fn with_meta(meta: TransferMeta, source: SourceFile) -> Self {
        Self {
            source,
            meta,
            state: SendState::AwaitingAcceptance,
            accept_timeout: ACCEPT_TIMEOUT,
        }
    }

    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = timeout;
        self
    }

    pub fn meta(&self) -> &TransferMeta {
        &self.meta
    }

    pub fn transfer_id(&self) -> &str {
        &self.meta.transfer_id
    }

    pub fn state(&self) -> SendState {
        self.state
    }

    /// Announces the file, waits for the answer, then streams chunks from
    /// the accepted resume point.
    ///
    /// `acceptance` resolves when the peer answers the meta. Dropping its
    /// sender counts as the channel going away.
    pub async fn run(
        &mut self,
        channel: &Channel,
        acceptance: oneshot::Receiver<Acceptance>,
        events: &EventCallback,
    ) -> Result<SendSummary, TransferError> {
        match self.run_inner(channel, acceptance, events).await {
            Ok(summary) => Ok(summary),
            Err(e) => {
                if self.state != SendState::Rejected && self.state != SendState::TimedOut {
                    self.state = SendState::Failed;
                }
                warn!(transfer = %self.meta.transfer_id, state = ?self.state, "send failed: {e}");
                events(TransferEvent::failed(&self.meta.transfer_id, &e));
                Err(e)
            }
        }
    }

    async fn run_inner(
        &mut self,
        channel: &Channel,
        acceptance: oneshot::Receiver<Acceptance>,
        events: &EventCallback,
    ) -> Result<SendSummary, TransferError> {
        if self.meta.size == 0 {
            return Err(TransferError::Validation("file is empty".into()));
        }

        channel.send(&Message::Meta(self.meta.clone()))?;
        info!(
            transfer = %self.meta.transfer_id,
            file = %self.meta.name,
            size = self.meta.size,
            chunks = self.meta.total_chunks,
            "offered file"
        );
        events(TransferEvent::Started {
            meta: self.meta.clone(),
            direction: Direction::Outgoing,
        });

        let resume_index = self.await_acceptance(channel, acceptance).await?;
        let total = self.meta.total_chunks;
        if resume_index > total {
            return Err(TransferError::Validation(format!(
                "resume index {resume_index} beyond {total} chunks"
            )));
        }

        self.state = SendState::Streaming;
        info!(transfer = %self.meta.transfer_id, resume_index, "transfer accepted");

        let mut reader = ChunkReader::open(&self.source.path).await?;
        if reader.file_size() != self.meta.size {
            return Err(TransferError::Validation(format!(
                "file changed since offer: {} bytes, announced {}",
                reader.file_size(),
                self.meta.size
            )));
        }

        let mut sent = 0u32;
        for index in resume_index..total {
            if channel.is_saturated() {
                channel.wait_drained().await?;
            }

            let data = reader.read_chunk(index).await?;
            channel.send(&Message::Chunk(ChunkMessage {
                transfer_id: self.meta.transfer_id.clone(),
                name: self.meta.name.clone(),
                index,
                total,
                data,
            }))?;
            sent += 1;

            events(TransferEvent::SendProgress {
                transfer_id: self.meta.transfer_id.clone(),
                index,
                total,
                percent: percent(index + 1, total),
            });

            if sent % YIELD_EVERY_CHUNKS == 0 {
                tokio::task::yield_now().await;
            }
        }

        self.state = SendState::Completed;
        info!(transfer = %self.meta.transfer_id, chunks = sent, "all chunks handed to channel");
        events(TransferEvent::SendComplete {
            transfer_id: self.meta.transfer_id.clone(),
        });

        Ok(SendSummary {
            transfer_id: self.meta.transfer_id.clone(),
            resume_index,
            chunks_sent: sent,
        })
    }

    async fn await_acceptance(
        &mut self,
        channel: &Channel,
        acceptance: oneshot::Receiver<Acceptance>,
    ) -> Result<u32, TransferError> {
        debug!(transfer = %self.meta.transfer_id, timeout = ?self.accept_timeout, "awaiting acceptance");

        let answer = tokio::select! {
            biased;
            _ = channel.closed() => return Err(DataChannelError::Closed.into()),
            answer = tokio::time::timeout(self.accept_timeout, acceptance) => answer,
        };

        match answer {
            Ok(Ok(Acceptance::Accepted { resume_index })) => Ok(resume_index),
            Ok(Ok(Acceptance::Rejected(reason))) => {
                self.state = SendState::Rejected;
                match reason {
                    RejectReason::QuotaExceeded => Err(TransferError::PeerQuotaExceeded),
                    other => Err(TransferError::Rejected(other)),
                }
            }
            Ok(Err(_)) => Err(DataChannelError::Closed.into()),
            Err(_) => {
                self.state = SendState::TimedOut;
                Err(TransferError::AcceptTimeout(self.accept_timeout))
            }
        }
    }
}
