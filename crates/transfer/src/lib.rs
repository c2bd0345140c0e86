//! Chunked, resumable file transfer over a data channel.
//!
//! - [`sender`]: reads a file in fixed-size chunks and streams it once the
//!   peer accepts, honoring channel backpressure.
//! - [`receiver`]: validates an incoming meta, persists chunks (directly to
//!   disk or through a [`ChunkStore`]), reassembles and verifies the file.
//! - [`store`]: the resumability ledger.

pub mod chunked;
pub mod integrity;
pub mod receiver;
pub mod sender;
pub mod store;
pub mod validation;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use peerdrop_data_channel::DataChannelError;
use peerdrop_protocol::{RejectReason, TransferMeta};

pub use chunked::{ChunkReader, ChunkWriter, SourceFile, transfer_id};
pub use integrity::{Verifier, calculate_file_checksum, checksum_bytes, verify_hash};
pub use receiver::{
    ChunkProgress, Delivery, FileContent, ReceiveSession, ReceiveState, ReceivedFile,
    ReceiverConfig, Rejection,
};
pub use sender::{Acceptance, SendSession, SendState, SendSummary};
pub use store::{ChunkStore, FsChunkStore, MemoryChunkStore, StorageEstimate, StoreError};
pub use validation::{mime_from_name, sanitize_file_name, validate_meta, validate_payload};

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The receiving side has no room for the announced file.
    #[error("receiver storage quota exceeded")]
    PeerQuotaExceeded,

    /// The local chunk store filled up while buffering chunks.
    #[error("local chunk store is full")]
    StoreQuotaExceeded,

    #[error("transfer rejected: {0}")]
    Rejected(RejectReason),

    #[error("no answer from peer within {0:?}")]
    AcceptTimeout(Duration),

    #[error("channel error: {0}")]
    Channel(#[from] DataChannelError),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("integrity check failed: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    #[error("chunk store error: {0}")]
    Store(#[from] StoreError),

    #[error("transfer already active: {0}")]
    AlreadyActive(String),
}

/// Coarse failure category, stable across error variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The peer refused, never answered, or the offer was malformed.
    Negotiation,
    /// The channel closed or failed.
    Transport,
    /// The received file does not match what was announced.
    Validation,
    /// The digest did not match.
    Integrity,
    /// Local storage failed or ran out of space.
    Storage,
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::Rejected(_)
            | TransferError::PeerQuotaExceeded
            | TransferError::AcceptTimeout(_)
            | TransferError::AlreadyActive(_) => ErrorKind::Negotiation,
            TransferError::Channel(_) => ErrorKind::Transport,
            TransferError::Validation(_) => ErrorKind::Validation,
            TransferError::Integrity { .. } => ErrorKind::Integrity,
            TransferError::Io(_)
            | TransferError::StoreQuotaExceeded
            | TransferError::Store(_) => ErrorKind::Storage,
        }
    }
}

/// Which way a transfer flows, from the local peer's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// Progress and outcome notifications for transfers.
#[derive(Debug)]
pub enum TransferEvent {
    Started {
        meta: TransferMeta,
        direction: Direction,
    },
    SendProgress {
        transfer_id: String,
        index: u32,
        total: u32,
        percent: f64,
    },
    SendComplete {
        transfer_id: String,
    },
    ReceiveProgress {
        transfer_id: String,
        received: u32,
        total: u32,
        percent: f64,
    },
    /// Reassembled from the chunk store.
    FileReceived {
        transfer_id: String,
        file: ReceivedFile,
    },
    /// Written straight to the download directory.
    FileSaved {
        transfer_id: String,
        path: PathBuf,
    },
    Failed {
        transfer_id: String,
        kind: ErrorKind,
        message: String,
    },
}

impl TransferEvent {
    pub fn failed(transfer_id: &str, err: &TransferError) -> Self {
        TransferEvent::Failed {
            transfer_id: transfer_id.to_string(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Callback receiving [`TransferEvent`]s.
pub type EventCallback = Arc<dyn Fn(TransferEvent) + Send + Sync>;

/// Percentage of `done` out of `total`, 100 for an empty total.
pub(crate) fn percent(done: u32, total: u32) -> f64 {
    if total == 0 {
        100.0
    } else {
        f64::from(done) / f64::from(total) * 100.0
    }
}
