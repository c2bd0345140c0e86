//! Receiving side of a transfer.
//!
//! ```text
//! AwaitingQuota ──► Accepted(resume) ──chunk──► Receiving ──last──► Finalizing ──► Delivered
//!       │                                           │                   │
//!       └── rejected (no session)                   └──── abort ────────┴──► Failed
//! ```
//!
//! Two backends hold incoming chunks:
//! - **Direct**: payloads go straight into a part file inside the download
//!   directory at their offsets. Once the file checks out it is renamed to
//!   its sanitized name, numbered if that name is taken. Existing files are
//!   never opened for writing.
//! - **Buffered**: payloads go to a [`ChunkStore`] in batches. The store is
//!   the resumability ledger; the file is reassembled and verified at the
//!   end.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use peerdrop_protocol::constants::{
    CHUNK_SIZE, MAX_TRANSFER_SIZE, READBACK_BATCH_SIZE, STREAMING_THRESHOLD_CHUNKS,
    WRITE_BATCH_SIZE,
};
use peerdrop_protocol::{ChunkMessage, RejectReason, TransferMeta};
use tempfile::{NamedTempFile, TempPath};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, trace, warn};

use crate::chunked::{ChunkWriter, part_file_in, persist_unique};
use crate::integrity::{Verifier, verify_hash};
use crate::store::{ChunkStore, StoreError};
use crate::validation::{sanitize_file_name, validate_meta, validate_payload};
use crate::{TransferError, percent};

/// Receiver tuning.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Write files directly here instead of buffering through the store.
    pub download_dir: Option<PathBuf>,
    /// Chunks coalesced before a store flush.
    pub write_batch: usize,
    /// Largest deliverable file.
    pub max_size: u64,
    /// Above this many chunks, reassembly streams through a temp file.
    pub streaming_threshold: u32,
    /// Chunks fetched per read-back batch when streaming.
    pub readback_batch: u32,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            download_dir: None,
            write_batch: WRITE_BATCH_SIZE,
            max_size: MAX_TRANSFER_SIZE,
            streaming_threshold: STREAMING_THRESHOLD_CHUNKS,
            readback_batch: READBACK_BATCH_SIZE,
        }
    }
}

/// Lifecycle of a [`ReceiveSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveState {
    AwaitingQuota,
    Accepted { resume_index: u32 },
    Receiving,
    Finalizing,
    Delivered,
    Failed,
}

/// Why a meta was refused.
#[derive(Debug)]
pub struct Rejection {
    /// Sent back to the peer.
    pub reason: RejectReason,
    /// Reported locally.
    pub error: TransferError,
}

impl Rejection {
    fn new(reason: RejectReason, error: TransferError) -> Self {
        Self { reason, error }
    }
}

/// Result of handling one chunk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkProgress {
    pub received: u32,
    pub total: u32,
    pub percent: f64,
    /// The index had already been received; nothing was written.
    pub duplicate: bool,
}

impl ChunkProgress {
    pub fn is_complete(&self) -> bool {
        self.received == self.total
    }
}

/// Reassembled file bytes.
#[derive(Debug)]
pub enum FileContent {
    Memory(Vec<u8>),
    /// Large files are spooled to a temporary file during reassembly.
    Spooled(NamedTempFile),
}

/// A fully received and verified file.
#[derive(Debug)]
pub struct ReceivedFile {
    pub transfer_id: String,
    /// Sanitized name, safe to create in a local directory.
    pub name: String,
    pub mime: String,
    pub size: u64,
    /// The sender supplied a digest and it matched.
    pub verified: bool,
    pub content: FileContent,
}

impl ReceivedFile {
    /// Reads the whole content into memory.
    pub async fn bytes(&self) -> Result<Vec<u8>, TransferError> {
        match &self.content {
            FileContent::Memory(data) => Ok(data.clone()),
            FileContent::Spooled(tmp) => Ok(tokio::fs::read(tmp.path()).await?),
        }
    }

    /// Writes the file into `dir` under its sanitized name.
    ///
    /// A taken name gets a numbered variant (`name (1).ext`); existing files
    /// are left alone. Returns where the file landed.
    pub async fn save_to(self, dir: &Path) -> Result<PathBuf, TransferError> {
        tokio::fs::create_dir_all(dir).await?;
        let staged = part_file_in(dir)?.into_temp_path();
        match self.content {
            FileContent::Memory(data) => tokio::fs::write(&staged, data).await?,
            // The spool may sit on another file system, so copy rather than rename.
            FileContent::Spooled(tmp) => {
                tokio::fs::copy(tmp.path(), &staged).await?;
            }
        }
        persist_unique(staged, dir, &self.name)
    }
}

/// How a finished transfer was delivered.
#[derive(Debug)]
pub enum Delivery {
    Received(ReceivedFile),
    Saved { path: PathBuf },
}

enum Backend {
    Direct { writer: ChunkWriter, dir: PathBuf },
    Buffered { pending: Vec<(u32, Vec<u8>)> },
}

/// One incoming file.
pub struct ReceiveSession {
    meta: TransferMeta,
    config: ReceiverConfig,
    store: Arc<dyn ChunkStore>,
    backend: Backend,
    state: ReceiveState,
    seen: Vec<bool>,
    received: u32,
    resume_index: u32,
}

impl ReceiveSession {
    /// Validates `meta`, checks storage and picks a backend.
    ///
    /// On success the caller answers `transfer-accepted` with
    /// [`resume_index`](Self::resume_index). On failure no state is kept and
    /// the caller answers `transfer-rejected` with the given reason.
    pub async fn accept(
        meta: TransferMeta,
        store: Arc<dyn ChunkStore>,
        config: &ReceiverConfig,
    ) -> Result<Self, Rejection> {
        validate_meta(&meta, config.max_size)
            .map_err(|e| Rejection::new(RejectReason::InvalidMeta, e))?;

        match store.estimate().await {
            Ok(Some(estimate)) if !estimate.fits(meta.size) => {
                info!(
                    transfer = %meta.transfer_id,
                    size = meta.size,
                    usage = estimate.usage,
                    quota = estimate.quota,
                    "not enough storage, rejecting"
                );
                return Err(Rejection::new(
                    RejectReason::QuotaExceeded,
                    TransferError::PeerQuotaExceeded,
                ));
            }
            Ok(_) => {}
            Err(e) => warn!(transfer = %meta.transfer_id, "storage estimate unavailable: {e}"),
        }

        let total = meta.total_chunks;
        let mut session = Self {
            config: config.clone(),
            store,
            backend: Backend::Buffered {
                pending: Vec::new(),
            },
            state: ReceiveState::AwaitingQuota,
            seen: vec![false; total as usize],
            received: 0,
            resume_index: 0,
            meta,
        };

        if let Some(dir) = &config.download_dir {
            match ChunkWriter::create_in(dir).await {
                Ok(writer) => {
                    debug!(
                        transfer = %session.meta.transfer_id,
                        part = %writer.path().display(),
                        "streaming to disk"
                    );
                    session.backend = Backend::Direct {
                        writer,
                        dir: dir.clone(),
                    };
                }
                Err(e) => {
                    warn!(dir = %dir.display(), "direct write unavailable, buffering instead: {e}");
                }
            }
        }

        if matches!(session.backend, Backend::Buffered { .. }) {
            session
                .resume_from_ledger()
                .await
                .map_err(|e| Rejection::new(RejectReason::Declined, e))?;
        }

        session.state = ReceiveState::Accepted {
            resume_index: session.resume_index,
        };
        info!(
            transfer = %session.meta.transfer_id,
            file = %session.meta.name,
            chunks = total,
            resume_index = session.resume_index,
            "transfer accepted"
        );
        Ok(session)
    }

    async fn resume_from_ledger(&mut self) -> Result<(), TransferError> {
        let id = &self.meta.transfer_id;
        let total = self.meta.total_chunks;
        let mut existing = self.store.count_for(id).await?;

        if existing == 0 {
            self.store.delete_all_for(id).await?;
        } else if existing > total {
            warn!(transfer = %id, existing, total, "ledger larger than transfer, clearing");
            self.store.delete_all_for(id).await?;
            existing = 0;
        }

        self.resume_index = existing;
        self.received = existing;
        for seen in self.seen.iter_mut().take(existing as usize) {
            *seen = true;
        }
        Ok(())
    }

    pub fn meta(&self) -> &TransferMeta {
        &self.meta
    }

    pub fn transfer_id(&self) -> &str {
        &self.meta.transfer_id
    }

    pub fn state(&self) -> ReceiveState {
        self.state
    }

    /// Chunk count the sender resumes from.
    pub fn resume_index(&self) -> u32 {
        self.resume_index
    }

    pub fn received(&self) -> u32 {
        self.received
    }

    pub fn is_complete(&self) -> bool {
        self.received == self.meta.total_chunks
    }

    pub fn is_direct(&self) -> bool {
        matches!(self.backend, Backend::Direct { .. })
    }

    /// Takes one chunk.
    ///
    /// Indices are tracked individually; a repeated index is acknowledged
    /// without being written or counted.
    pub async fn on_chunk(&mut self, chunk: ChunkMessage) -> Result<ChunkProgress, TransferError> {
        let total = self.meta.total_chunks;
        if chunk.transfer_id != self.meta.transfer_id {
            return Err(TransferError::Validation(format!(
                "chunk for {} routed to {}",
                chunk.transfer_id, self.meta.transfer_id
            )));
        }
        if chunk.index >= total {
            return Err(TransferError::Validation(format!(
                "chunk index {} out of range ({total} chunks)",
                chunk.index
            )));
        }
        if chunk.data.len() > CHUNK_SIZE {
            return Err(TransferError::Validation(format!(
                "chunk {} is {} bytes, larger than {CHUNK_SIZE}",
                chunk.index,
                chunk.data.len()
            )));
        }

        let index = chunk.index;
        if self.seen[index as usize] {
            trace!(transfer = %self.meta.transfer_id, index, "duplicate chunk ignored");
            return Ok(self.progress(true));
        }

        self.state = ReceiveState::Receiving;
        match &mut self.backend {
            Backend::Direct { writer, .. } => writer.write_chunk(index, &chunk.data).await?,
            Backend::Buffered { pending } => pending.push((index, chunk.data)),
        }
        self.seen[index as usize] = true;
        self.received += 1;

        let flush_due = match &self.backend {
            Backend::Buffered { pending } => {
                pending.len() >= self.config.write_batch
                    || self.received == total
                    || index == total - 1
            }
            Backend::Direct { .. } => false,
        };
        if flush_due {
            self.flush().await?;
        }

        trace!(transfer = %self.meta.transfer_id, index, received = self.received, "chunk stored");
        Ok(self.progress(false))
    }

    fn progress(&self, duplicate: bool) -> ChunkProgress {
        ChunkProgress {
            received: self.received,
            total: self.meta.total_chunks,
            percent: percent(self.received, self.meta.total_chunks),
            duplicate,
        }
    }

    /// Writes coalesced chunks to the store, one write per chunk.
    pub async fn flush(&mut self) -> Result<(), TransferError> {
        let Backend::Buffered { pending } = &mut self.backend else {
            return Ok(());
        };
        if pending.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(pending);
        let n = batch.len();
        for (index, data) in batch {
            self.store
                .put(&self.meta.transfer_id, index, &data)
                .await
                .map_err(|e| match e {
                    StoreError::QuotaExceeded => TransferError::StoreQuotaExceeded,
                    other => TransferError::Store(other),
                })?;
        }
        debug!(transfer = %self.meta.transfer_id, chunks = n, "flushed chunk batch");
        Ok(())
    }

    /// Completes the transfer.
    ///
    /// The ledger is deleted whether or not delivery succeeds.
    pub async fn finalize(mut self) -> Result<Delivery, TransferError> {
        self.state = ReceiveState::Finalizing;
        let result = self.finalize_inner().await;
        self.state = if result.is_ok() {
            ReceiveState::Delivered
        } else {
            ReceiveState::Failed
        };
        match &result {
            Ok(_) => info!(transfer = %self.meta.transfer_id, "transfer delivered"),
            Err(e) => warn!(transfer = %self.meta.transfer_id, "finalization failed: {e}"),
        }
        result
    }

    async fn finalize_inner(&mut self) -> Result<Delivery, TransferError> {
        let backend = std::mem::replace(
            &mut self.backend,
            Backend::Buffered {
                pending: Vec::new(),
            },
        );

        match backend {
            Backend::Direct { writer, dir } => {
                if !self.is_complete() {
                    writer.discard().await?;
                    return Err(self.missing_error());
                }
                let (part, len) = writer.finish().await?;
                if len != self.meta.size {
                    self.remove_part(part);
                    return Err(TransferError::Validation(format!(
                        "wrote {len} bytes, expected {}",
                        self.meta.size
                    )));
                }
                if let Err(e) = validate_payload(&self.meta.mime, len, self.config.max_size) {
                    self.remove_part(part);
                    return Err(e);
                }
                let path = persist_unique(part, &dir, &sanitize_file_name(&self.meta.name))?;
                Ok(Delivery::Saved { path })
            }
            Backend::Buffered { pending } => {
                self.backend = Backend::Buffered { pending };
                let flushed = self.flush().await;
                let assembled = match flushed {
                    Ok(()) => self.reassemble().await,
                    Err(e) => Err(e),
                };
                if let Err(e) = self.store.delete_all_for(&self.meta.transfer_id).await {
                    warn!(transfer = %self.meta.transfer_id, "failed to clear ledger: {e}");
                }
                let (content, size, digest) = assembled?;
                self.deliver(content, size, digest).map(Delivery::Received)
            }
        }
    }

    fn remove_part(&self, part: TempPath) {
        let path = part.to_path_buf();
        if let Err(e) = part.close() {
            warn!(
                transfer = %self.meta.transfer_id,
                part = %path.display(),
                "failed to remove part file: {e}"
            );
        }
    }

    fn missing_error(&self) -> TransferError {
        TransferError::Validation(format!(
            "missing chunks: {} of {} received",
            self.received, self.meta.total_chunks
        ))
    }

    async fn reassemble(&self) -> Result<(FileContent, u64, String), TransferError> {
        let id = &self.meta.transfer_id;
        let total = self.meta.total_chunks;
        let missing = |e: StoreError| match e {
            StoreError::Missing(index) => {
                TransferError::Validation(format!("missing chunk {index}"))
            }
            other => TransferError::Store(other),
        };

        let mut verifier = Verifier::new();

        if total > self.config.streaming_threshold {
            let tmp = NamedTempFile::new()?;
            let mut out = tokio::fs::File::from_std(tmp.reopen()?);
            let batch = self.config.readback_batch.max(1);
            let mut start = 0;
            while start < total {
                let len = batch.min(total - start);
                for data in self.store.range_for(id, start, len).await.map_err(missing)? {
                    verifier.update(&data);
                    out.write_all(&data).await?;
                }
                start += len;
            }
            out.flush().await?;
            debug!(transfer = %id, bytes = verifier.len(), "reassembled by streaming read-back");
            let size = verifier.len();
            Ok((FileContent::Spooled(tmp), size, verifier.finalize()))
        } else {
            let chunks = self.store.all_ordered_for(id).await.map_err(missing)?;
            let mut data = Vec::with_capacity(self.meta.size.min(self.config.max_size) as usize);
            let mut expected = 0u32;
            for (index, chunk) in chunks {
                if index != expected {
                    return Err(TransferError::Validation(format!("missing chunk {expected}")));
                }
                verifier.update(&chunk);
                data.extend_from_slice(&chunk);
                expected += 1;
            }
            if expected != total {
                return Err(TransferError::Validation(format!("missing chunk {expected}")));
            }
            let size = verifier.len();
            Ok((FileContent::Memory(data), size, verifier.finalize()))
        }
    }

    fn deliver(
        &self,
        content: FileContent,
        size: u64,
        digest: String,
    ) -> Result<ReceivedFile, TransferError> {
        if size != self.meta.size {
            return Err(TransferError::Validation(format!(
                "reassembled {size} bytes, expected {}",
                self.meta.size
            )));
        }
        validate_payload(&self.meta.mime, size, self.config.max_size)?;

        let verified = match &self.meta.hash {
            Some(expected) => {
                if !verify_hash(expected, &digest) {
                    return Err(TransferError::Integrity {
                        expected: expected.clone(),
                        actual: digest,
                    });
                }
                true
            }
            None => false,
        };

        Ok(ReceivedFile {
            transfer_id: self.meta.transfer_id.clone(),
            name: sanitize_file_name(&self.meta.name),
            mime: self.meta.mime.clone(),
            size,
            verified,
            content,
        })
    }

    /// Stops receiving, keeping the ledger so the transfer can resume.
    ///
    /// A direct part file is removed; it cannot be resumed.
    pub async fn abort(mut self) {
        self.state = ReceiveState::Failed;
        if let Backend::Direct { writer, .. } = self.backend {
            if let Err(e) = writer.discard().await {
                warn!(transfer = %self.meta.transfer_id, "failed to remove part file: {e}");
            }
        }
        debug!(transfer = %self.meta.transfer_id, received = self.received, "receive aborted");
    }

    /// Stops receiving and deletes the ledger.
    pub async fn abandon(self) -> Result<(), TransferError> {
        let store = self.store.clone();
        let id = self.meta.transfer_id.clone();
        self.abort().await;
        store.delete_all_for(&id).await?;
        info!(transfer = %id, "transfer abandoned");
        Ok(())
    }
}
