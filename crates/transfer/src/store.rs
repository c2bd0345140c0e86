//! Chunk store: the receiver's resumability ledger.
//!
//! Chunks are keyed by `(transfer_id, index)`. The number of chunks held for
//! a transfer is the index a reconnecting sender resumes from.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Errors from a chunk store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store quota exceeded")]
    QuotaExceeded,

    #[error("invalid store key: {0}")]
    InvalidKey(String),

    #[error("chunk {0} missing from store")]
    Missing(u32),
}

/// Storage usage as reported by a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageEstimate {
    pub usage: u64,
    pub quota: u64,
}

impl StorageEstimate {
    /// Returns `true` if `additional` more bytes fit.
    pub fn fits(&self, additional: u64) -> bool {
        self.usage.saturating_add(additional) <= self.quota
    }
}

/// Durable per-chunk storage.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Stores one chunk, replacing any previous payload at that index.
    async fn put(&self, transfer_id: &str, index: u32, data: &[u8]) -> Result<(), StoreError>;

    /// Number of chunks held for a transfer.
    async fn count_for(&self, transfer_id: &str) -> Result<u32, StoreError>;

    /// All chunks of a transfer, sorted by index.
    async fn all_ordered_for(&self, transfer_id: &str) -> Result<Vec<(u32, Vec<u8>)>, StoreError>;

    /// Payloads for indices `start..start + len`, in order.
    ///
    /// Fails with [`StoreError::Missing`] on the first absent index.
    async fn range_for(
        &self,
        transfer_id: &str,
        start: u32,
        len: u32,
    ) -> Result<Vec<Vec<u8>>, StoreError>;

    /// Removes every chunk of a transfer.
    async fn delete_all_for(&self, transfer_id: &str) -> Result<(), StoreError>;

    /// Current usage and quota, if the store has a quota.
    async fn estimate(&self) -> Result<Option<StorageEstimate>, StoreError>;
}

fn check_key(transfer_id: &str) -> Result<(), StoreError> {
    let ok = !transfer_id.is_empty()
        && transfer_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(transfer_id.to_string()))
    }
}

// ---------------------------------------------------------------------------
// File-system store
// ---------------------------------------------------------------------------

const CHUNK_EXT: &str = "chunk";

/// Chunk store backed by a directory tree.
///
/// Layout: `<root>/<transfer_id>/<index:08>.chunk`. Each chunk is written to
/// a temporary file and renamed into place, so a crash never leaves a
/// half-written chunk that would be counted.
pub struct FsChunkStore {
    root: PathBuf,
    quota: Option<u64>,
    usage: AtomicU64,
}

impl FsChunkStore {
    /// Opens (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>, quota: Option<u64>) -> Result<Self, StoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        let usage = dir_usage(&root).await?;
        debug!(root = %root.display(), usage, ?quota, "chunk store opened");
        Ok(Self {
            root,
            quota,
            usage: AtomicU64::new(usage),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn transfer_dir(&self, transfer_id: &str) -> Result<PathBuf, StoreError> {
        check_key(transfer_id)?;
        Ok(self.root.join(transfer_id))
    }

    fn chunk_path(dir: &Path, index: u32) -> PathBuf {
        dir.join(format!("{index:08}.{CHUNK_EXT}"))
    }

    /// Indices present for a transfer, sorted.
    async fn indices(&self, dir: &Path) -> Result<Vec<u32>, StoreError> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut indices = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(CHUNK_EXT) {
                continue;
            }
            match path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u32>().ok())
            {
                Some(index) => indices.push(index),
                None => warn!(path = %path.display(), "ignoring unexpected file in chunk store"),
            }
        }
        indices.sort_unstable();
        Ok(indices)
    }
}

/// Sums the sizes of all files below `dir`.
async fn dir_usage(dir: &Path) -> Result<u64, StoreError> {
    let mut total = 0;
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if meta.is_dir() {
                stack.push(entry.path());
            } else {
                total += meta.len();
            }
        }
    }
    Ok(total)
}

async fn file_len(path: &Path) -> Result<u64, StoreError> {
    match tokio::fs::metadata(path).await {
        Ok(m) => Ok(m.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl ChunkStore for FsChunkStore {
    async fn put(&self, transfer_id: &str, index: u32, data: &[u8]) -> Result<(), StoreError> {
        let dir = self.transfer_dir(transfer_id)?;
        let path = Self::chunk_path(&dir, index);
        let previous = file_len(&path).await?;
        let len = data.len() as u64;

        if let Some(quota) = self.quota {
            let usage = self.usage.load(Ordering::Acquire);
            if usage.saturating_sub(previous) + len > quota {
                return Err(StoreError::QuotaExceeded);
            }
        }

        tokio::fs::create_dir_all(&dir).await?;
        let tmp = dir.join(format!("{index:08}.tmp"));
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;

        self.usage.fetch_add(len, Ordering::AcqRel);
        if previous > 0 {
            let _ = self
                .usage
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |u| {
                    Some(u.saturating_sub(previous))
                });
        }
        Ok(())
    }

    async fn count_for(&self, transfer_id: &str) -> Result<u32, StoreError> {
        let dir = self.transfer_dir(transfer_id)?;
        Ok(self.indices(&dir).await?.len() as u32)
    }

    async fn all_ordered_for(&self, transfer_id: &str) -> Result<Vec<(u32, Vec<u8>)>, StoreError> {
        let dir = self.transfer_dir(transfer_id)?;
        let mut out = Vec::new();
        for index in self.indices(&dir).await? {
            let data = tokio::fs::read(Self::chunk_path(&dir, index)).await?;
            out.push((index, data));
        }
        Ok(out)
    }

    async fn range_for(
        &self,
        transfer_id: &str,
        start: u32,
        len: u32,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        let dir = self.transfer_dir(transfer_id)?;
        let mut out = Vec::with_capacity(len as usize);
        for index in start..start.saturating_add(len) {
            match tokio::fs::read(Self::chunk_path(&dir, index)).await {
                Ok(data) => out.push(data),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(StoreError::Missing(index));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(out)
    }

    async fn delete_all_for(&self, transfer_id: &str) -> Result<(), StoreError> {
        let dir = self.transfer_dir(transfer_id)?;
        let freed = match tokio::fs::metadata(&dir).await {
            Ok(_) => dir_usage(&dir).await?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        tokio::fs::remove_dir_all(&dir).await?;
        let _ = self
            .usage
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |u| {
                Some(u.saturating_sub(freed))
            });
        debug!(transfer = %transfer_id, freed, "ledger cleared");
        Ok(())
    }

    async fn estimate(&self) -> Result<Option<StorageEstimate>, StoreError> {
        Ok(self.quota.map(|quota| StorageEstimate {
            usage: self.usage.load(Ordering::Acquire),
            quota,
        }))
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Chunk store held in memory.
#[derive(Default)]
pub struct MemoryChunkStore {
    chunks: Mutex<BTreeMap<(String, u32), Vec<u8>>>,
    quota: Option<u64>,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota: u64) -> Self {
        Self {
            chunks: Mutex::default(),
            quota: Some(quota),
        }
    }

    async fn usage(&self) -> u64 {
        self.chunks
            .lock()
            .await
            .values()
            .map(|v| v.len() as u64)
            .sum()
    }
}

fn transfer_range(transfer_id: &str) -> std::ops::RangeInclusive<(String, u32)> {
    (transfer_id.to_string(), 0)..=(transfer_id.to_string(), u32::MAX)
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    async fn put(&self, transfer_id: &str, index: u32, data: &[u8]) -> Result<(), StoreError> {
        check_key(transfer_id)?;
        let mut chunks = self.chunks.lock().await;
        if let Some(quota) = self.quota {
            let usage: u64 = chunks.values().map(|v| v.len() as u64).sum();
            let previous = chunks
                .get(&(transfer_id.to_string(), index))
                .map_or(0, |v| v.len() as u64);
            if usage - previous + data.len() as u64 > quota {
                return Err(StoreError::QuotaExceeded);
            }
        }
        chunks.insert((transfer_id.to_string(), index), data.to_vec());
        Ok(())
    }

    async fn count_for(&self, transfer_id: &str) -> Result<u32, StoreError> {
        check_key(transfer_id)?;
        let chunks = self.chunks.lock().await;
        Ok(chunks.range(transfer_range(transfer_id)).count() as u32)
    }

    async fn all_ordered_for(&self, transfer_id: &str) -> Result<Vec<(u32, Vec<u8>)>, StoreError> {
        check_key(transfer_id)?;
        let chunks = self.chunks.lock().await;
        Ok(chunks
            .range(transfer_range(transfer_id))
            .map(|((_, index), data)| (*index, data.clone()))
            .collect())
    }

    async fn range_for(
        &self,
        transfer_id: &str,
        start: u32,
        len: u32,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        check_key(transfer_id)?;
        let chunks = self.chunks.lock().await;
        (start..start.saturating_add(len))
            .map(|index| {
                chunks
                    .get(&(transfer_id.to_string(), index))
                    .cloned()
                    .ok_or(StoreError::Missing(index))
            })
            .collect()
    }

    async fn delete_all_for(&self, transfer_id: &str) -> Result<(), StoreError> {
        check_key(transfer_id)?;
        let mut chunks = self.chunks.lock().await;
        chunks.retain(|(id, _), _| id != transfer_id);
        Ok(())
    }

    async fn estimate(&self) -> Result<Option<StorageEstimate>, StoreError> {
        match self.quota {
            Some(quota) => Ok(Some(StorageEstimate {
                usage: self.usage().await,
                quota,
            })),
            None => Ok(None),
        }
    }
}
