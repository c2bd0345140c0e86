use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use peerdrop_protocol::constants::CHUNK_SIZE;
use peerdrop_protocol::{TransferMeta, total_chunks};
use sha2::{Digest, Sha256};
use tempfile::{NamedTempFile, TempPath};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::TransferError;
use crate::validation::mime_from_name;

/// MIME type announced for files whose extension is not recognized.
const FALLBACK_MIME: &str = "application/octet-stream";

/// Length of a transfer id in hex characters.
const TRANSFER_ID_LEN: usize = 32;

/// Numbered variants tried before giving up on a free destination name.
const MAX_NAME_ATTEMPTS: u32 = 1000;

/// Derives the transfer id for a file.
///
/// Same name, size and modification time always give the same id, so a
/// re-attempted transfer finds its earlier chunks in the receiver's ledger.
pub fn transfer_id(name: &str, size: u64, modified_ms: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{name}:{size}:{modified_ms}").as_bytes());
    let mut id = hex::encode(hasher.finalize());
    id.truncate(TRANSFER_ID_LEN);
    id
}

// ---------------------------------------------------------------------------
// SourceFile
// ---------------------------------------------------------------------------

/// A local file about to be sent.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
    pub mime: String,
    /// Last modification, milliseconds since the Unix epoch.
    pub modified_ms: i64,
    pub total_chunks: u32,
}

impl SourceFile {
    /// Stats `path` and captures what the meta needs.
    pub async fn open(path: &Path) -> Result<Self, TransferError> {
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(TransferError::Validation(format!(
                "not a regular file: {}",
                path.display()
            )));
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                TransferError::Validation(format!("no file name: {}", path.display()))
            })?;
        let modified_ms = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        let mime = mime_from_name(&name).unwrap_or(FALLBACK_MIME).to_string();
        let size = metadata.len();
        let chunks = total_chunks(size).ok_or_else(|| {
            TransferError::Validation(format!(
                "{} is too large to index in chunks ({size} bytes)",
                path.display()
            ))
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            name,
            size,
            mime,
            modified_ms,
            total_chunks: chunks,
        })
    }

    pub fn transfer_id(&self) -> String {
        transfer_id(&self.name, self.size, self.modified_ms)
    }

    /// Builds the meta announcing this file.
    pub fn meta(&self, hash: Option<String>) -> TransferMeta {
        TransferMeta {
            transfer_id: self.transfer_id(),
            name: self.name.clone(),
            size: self.size,
            mime: self.mime.clone(),
            total_chunks: self.total_chunks,
            hash,
        }
    }
}

// ---------------------------------------------------------------------------
// ChunkReader
// ---------------------------------------------------------------------------

/// Reads a file by chunk index.
pub struct ChunkReader {
    file: File,
    size: u64,
}

impl ChunkReader {
    pub async fn open(path: &Path) -> Result<Self, TransferError> {
        let file = File::open(path).await?;
        let size = file.metadata().await?.len();
        Ok(Self { file, size })
    }

    /// Total file size in bytes.
    pub fn file_size(&self) -> u64 {
        self.size
    }

    /// Reads the slice `[index * CHUNK_SIZE, min(size, (index + 1) * CHUNK_SIZE))`.
    pub async fn read_chunk(&mut self, index: u32) -> Result<Vec<u8>, TransferError> {
        let offset = u64::from(index) * CHUNK_SIZE as u64;
        if offset >= self.size {
            return Err(TransferError::Validation(format!(
                "chunk {index} starts past end of file ({} bytes)",
                self.size
            )));
        }
        let len = (self.size - offset).min(CHUNK_SIZE as u64) as usize;

        self.file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; len];
        self.file.read_exact(&mut buf).await?;
        Ok(buf)
    }
}

// ---------------------------------------------------------------------------
// ChunkWriter
// ---------------------------------------------------------------------------

/// Writes chunks at their offsets into a hidden part file.
///
/// The part file lives next to its destination so the finished file can be
/// moved into place with a rename. Dropping the writer removes it.
pub struct ChunkWriter {
    file: File,
    part: TempPath,
    written: u64,
}

impl ChunkWriter {
    /// Creates a fresh part file inside `dir`, creating `dir` if needed.
    pub async fn create_in(dir: &Path) -> Result<Self, TransferError> {
        tokio::fs::create_dir_all(dir).await?;
        let (file, part) = part_file_in(dir)?.into_parts();
        Ok(Self {
            file: File::from_std(file),
            part,
            written: 0,
        })
    }

    /// Location of the part file.
    pub fn path(&self) -> &Path {
        &self.part
    }

    /// Payload bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Writes `data` at `index * CHUNK_SIZE`.
    pub async fn write_chunk(&mut self, index: u32, data: &[u8]) -> Result<(), TransferError> {
        let offset = u64::from(index) * CHUNK_SIZE as u64;
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(data).await?;
        self.written += data.len() as u64;
        Ok(())
    }

    /// Flushes and syncs the part file, returning it with its final length.
    ///
    /// The part file is still removed on drop until it is persisted.
    pub async fn finish(mut self) -> Result<(TempPath, u64), TransferError> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        let len = self.file.metadata().await?.len();
        Ok((self.part, len))
    }

    /// Closes and deletes the part file.
    pub async fn discard(self) -> Result<(), TransferError> {
        let Self { file, part, .. } = self;
        drop(file);
        match part.close() {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Destination naming
// ---------------------------------------------------------------------------

/// Opens an empty hidden part file in `dir`.
pub(crate) fn part_file_in(dir: &Path) -> io::Result<NamedTempFile> {
    tempfile::Builder::new()
        .prefix(".peerdrop-")
        .suffix(".part")
        .tempfile_in(dir)
}

/// `name`, then `stem (1).ext`, `stem (2).ext`, ...
fn candidate_names(name: &str) -> impl Iterator<Item = String> + '_ {
    let (stem, ext) = match name.rfind('.') {
        Some(dot) if dot > 0 => name.split_at(dot),
        _ => (name, ""),
    };
    std::iter::once(name.to_string())
        .chain((1..MAX_NAME_ATTEMPTS).map(move |n| format!("{stem} ({n}){ext}")))
}

/// Moves `part` into `dir` under `name`, or under the first free numbered
/// variant. An existing file is never replaced.
pub(crate) fn persist_unique(
    mut part: TempPath,
    dir: &Path,
    name: &str,
) -> Result<PathBuf, TransferError> {
    for candidate in candidate_names(name) {
        let path = dir.join(candidate);
        match part.persist_noclobber(&path) {
            Ok(()) => return Ok(path),
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => part = e.path,
            Err(e) => return Err(e.error.into()),
        }
    }
    Err(TransferError::Io(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free name for {name} in {}", dir.display()),
    )))
}
