use std::time::Duration;

/// Size of one chunk on the wire (64 KiB).
///
/// Small enough to bound per-message overhead on the data channel, large
/// enough to keep the message count of a 500 MiB transfer under 10k.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Outstanding buffered bytes above which the sender suspends (1 MiB).
pub const FLOW_CONTROL_THRESHOLD: usize = 1024 * 1024;

/// How long a sender waits for `transfer-accepted` / `transfer-rejected`.
pub const ACCEPT_TIMEOUT: Duration = Duration::from_secs(60);

/// How often a `ping` is sent while the channel is open.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Hard cap on a single transfer, enforced on the receiving side (500 MiB).
pub const MAX_TRANSFER_SIZE: u64 = 500 * 1024 * 1024;

/// Number of chunks coalesced in memory before a chunk-store flush.
pub const WRITE_BATCH_SIZE: usize = 50;

/// Transfers with more chunks than this are reassembled by streaming
/// read-back instead of being materialized in memory.
pub const STREAMING_THRESHOLD_CHUNKS: u32 = 100;

/// Chunks read per batch during streaming read-back.
pub const READBACK_BATCH_SIZE: u32 = 5;

/// The sender yields to the scheduler after this many chunks.
pub const YIELD_EVERY_CHUNKS: u32 = 4;

/// MIME types a receiver is allowed to deliver.
///
/// Both ends enforce this list identically; anything else is rejected after
/// reassembly regardless of how it arrived.
pub const ALLOWED_MIME_TYPES: &[&str] = &[
    "application/pdf",
    "text/plain",
    "text/markdown",
    "text/html",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "application/vnd.ms-powerpoint",
    "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    "image/jpeg",
    "image/png",
    "image/gif",
    "image/webp",
    "image/svg+xml",
    "audio/mpeg",
    "audio/wav",
    "audio/ogg",
    "video/mp4",
    "video/webm",
    "video/ogg",
    "application/zip",
    "application/x-zip-compressed",
];

/// Returns `true` if `mime` is on the allow-list.
pub fn is_allowed_mime(mime: &str) -> bool {
    ALLOWED_MIME_TYPES.contains(&mime)
}

/// Number of chunks needed for `size` bytes (`ceil(size / CHUNK_SIZE)`).
///
/// `None` when the count does not fit the `u32` chunk index.
pub fn total_chunks(size: u64) -> Option<u32> {
    u32::try_from(size.div_ceil(CHUNK_SIZE as u64)).ok()
}
