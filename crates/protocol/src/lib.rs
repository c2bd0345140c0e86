//! Wire protocol types for PeerDrop transfers.
//!
//! Messages are JSON objects with a `type` tag. Binary-capable channels
//! carry chunk payloads raw; text-only channels embed them as base64
//! data URLs (see [`messages::data_url`]).

pub mod constants;
pub mod messages;

// Re-export primary types for convenience.
pub use constants::{CHUNK_SIZE, is_allowed_mime, total_chunks};
pub use messages::{
    ChatMessage, ChunkHeader, ChunkMessage, Message, RejectReason, TransferAccepted,
    TransferMeta, TransferRejected,
};
