//! Error types for the data channel.

/// Errors produced by a data channel.
#[derive(Debug, thiserror::Error)]
pub enum DataChannelError {
    #[error("channel closed")]
    Closed,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("protocol error: {0}")]
    Protocol(String),
}
