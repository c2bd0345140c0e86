//! Public types for the session manager.

use std::time::Duration;

use peerdrop_protocol::ChatMessage;
use peerdrop_protocol::constants::{ACCEPT_TIMEOUT, HEARTBEAT_INTERVAL};
use peerdrop_transfer::{ReceiverConfig, TransferEvent};

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Period between `ping` messages.
    pub heartbeat_interval: Duration,
    /// How long an outgoing offer waits for an answer.
    pub accept_timeout: Duration,
    pub receiver: ReceiverConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: HEARTBEAT_INTERVAL,
            accept_timeout: ACCEPT_TIMEOUT,
            receiver: ReceiverConfig::default(),
        }
    }
}

/// Events emitted by the session manager.
#[derive(Debug)]
pub enum SessionEvent {
    /// Progress or outcome of a transfer in either direction.
    Transfer(TransferEvent),
    /// The peer sent a chat message.
    Chat(ChatMessage),
    /// The channel closed. No further events follow.
    Disconnected,
}
