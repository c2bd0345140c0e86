//! Per-connection session layer for PeerDrop.
//!
//! A [`SessionManager`] sits on top of one open data channel. It routes
//! inbound messages to receiving sessions, answers and resolves offers,
//! keeps the link alive with heartbeats and reports everything that
//! happens as [`SessionEvent`]s.

mod dispatch;
mod heartbeat;
pub mod manager;
pub mod types;

pub use manager::SessionManager;
pub use types::{SessionConfig, SessionEvent};
