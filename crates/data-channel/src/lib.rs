//! Bidirectional data channel for peer-to-peer transfers.
//!
//! A [`Channel`] carries [`peerdrop_protocol::Message`]s over some transport
//! and exposes the transport's buffered amount so senders can apply
//! backpressure. Transports:
//!
//! - [`memory`]: in-process link.
//! - [`ws`]: WebSocket link.
//! - [`broker`]: channels paired up by a rendezvous broker.
//! - [`manual`]: channels established by hand-carried offer/answer signals.
//!
//! # Wire format
//!
//! See [`codec`] for how messages are framed per [`ChannelMode`].

pub mod broker;
pub mod channel;
pub mod codec;
pub mod error;
pub mod manual;
pub mod memory;
pub mod ws;

pub use broker::{Broker, BrokerError, MemoryBroker, register_peer};
pub use channel::{Channel, ChannelEnd, FlowControl, Inbound, channel};
pub use codec::{ChannelMode, Frame};
pub use error::DataChannelError;
pub use manual::{ManualSignaling, PeerConnector, SessionDescription, SignalError};
