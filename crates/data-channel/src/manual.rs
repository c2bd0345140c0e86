//! Manual signaling: offer/answer exchanged by hand (QR code, copy-paste).
//!
//! The host creates an offer and shows it as JSON text. The guest applies it
//! and replies with an answer, which the host applies. The peer connection
//! engine itself sits behind [`PeerConnector`]; once signaling completes,
//! [`ManualSignaling::open_channel`] hands it a [`ChannelEnd`] to pump and
//! returns a text-only channel.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::channel::{Channel, ChannelEnd, Inbound, channel};
use crate::codec::ChannelMode;

/// Errors from manual signaling.
#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("malformed signal: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("expected {expected} signal, got {actual}")]
    WrongKind { expected: SdpKind, actual: SdpKind },

    #[error("operation not valid for the {0:?} role")]
    WrongRole(Role),

    #[error("signaling not complete")]
    NotReady,

    #[error("peer connection error: {0}")]
    Engine(String),
}

/// Offer or answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl std::fmt::Display for SdpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        })
    }
}

/// A session description as exchanged between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    /// Serializes to the JSON text shown to the user.
    pub fn to_signal(&self) -> Result<String, SignalError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses signal text, requiring the given kind.
    pub fn from_signal(text: &str, expected: SdpKind) -> Result<Self, SignalError> {
        let desc: Self = serde_json::from_str(text.trim())?;
        if desc.kind != expected {
            return Err(SignalError::WrongKind {
                expected,
                actual: desc.kind,
            });
        }
        Ok(desc)
    }
}

/// Which side of the manual exchange this peer plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Guest,
}

/// Boundary to the peer connection engine.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Creates a local offer (host).
    async fn create_offer(&self) -> Result<SessionDescription, SignalError>;

    /// Applies a remote offer and creates the local answer (guest).
    async fn create_answer(
        &self,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, SignalError>;

    /// Applies the remote answer (host).
    async fn apply_answer(&self, answer: &SessionDescription) -> Result<(), SignalError>;

    /// Starts pumping frames for an open channel.
    async fn attach(&self, end: ChannelEnd) -> Result<(), SignalError>;
}

/// Drives the offer/answer exchange for one peer.
pub struct ManualSignaling<C> {
    connector: C,
    role: Role,
    complete: bool,
}

impl<C: PeerConnector> ManualSignaling<C> {
    /// Starts as the offering side.
    pub fn host(connector: C) -> Self {
        Self {
            connector,
            role: Role::Host,
            complete: false,
        }
    }

    /// Starts as the answering side.
    pub fn guest(connector: C) -> Self {
        Self {
            connector,
            role: Role::Guest,
            complete: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Host: produces the offer signal text.
    pub async fn create_offer(&self) -> Result<String, SignalError> {
        if self.role != Role::Host {
            return Err(SignalError::WrongRole(self.role));
        }
        let offer = self.connector.create_offer().await?;
        debug!("created offer");
        offer.to_signal()
    }

    /// Guest: applies the host's offer and returns the answer signal text.
    pub async fn accept_offer(&mut self, signal: &str) -> Result<String, SignalError> {
        if self.role != Role::Guest {
            return Err(SignalError::WrongRole(self.role));
        }
        let offer = SessionDescription::from_signal(signal, SdpKind::Offer)?;
        let answer = self.connector.create_answer(&offer).await?;
        self.complete = true;
        info!("offer applied, answer ready");
        answer.to_signal()
    }

    /// Host: applies the guest's answer.
    pub async fn accept_answer(&mut self, signal: &str) -> Result<(), SignalError> {
        if self.role != Role::Host {
            return Err(SignalError::WrongRole(self.role));
        }
        let answer = SessionDescription::from_signal(signal, SdpKind::Answer)?;
        self.connector.apply_answer(&answer).await?;
        self.complete = true;
        info!("answer applied");
        Ok(())
    }

    /// Opens the text-only data channel once signaling is complete.
    pub async fn open_channel(&self) -> Result<(Channel, Inbound), SignalError> {
        if !self.complete {
            return Err(SignalError::NotReady);
        }
        let (ch, inbound, end) = channel(ChannelMode::Manual, CancellationToken::new());
        self.connector.attach(end).await?;
        Ok((ch, inbound))
    }
}
