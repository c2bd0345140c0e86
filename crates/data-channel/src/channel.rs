//! Transport-agnostic channel with buffered-amount flow control.
//!
//! [`channel`] returns three parts:
//! - [`Channel`]: cloneable send half used by transfer sessions.
//! - [`Inbound`]: receive half used by the session manager.
//! - [`ChannelEnd`]: the side a transport pumps. It drains outbound frames,
//!   calls [`FlowControl::release`] once bytes leave its queue, and pushes
//!   received frames inbound.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use peerdrop_protocol::Message;
use peerdrop_protocol::constants::FLOW_CONTROL_THRESHOLD;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::DataChannelError;
use crate::codec::{self, ChannelMode, Frame};

/// Inbound frame queue depth.
const INBOUND_CAPACITY: usize = 64;

/// Outstanding-bytes accounting shared between a channel and its transport.
#[derive(Debug)]
pub struct FlowControl {
    buffered: AtomicUsize,
    threshold: usize,
    drained: Notify,
}

impl FlowControl {
    pub fn new(threshold: usize) -> Self {
        Self {
            buffered: AtomicUsize::new(0),
            threshold,
            drained: Notify::new(),
        }
    }

    /// Bytes handed to the channel but not yet taken by the transport.
    pub fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Returns `true` while the sender should hold back.
    pub fn is_saturated(&self) -> bool {
        self.buffered_amount() > self.threshold
    }

    fn reserve(&self, n: usize) {
        self.buffered.fetch_add(n, Ordering::AcqRel);
    }

    /// Marks `n` bytes as sent. Wakes drain waiters once at or below the
    /// threshold.
    pub fn release(&self, n: usize) {
        let prev = self
            .buffered
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |b| {
                Some(b.saturating_sub(n))
            })
            .unwrap_or(0);
        if prev.saturating_sub(n) <= self.threshold {
            self.drained.notify_waiters();
        }
    }

    /// Waits until the buffered amount is at or below the threshold.
    pub async fn drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            // Register before checking so a release in between is not lost.
            notified.as_mut().enable();
            if !self.is_saturated() {
                return;
            }
            notified.await;
        }
    }
}

/// Send half of a data channel.
#[derive(Debug, Clone)]
pub struct Channel {
    mode: ChannelMode,
    outbound: mpsc::UnboundedSender<Frame>,
    flow: Arc<FlowControl>,
    closed: CancellationToken,
}

/// Receive half of a data channel.
#[derive(Debug)]
pub struct Inbound {
    mode: ChannelMode,
    rx: mpsc::Receiver<Frame>,
    closed: CancellationToken,
}

/// Transport-facing side of a data channel.
#[derive(Debug)]
pub struct ChannelEnd {
    pub mode: ChannelMode,
    pub outbound: mpsc::UnboundedReceiver<Frame>,
    pub inbound: mpsc::Sender<Frame>,
    pub flow: Arc<FlowControl>,
    pub closed: CancellationToken,
}

/// Creates a channel of the given mode with the default 1 MiB threshold.
pub fn channel(mode: ChannelMode, closed: CancellationToken) -> (Channel, Inbound, ChannelEnd) {
    channel_with_threshold(mode, closed, FLOW_CONTROL_THRESHOLD)
}

/// Creates a channel with a custom flow-control threshold.
pub fn channel_with_threshold(
    mode: ChannelMode,
    closed: CancellationToken,
    threshold: usize,
) -> (Channel, Inbound, ChannelEnd) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::channel(INBOUND_CAPACITY);
    let flow = Arc::new(FlowControl::new(threshold));

    let channel = Channel {
        mode,
        outbound: out_tx,
        flow: flow.clone(),
        closed: closed.clone(),
    };
    let inbound = Inbound {
        mode,
        rx: in_rx,
        closed: closed.clone(),
    };
    let end = ChannelEnd {
        mode,
        outbound: out_rx,
        inbound: in_tx,
        flow,
        closed,
    };
    (channel, inbound, end)
}

impl Channel {
    pub fn mode(&self) -> ChannelMode {
        self.mode
    }

    /// Encodes and queues a message. Never blocks; see [`wait_drained`](Self::wait_drained).
    pub fn send(&self, msg: &Message) -> Result<(), DataChannelError> {
        if self.closed.is_cancelled() {
            return Err(DataChannelError::Closed);
        }
        let frame = codec::encode(self.mode, msg)?;
        let n = frame.len();
        self.flow.reserve(n);
        if self.outbound.send(frame).is_err() {
            self.flow.release(n);
            self.closed.cancel();
            return Err(DataChannelError::Closed);
        }
        trace!(kind = msg.kind(), bytes = n, "queued message");
        Ok(())
    }

    /// Bytes queued but not yet taken by the transport.
    pub fn buffered_amount(&self) -> usize {
        self.flow.buffered_amount()
    }

    /// Returns `true` while the buffered amount is above the threshold.
    pub fn is_saturated(&self) -> bool {
        self.flow.is_saturated()
    }

    /// Suspends until the buffered amount drains below the threshold.
    ///
    /// Fails with [`DataChannelError::Closed`] if the channel closes first.
    pub async fn wait_drained(&self) -> Result<(), DataChannelError> {
        if !self.flow.is_saturated() {
            return Ok(());
        }
        debug!(
            buffered = self.flow.buffered_amount(),
            threshold = self.flow.threshold(),
            "applying backpressure, waiting for drain"
        );
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(DataChannelError::Closed),
            _ = self.flow.drained() => Ok(()),
        }
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the channel is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Token cancelled when the channel closes.
    pub fn close_token(&self) -> CancellationToken {
        self.closed.clone()
    }
}

impl Inbound {
    pub fn mode(&self) -> ChannelMode {
        self.mode
    }

    /// Receives the next message.
    ///
    /// Returns `None` once the channel is closed. Undecodable frames are
    /// returned as `Some(Err(_))` so the caller can log and carry on.
    pub async fn recv(&mut self) -> Option<Result<Message, DataChannelError>> {
        let frame = tokio::select! {
            biased;
            frame = self.rx.recv() => frame,
            _ = self.closed.cancelled() => None,
        };
        match frame {
            Some(frame) => Some(codec::decode(self.mode, frame)),
            None => {
                self.closed.cancel();
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn send_accounts_buffered_bytes() {
        let (ch, _inbound, mut end) = channel(ChannelMode::Manual, CancellationToken::new());
        ch.send(&Message::Ping).unwrap();
        let frame = end.outbound.recv().await.unwrap();
        assert_eq!(ch.buffered_amount(), frame.len());

        end.flow.release(frame.len());
        assert_eq!(ch.buffered_amount(), 0);
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let (ch, _inbound, _end) = channel(ChannelMode::Broker, CancellationToken::new());
        ch.close();
        assert!(matches!(ch.send(&Message::Ping), Err(DataChannelError::Closed)));
    }

    #[tokio::test]
    async fn send_fails_when_transport_dropped() {
        let (ch, _inbound, end) = channel(ChannelMode::Broker, CancellationToken::new());
        drop(end);
        assert!(matches!(ch.send(&Message::Ping), Err(DataChannelError::Closed)));
        assert!(ch.is_closed());
        assert_eq!(ch.buffered_amount(), 0);
    }

    #[tokio::test]
    async fn wait_drained_blocks_until_release() {
        let (ch, _inbound, mut end) =
            channel_with_threshold(ChannelMode::Manual, CancellationToken::new(), 4);
        ch.send(&Message::Ping).unwrap();
        assert!(ch.is_saturated());

        let waiter = {
            let ch = ch.clone();
            tokio::spawn(async move { ch.wait_drained().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        let frame = end.outbound.recv().await.unwrap();
        end.flow.release(frame.len());

        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("drain should wake waiter")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn wait_drained_fails_on_close() {
        let (ch, _inbound, _end) =
            channel_with_threshold(ChannelMode::Manual, CancellationToken::new(), 0);
        ch.send(&Message::Ping).unwrap();
        let waiter = {
            let ch = ch.clone();
            tokio::spawn(async move { ch.wait_drained().await })
        };
        ch.close();
        let result = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(DataChannelError::Closed)));
    }

    #[tokio::test]
    async fn inbound_decodes_frames() {
        let (_ch, mut inbound, end) = channel(ChannelMode::Manual, CancellationToken::new());
        end.inbound
            .send(Frame::Text(r#"{"type":"ping"}"#.into()))
            .await
            .unwrap();
        end.inbound.send(Frame::Text("not json".into())).await.unwrap();

        assert_eq!(inbound.recv().await.unwrap().unwrap(), Message::Ping);
        assert!(inbound.recv().await.unwrap().is_err());
    }

    #[tokio::test]
    async fn inbound_ends_and_closes_when_transport_gone() {
        let (ch, mut inbound, end) = channel(ChannelMode::Broker, CancellationToken::new());
        drop(end);
        assert!(inbound.recv().await.is_none());
        assert!(ch.is_closed());
    }
}
