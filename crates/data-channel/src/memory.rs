//! In-process transport: two channel ends spliced together.
//!
//! Used by [`MemoryBroker`](crate::broker::MemoryBroker), by connectors
//! that carry a manually signaled link, and throughout the tests.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::channel::{Channel, ChannelEnd, FlowControl, Inbound, channel};
use crate::codec::{ChannelMode, Frame};

/// Creates two connected channels sharing one close token.
pub fn link(mode: ChannelMode) -> ((Channel, Inbound), (Channel, Inbound)) {
    let closed = CancellationToken::new();
    let (a, a_in, a_end) = channel(mode, closed.clone());
    let (b, b_in, b_end) = channel(mode, closed);
    splice(a_end, b_end);
    ((a, a_in), (b, b_in))
}

/// Forwards frames between two channel ends until either side closes.
pub fn splice(a: ChannelEnd, b: ChannelEnd) {
    let closed_a = a.closed.clone();
    let closed_b = b.closed.clone();

    tokio::spawn(forward(
        a.outbound,
        a.flow,
        b.inbound,
        closed_a.clone(),
        closed_b.clone(),
    ));
    tokio::spawn(forward(b.outbound, b.flow, a.inbound, closed_b, closed_a));
}

async fn forward(
    mut from: mpsc::UnboundedReceiver<Frame>,
    flow: Arc<FlowControl>,
    to: mpsc::Sender<Frame>,
    closed_from: CancellationToken,
    closed_to: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = closed_from.cancelled() => break,
            _ = closed_to.cancelled() => break,
            frame = from.recv() => frame,
        };
        let Some(frame) = frame else { break };
        let n = frame.len();
        let delivered = to.send(frame).await.is_ok();
        flow.release(n);
        if !delivered {
            break;
        }
        trace!(bytes = n, "forwarded frame");
    }

    closed_from.cancel();
    closed_to.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerdrop_protocol::{ChunkMessage, Message};
    use std::time::Duration;

    #[tokio::test]
    async fn messages_cross_the_link() {
        let ((a, _a_in), (_b, mut b_in)) = link(ChannelMode::Broker);
        let chunk = Message::Chunk(ChunkMessage {
            transfer_id: "t".into(),
            name: "n".into(),
            index: 0,
            total: 1,
            data: vec![1, 2, 3],
        });
        a.send(&chunk).unwrap();
        assert_eq!(b_in.recv().await.unwrap().unwrap(), chunk);
    }

    #[tokio::test]
    async fn close_propagates_to_peer() {
        let ((a, _a_in), (b, mut b_in)) = link(ChannelMode::Manual);
        a.close();
        let end = tokio::time::timeout(Duration::from_secs(2), b_in.recv())
            .await
            .unwrap();
        assert!(end.is_none());
        assert!(b.is_closed());
    }

    #[tokio::test]
    async fn credit_released_after_delivery() {
        let ((a, _a_in), (_b, mut b_in)) = link(ChannelMode::Manual);
        a.send(&Message::Ping).unwrap();
        b_in.recv().await.unwrap().unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while a.buffered_amount() != 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }
}
