//! Heartbeat pump: periodic `ping` while the channel is open.

use std::time::Duration;

use peerdrop_data_channel::Channel;
use peerdrop_protocol::Message;
use tracing::trace;

/// Sends a `ping` every `period` until the channel closes.
pub(crate) async fn heartbeat_pump(channel: Channel, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await; // Skip immediate first tick.

    loop {
        tokio::select! {
            _ = channel.closed() => break,
            _ = interval.tick() => {
                if channel.send(&Message::Ping).is_err() {
                    break;
                }
                trace!("heartbeat sent");
            }
        }
    }
}
