//! WebSocket transport for a [`Channel`].
//!
//! Two pumps bridge a [`ChannelEnd`] and a WebSocket stream:
//! - the write pump drains outbound frames and releases flow-control credit
//!   once each frame has been handed to the socket;
//! - the read pump forwards text and binary frames inbound.
//!
//! Either pump ending cancels the channel token, which stops the other.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{WebSocketStream, tungstenite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::DataChannelError;
use crate::channel::{Channel, ChannelEnd, FlowControl, Inbound, channel};
use crate::codec::{ChannelMode, Frame};

/// Wraps an established WebSocket as a data channel.
pub fn attach<S>(ws: WebSocketStream<S>, mode: ChannelMode) -> (Channel, Inbound)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (ch, inbound, end) = channel(mode, CancellationToken::new());
    let (write, read) = ws.split();
    let ChannelEnd {
        outbound,
        inbound: inbound_tx,
        flow,
        closed,
        ..
    } = end;

    tokio::spawn(write_pump(write, outbound, flow, closed.clone()));
    tokio::spawn(read_pump(read, inbound_tx, closed));

    (ch, inbound)
}

/// Dials a WebSocket peer and opens a data channel over it.
pub async fn connect(url: &str, mode: ChannelMode) -> Result<(Channel, Inbound), DataChannelError> {
    let (ws, _) = tokio_tungstenite::connect_async(url).await?;
    info!(%url, ?mode, "data channel connected");
    Ok(attach(ws, mode))
}

/// Completes the WebSocket handshake on an accepted TCP stream.
pub async fn accept(
    stream: TcpStream,
    mode: ChannelMode,
) -> Result<(Channel, Inbound), DataChannelError> {
    let peer = stream.peer_addr().ok();
    let ws = tokio_tungstenite::accept_async(stream).await?;
    info!(?peer, ?mode, "data channel accepted");
    Ok(attach(ws, mode))
}

fn to_ws(frame: Frame) -> tungstenite::Message {
    match frame {
        Frame::Text(text) => tungstenite::Message::Text(text.into()),
        Frame::Binary(data) => tungstenite::Message::Binary(data.into()),
    }
}

/// Writes outbound frames to the socket.
pub(crate) async fn write_pump<S>(
    mut write: S,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    flow: Arc<FlowControl>,
    closed: CancellationToken,
) where
    S: SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                let n = frame.len();
                let result = write.send(to_ws(frame)).await;
                flow.release(n);
                if let Err(e) = result {
                    error!("data channel write error: {e}");
                    break;
                }
            }
        }
    }

    closed.cancel();
    let _ = write.send(tungstenite::Message::Close(None)).await;
}

/// Forwards frames read from the socket to the inbound queue.
pub(crate) async fn read_pump<S>(
    mut read: S,
    inbound: mpsc::Sender<Frame>,
    closed: CancellationToken,
) where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    loop {
        let msg = tokio::select! {
            _ = closed.cancelled() => break,
            msg = read.next() => msg,
        };

        let frame = match msg {
            Some(Ok(tungstenite::Message::Text(text))) => Frame::Text(text.as_str().to_owned()),
            Some(Ok(tungstenite::Message::Binary(data))) => Frame::Binary(data.to_vec()),
            Some(Ok(tungstenite::Message::Close(_))) => {
                debug!("received close frame");
                break;
            }
            Some(Ok(_)) => {
                trace!("ignoring control frame");
                continue;
            }
            Some(Err(e)) => {
                warn!("data channel read error: {e}");
                break;
            }
            None => {
                debug!("data channel stream ended");
                break;
            }
        };

        if inbound.send(frame).await.is_err() {
            break;
        }
    }

    closed.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{sink, stream};
    use std::time::Duration;

    #[tokio::test]
    async fn write_pump_releases_credit_and_closes() {
        let (sink_tx, mut sink_rx) = mpsc::channel::<tungstenite::Message>(16);
        let sink = Box::pin(sink::unfold(
            sink_tx,
            |tx, msg: tungstenite::Message| async move {
                let _ = tx.send(msg).await;
                Ok::<_, tungstenite::Error>(tx)
            },
        ));

        let closed = CancellationToken::new();
        let (ch, _inbound, end) = channel(ChannelMode::Broker, closed.clone());
        let handle = tokio::spawn(write_pump(sink, end.outbound, end.flow, closed.clone()));

        ch.send(&peerdrop_protocol::Message::Ping).unwrap();
        let first = sink_rx.recv().await.unwrap();
        assert!(matches!(first, tungstenite::Message::Text(_)));

        tokio::time::timeout(Duration::from_secs(2), async {
            while ch.buffered_amount() != 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("credit should be released");

        closed.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("should stop")
            .expect("no panic");
        assert!(matches!(
            sink_rx.recv().await,
            Some(tungstenite::Message::Close(_))
        ));
    }

    #[tokio::test]
    async fn write_pump_stops_on_sink_error() {
        let sink = Box::pin(sink::unfold((), |_, _msg: tungstenite::Message| async move {
            Err::<(), _>(tungstenite::Error::ConnectionClosed)
        }));
        let closed = CancellationToken::new();
        let (ch, _inbound, end) = channel(ChannelMode::Manual, closed.clone());
        ch.send(&peerdrop_protocol::Message::Ping).unwrap();

        write_pump(sink, end.outbound, end.flow, closed.clone()).await;
        assert!(closed.is_cancelled());
        assert_eq!(ch.buffered_amount(), 0);
    }

    #[tokio::test]
    async fn read_pump_forwards_text_and_binary() {
        let items = vec![
            Ok(tungstenite::Message::Text(r#"{"type":"ping"}"#.into())),
            Ok(tungstenite::Message::Ping(vec![].into())),
            Ok(tungstenite::Message::Binary(vec![0, 0, 0, 0].into())),
        ];
        let (tx, mut rx) = mpsc::channel(16);
        let closed = CancellationToken::new();

        read_pump(stream::iter(items), tx, closed.clone()).await;

        assert_eq!(
            rx.recv().await,
            Some(Frame::Text(r#"{"type":"ping"}"#.into()))
        );
        assert_eq!(rx.recv().await, Some(Frame::Binary(vec![0, 0, 0, 0])));
        // Stream end closes the channel.
        assert!(closed.is_cancelled());
    }

    #[tokio::test]
    async fn read_pump_stops_at_close_frame() {
        let items = vec![
            Ok(tungstenite::Message::Close(None)),
            Ok(tungstenite::Message::Text("late".into())),
        ];
        let (tx, mut rx) = mpsc::channel(16);
        let closed = CancellationToken::new();

        read_pump(stream::iter(items), tx, closed.clone()).await;

        assert!(rx.recv().await.is_none());
        assert!(closed.is_cancelled());
    }

    #[tokio::test]
    async fn loopback_over_tcp() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            accept(stream, ChannelMode::Broker).await.unwrap()
        });
        let (client, _client_in) = connect(&format!("ws://{addr}"), ChannelMode::Broker)
            .await
            .unwrap();
        let (_server_ch, mut server_in) = server.await.unwrap();

        let chunk = peerdrop_protocol::Message::Chunk(peerdrop_protocol::ChunkMessage {
            transfer_id: "t1".into(),
            name: "a.bin".into(),
            index: 0,
            total: 1,
            data: vec![7; 1024],
        });
        client.send(&chunk).unwrap();

        let got = tokio::time::timeout(Duration::from_secs(5), server_in.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(got, chunk);

        client.close();
        let end = tokio::time::timeout(Duration::from_secs(5), server_in.recv())
            .await
            .unwrap();
        assert!(end.is_none());
    }
}
