//! Inbound dispatch: routes every received message to its handler.

use std::sync::Arc;

use peerdrop_data_channel::{DataChannelError, Inbound};
use peerdrop_protocol::{
    ChunkMessage, Message, RejectReason, TransferAccepted, TransferMeta, TransferRejected,
};
use peerdrop_transfer::{
    Acceptance, Delivery, Direction, ErrorKind, ReceiveSession, TransferError, TransferEvent,
};
use tracing::{debug, info, trace, warn};

use crate::manager::Inner;
use crate::types::SessionEvent;

/// Reads the channel until it closes, then tears the connection down.
pub(crate) async fn dispatch_loop(inner: Arc<Inner>, mut inbound: Inbound) {
    while let Some(msg) = inbound.recv().await {
        match msg {
            Ok(msg) => handle_message(&inner, msg).await,
            Err(e) => warn!("dropping undecodable frame: {e}"),
        }
    }
    on_closed(&inner).await;
}

pub(crate) async fn handle_message(inner: &Arc<Inner>, msg: Message) {
    trace!(kind = msg.kind(), transfer = ?msg.transfer_id(), "received message");
    match msg {
        Message::Meta(meta) => handle_meta(inner, meta).await,
        Message::Chunk(chunk) => handle_chunk(inner, chunk).await,
        Message::TransferAccepted(a) => {
            resolve(
                inner,
                &a.transfer_id,
                Acceptance::Accepted {
                    resume_index: a.resume_index,
                },
            )
            .await
        }
        Message::TransferRejected(r) => {
            resolve(inner, &r.transfer_id, Acceptance::Rejected(r.reason)).await
        }
        Message::Chat(chat) => inner.emit(SessionEvent::Chat(chat)),
        Message::Ping => {}
        Message::Unknown => warn!("ignoring message of unknown type"),
    }
}

fn reply_accepted(inner: &Inner, transfer_id: &str, resume_index: u32) {
    let msg = Message::TransferAccepted(TransferAccepted {
        transfer_id: transfer_id.to_string(),
        resume_index,
    });
    if let Err(e) = inner.channel.send(&msg) {
        warn!(transfer = %transfer_id, "failed to send acceptance: {e}");
    }
}

fn reply_rejected(inner: &Inner, transfer_id: &str, reason: RejectReason) {
    let msg = Message::TransferRejected(TransferRejected {
        transfer_id: transfer_id.to_string(),
        reason,
    });
    if let Err(e) = inner.channel.send(&msg) {
        warn!(transfer = %transfer_id, "failed to send rejection: {e}");
    }
}

async fn handle_meta(inner: &Arc<Inner>, meta: TransferMeta) {
    let id = meta.transfer_id.clone();
    let mut receivers = inner.receivers.lock().await;

    // Re-entry: the sender re-offered a transfer that is still open.
    if let Some(session) = receivers.get_mut(&id) {
        if session.meta() != &meta {
            warn!(transfer = %id, "conflicting meta for open transfer, rejecting");
            reply_rejected(inner, &id, RejectReason::InvalidMeta);
            return;
        }
        if let Err(e) = session.flush().await {
            warn!(transfer = %id, "flush before re-acceptance failed: {e}");
        }
        debug!(transfer = %id, resume_index = session.received(), "duplicate meta, re-accepting");
        reply_accepted(inner, &id, session.received());
        return;
    }

    let session =
        match ReceiveSession::accept(meta.clone(), inner.store.clone(), &inner.config.receiver)
            .await
        {
            Ok(session) => session,
            Err(rejection) => {
                info!(transfer = %id, reason = %rejection.reason, "rejecting offer: {}", rejection.error);
                reply_rejected(inner, &id, rejection.reason);
                inner.emit_transfer(TransferEvent::failed(&id, &rejection.error));
                return;
            }
        };

    reply_accepted(inner, &id, session.resume_index());
    inner.emit_transfer(TransferEvent::Started {
        meta,
        direction: Direction::Incoming,
    });

    // Everything was already persisted; no chunk will arrive to trigger this.
    if session.is_complete() {
        drop(receivers);
        finalize(inner, session).await;
        return;
    }
    receivers.insert(id, session);
}

async fn handle_chunk(inner: &Arc<Inner>, chunk: ChunkMessage) {
    let id = chunk.transfer_id.clone();
    let index = chunk.index;
    let mut receivers = inner.receivers.lock().await;
    let Some(session) = receivers.get_mut(&id) else {
        debug!(transfer = %id, index, "chunk for unknown transfer dropped");
        return;
    };

    match session.on_chunk(chunk).await {
        Ok(progress) if progress.duplicate => {}
        Ok(progress) => {
            inner.emit_transfer(TransferEvent::ReceiveProgress {
                transfer_id: id.clone(),
                received: progress.received,
                total: progress.total,
                percent: progress.percent,
            });
            if progress.is_complete() {
                if let Some(session) = receivers.remove(&id) {
                    drop(receivers);
                    finalize(inner, session).await;
                }
            }
        }
        Err(e) if e.kind() == ErrorKind::Storage => {
            warn!(transfer = %id, index, "storage failure, aborting receive: {e}");
            if let Some(session) = receivers.remove(&id) {
                drop(receivers);
                session.abort().await;
            }
            inner.emit_transfer(TransferEvent::failed(&id, &e));
        }
        Err(e) => warn!(transfer = %id, index, "chunk dropped: {e}"),
    }
}

async fn finalize(inner: &Arc<Inner>, session: ReceiveSession) {
    let id = session.transfer_id().to_string();
    match session.finalize().await {
        Ok(Delivery::Received(file)) => {
            inner.emit_transfer(TransferEvent::FileReceived {
                transfer_id: id,
                file,
            })
        }
        Ok(Delivery::Saved { path }) => {
            inner.emit_transfer(TransferEvent::FileSaved {
                transfer_id: id,
                path,
            })
        }
        Err(e) => inner.emit_transfer(TransferEvent::failed(&id, &e)),
    }
}

async fn resolve(inner: &Arc<Inner>, transfer_id: &str, acceptance: Acceptance) {
    match inner.pending.lock().await.remove(transfer_id) {
        Some(tx) => {
            let _ = tx.send(acceptance);
        }
        None => debug!(transfer = %transfer_id, "answer for unknown or settled offer ignored"),
    }
}

async fn on_closed(inner: &Arc<Inner>) {
    let sessions: Vec<ReceiveSession> = inner
        .receivers
        .lock()
        .await
        .drain()
        .map(|(_, s)| s)
        .collect();
    for session in sessions {
        let id = session.transfer_id().to_string();
        session.abort().await;
        let err = TransferError::Channel(DataChannelError::Closed);
        inner.emit_transfer(TransferEvent::failed(&id, &err));
    }

    // Dropping the resolvers fails any sender still waiting for an answer.
    inner.pending.lock().await.clear();

    info!("channel closed");
    inner.emit(SessionEvent::Disconnected);
}
