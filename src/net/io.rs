//! Per-connection background tasks
//!
//! Each connection has a writer task that owns the socket while its queue is
//! non-empty, and a reader task that decodes incoming frames and dispatches
//! them. Both end when the connection goes defunct or the transport shuts
//! down; cleanup aborts whatever is left.

use std::sync::Arc;

use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio::sync::Notify;
use tokio_util::codec::FramedRead;

use super::{ConnId, Flush, WireSink};
use crate::error::{Error, Result};
use crate::transport::{Incoming, Shared};
use crate::wire::{AckBody, Handshake, MessageType, WireCodec, WireFrame};

/// Drain the connection's queue whenever a sender hands off to us
pub(crate) async fn run_writer(
    shared: Arc<Shared>,
    id: ConnId,
    wake: Arc<Notify>,
    sink: Arc<dyn WireSink>,
) {
    let limit = shared.config.replication.queue_limit;

    loop {
        tokio::select! {
            _ = wake.notified() => {}
            _ = shared.shutdown.cancelled() => return,
        }

        loop {
            {
                let mut state = shared.state.lock().await;
                let Some(conn) = state.conns.get_mut(&id) else {
                    return;
                };
                if conn.is_defunct() {
                    return;
                }
                match conn.flush_queue(limit) {
                    Flush::Drained => break,
                    Flush::WouldBlock => {}
                    Flush::Failed(e) => {
                        shared.mark_defunct(&mut state, id, &e.to_string());
                        return;
                    }
                }
            }

            let ready = tokio::select! {
                r = sink.writable() => r,
                _ = shared.shutdown.cancelled() => return,
            };
            if let Err(e) = ready {
                let mut state = shared.state.lock().await;
                shared.mark_defunct(&mut state, id, &e.to_string());
                return;
            }
        }
    }
}

/// Decode frames from the socket until it closes or errors
pub(crate) async fn run_reader<R>(shared: Arc<Shared>, id: ConnId, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let codec = WireCodec::new(shared.config.replication.max_message_size);
    let mut frames = FramedRead::new(reader, codec);

    let reason = loop {
        let next = tokio::select! {
            next = frames.next() => next,
            _ = shared.shutdown.cancelled() => return,
        };

        match next {
            Some(Ok(frame)) => {
                if let Err(e) = shared.dispatch(id, frame).await {
                    break e.to_string();
                }
            }
            Some(Err(e)) => break e.to_string(),
            None => break "closed by peer".to_string(),
        }
    };

    let mut state = shared.state.lock().await;
    shared.mark_defunct(&mut state, id, &reason);
}

impl Shared {
    async fn dispatch(self: &Arc<Self>, id: ConnId, frame: WireFrame) -> Result<()> {
        let Some(kind) = frame.kind() else {
            tracing::debug!("Ignoring unknown message type {} on {}", frame.msg_type, id);
            return Ok(());
        };

        match kind {
            MessageType::Handshake => {
                let handshake = Handshake::from_bytes(&frame.control)?;
                let mut state = self.state.lock().await;
                self.on_handshake(&mut state, id, handshake)
            }
            MessageType::Ack => {
                let ack = AckBody::from_bytes(&frame.control)?;
                let mut state = self.state.lock().await;
                let eid = ready_eid(&state, id)?;
                self.record_ack(&mut state, eid, ack.lsn);
                Ok(())
            }
            MessageType::RepMessage => {
                let eid = ready_eid(&*self.state.lock().await, id)?;
                let incoming = Incoming {
                    eid,
                    control: frame.control,
                    payload: frame.payload,
                };
                if self.incoming_tx.send(incoming).await.is_err() {
                    tracing::debug!("No receiver for replication messages, dropped one from {}", eid);
                }
                Ok(())
            }
            MessageType::Heartbeat => {
                tracing::trace!("Heartbeat on {}", id);
                Ok(())
            }
        }
    }
}

/// Site behind a connection that has completed its handshake
fn ready_eid(state: &crate::transport::State, id: ConnId) -> Result<crate::site::Eid> {
    state
        .conns
        .get(&id)
        .filter(|c| c.is_ready())
        .and_then(|c| c.eid)
        .ok_or_else(|| Error::Protocol(format!("message before handshake on {}", id)))
}
