//! Send path
//!
//! Direct sends may block (bounded) while a connection's queue is full;
//! broadcasts never block and drop on full queues instead.

use tokio::time::Instant;

use super::{ConnId, Inline};
use crate::error::{Error, Result};
use crate::perm::SendCounts;
use crate::transport::{Shared, State};
use crate::wire::OutboundMessage;

/// How a message left the send path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Written to the socket
    Sent,
    /// On the connection's outbound queue
    Queued,
    /// Discarded because the queue was full
    Dropped,
}

impl Shared {
    /// Send to one connection.
    ///
    /// A blockable send that finds the queue full waits for the background
    /// writer to make room, for at most `ack_timeout * queue_limit` in total,
    /// and fails with `Timeout` after that. A non-blockable send drops.
    pub(crate) async fn send_one(
        &self,
        id: ConnId,
        msg: &mut OutboundMessage,
        blockable: bool,
    ) -> Result<Delivery> {
        let limit = self.config.replication.queue_limit;
        let deadline = Instant::now() + self.config.queue_wait();
        let mut state = self.state.lock().await;

        loop {
            let Some(conn) = state.conns.get_mut(&id) else {
                return Err(Error::Unavailable(format!("{} is closed", id)));
            };

            let drained = match conn.write_inline(msg, limit, blockable) {
                Inline::Sent => return Ok(Delivery::Sent),
                Inline::Queued | Inline::Handoff => {
                    state.stats.messages_queued += 1;
                    return Ok(Delivery::Queued);
                }
                Inline::Dropped => {
                    state.stats.messages_dropped += 1;
                    tracing::debug!("Queue full on {}, dropped {}", id, msg.msg_type().name());
                    return Ok(Delivery::Dropped);
                }
                Inline::Failed(e) => {
                    self.mark_defunct(&mut state, id, &e.to_string());
                    return Err(Error::Unavailable(format!("{} failed: {}", id, e)));
                }
                Inline::Full => {
                    if self.shutdown.is_cancelled() {
                        return Err(Error::Timeout);
                    }
                    conn.blockers += 1;
                    conn.drained()
                }
            };

            // Registered before the lock is released so a dequeue in between
            // still wakes us.
            let notified = drained.notified();
            drop(state);

            let woken = tokio::select! {
                _ = notified => true,
                _ = tokio::time::sleep_until(deadline) => false,
                _ = self.shutdown.cancelled() => false,
            };

            state = self.state.lock().await;
            let last_out = match state.conns.get_mut(&id) {
                Some(conn) => {
                    conn.blockers -= 1;
                    conn.is_defunct() && conn.blockers == 0
                }
                None => false,
            };
            if last_out {
                // The reaper stops on shutdown, so tear down here instead.
                if self.shutdown.is_cancelled() {
                    self.cleanup(&mut state, id);
                } else {
                    self.requeue_cleanup(id);
                }
            }

            if !woken {
                tracing::debug!("Send on {} gave up waiting for the queue to drain", id);
                return Err(Error::Timeout);
            }
        }
    }

    /// Send to every ready connection whose peer understands the message.
    ///
    /// Never blocks. A message dropped on a full queue still counts as sent;
    /// connections that fail are marked defunct after the pass.
    pub(crate) fn send_broadcast(&self, state: &mut State, msg: &mut OutboundMessage) -> SendCounts {
        let limit = self.config.replication.queue_limit;
        let mut counts = SendCounts::default();
        let mut failed = Vec::new();

        for (id, conn) in state.conns.iter_mut() {
            if !conn.is_ready() || !conn.version.supports(msg.msg_type()) {
                continue;
            }
            let Some(eid) = conn.eid else {
                continue;
            };

            match conn.write_inline(msg, limit, false) {
                Inline::Sent => {}
                Inline::Queued | Inline::Handoff => state.stats.messages_queued += 1,
                Inline::Dropped | Inline::Full => state.stats.messages_dropped += 1,
                Inline::Failed(e) => {
                    failed.push((*id, e));
                    continue;
                }
            }

            counts.sites += 1;
            if state.sites.get(eid).map_or(false, |s| s.is_peer()) {
                counts.peers += 1;
            }
        }

        for (id, e) in failed {
            self.mark_defunct(state, id, &e.to_string());
        }
        counts
    }
}
