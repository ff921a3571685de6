//! Connection object and state machine
//!
//! ```text
//! CONNECTING -> READY <-> CONGESTED
//!      \          |          /
//!       +----> DEFUNCT <----+
//! ```
//!
//! `DEFUNCT` is terminal. A defunct connection is never written to again and
//! is only torn down by the transport's cleanup path, once no sender is
//! blocked on it.

use std::io;
use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::queue::OutboundQueue;
use super::{ConnId, WireSink};
use crate::site::Eid;
use crate::wire::{OutboundMessage, ProtocolVersion};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Socket open, handshake not yet complete
    Connecting,
    /// Handshake complete
    Ready,
    /// Outbound queue at its limit
    Congested,
    /// I/O failed; waiting for cleanup
    Defunct,
}

impl std::fmt::Display for ConnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnState::Connecting => write!(f, "CONNECTING"),
            ConnState::Ready => write!(f, "READY"),
            ConnState::Congested => write!(f, "CONGESTED"),
            ConnState::Defunct => write!(f, "DEFUNCT"),
        }
    }
}

/// Result of the non-blocking part of a send
#[derive(Debug)]
pub enum Inline {
    /// Fully written to the socket
    Sent,
    /// Appended behind messages already queued
    Queued,
    /// Socket would block; remainder queued and the writer must be woken
    Handoff,
    /// Queue full on a non-blockable send; message discarded
    Dropped,
    /// Queue full on a blockable send; caller should wait for drainage
    Full,
    /// Write failed; connection must be marked defunct
    Failed(io::Error),
}

/// Result of a background flush of the queue
#[derive(Debug)]
pub enum Flush {
    /// Queue empty; socket ownership returns to inline senders
    Drained,
    /// Socket buffer full; wait for writability
    WouldBlock,
    /// Write failed; connection must be marked defunct
    Failed(io::Error),
}

/// A connection to one remote site
pub struct Connection {
    /// Connection identifier
    pub id: ConnId,
    /// Owning site; unknown on inbound connections until the handshake
    pub eid: Option<Eid>,
    /// Remote address, for logging
    pub label: String,
    /// Whether this side opened the connection
    pub initiated_locally: bool,
    /// Version negotiated with the peer
    pub version: ProtocolVersion,
    state: ConnState,
    was_ready: bool,
    queue: OutboundQueue,
    /// Senders currently waiting for the queue to drain
    pub(crate) blockers: usize,
    sink: Arc<dyn WireSink>,
    drained: Arc<Notify>,
    wake_writer: Arc<Notify>,
    tasks: Vec<JoinHandle<()>>,
}

impl Connection {
    pub fn new(
        id: ConnId,
        eid: Option<Eid>,
        label: String,
        initiated_locally: bool,
        sink: Arc<dyn WireSink>,
    ) -> Self {
        Self {
            id,
            eid,
            label,
            initiated_locally,
            version: ProtocolVersion::CURRENT,
            state: ConnState::Connecting,
            was_ready: false,
            queue: OutboundQueue::new(),
            blockers: 0,
            sink,
            drained: Arc::new(Notify::new()),
            wake_writer: Arc::new(Notify::new()),
            tasks: Vec::new(),
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Usable for replication traffic
    pub fn is_ready(&self) -> bool {
        matches!(self.state, ConnState::Ready | ConnState::Congested)
    }

    pub fn is_defunct(&self) -> bool {
        self.state == ConnState::Defunct
    }

    /// Whether the handshake ever completed on this connection
    pub fn was_ready(&self) -> bool {
        self.was_ready
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn sink(&self) -> Arc<dyn WireSink> {
        Arc::clone(&self.sink)
    }

    pub(crate) fn drained(&self) -> Arc<Notify> {
        Arc::clone(&self.drained)
    }

    pub(crate) fn wake_writer(&self) -> Arc<Notify> {
        Arc::clone(&self.wake_writer)
    }

    pub(crate) fn attach_task(&mut self, handle: JoinHandle<()>) {
        self.tasks.push(handle);
    }

    /// Handshake complete
    pub fn set_ready(&mut self, version: ProtocolVersion) {
        if self.state == ConnState::Connecting {
            self.version = version;
            self.state = ConnState::Ready;
            self.was_ready = true;
        }
    }

    /// Enter the terminal state. Returns false if already defunct.
    pub(crate) fn set_defunct(&mut self) -> bool {
        if self.state == ConnState::Defunct {
            return false;
        }
        self.state = ConnState::Defunct;
        // Blocked senders and the writer must notice.
        self.drained.notify_waiters();
        self.wake_writer.notify_one();
        true
    }

    fn enqueue(&mut self, msg: &mut OutboundMessage, offset: usize, limit: usize) {
        self.queue.push(msg.flatten(), offset);
        if self.queue.len() >= limit && self.state == ConnState::Ready {
            self.state = ConnState::Congested;
        }
    }

    fn dequeued(&mut self, limit: usize) {
        if self.state == ConnState::Congested && self.queue.len() < limit {
            self.state = ConnState::Ready;
        }
        self.drained.notify_waiters();
    }

    /// Non-blocking send attempt.
    ///
    /// With messages already queued the socket belongs to the background
    /// writer, so the message can only be queued (or dropped/refused when
    /// the queue is full). Otherwise it is written inline; whatever the
    /// socket does not take is flattened and handed to the writer.
    pub(crate) fn write_inline(
        &mut self,
        msg: &mut OutboundMessage,
        limit: usize,
        blockable: bool,
    ) -> Inline {
        if self.is_defunct() {
            return Inline::Failed(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection is defunct",
            ));
        }

        if !self.queue.is_empty() {
            if self.queue.len() < limit {
                self.enqueue(msg, 0, limit);
                return Inline::Queued;
            }
            return if blockable { Inline::Full } else { Inline::Dropped };
        }

        let total = msg.len();
        let mut written = 0;
        loop {
            let result = {
                let slices = msg.io_slices(written);
                self.sink.try_write_vectored(&slices)
            };
            match result {
                Ok(0) => return Inline::Failed(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    written += n;
                    if written >= total {
                        return Inline::Sent;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.enqueue(msg, written, limit);
                    self.wake_writer.notify_one();
                    return Inline::Handoff;
                }
                Err(e) => return Inline::Failed(e),
            }
        }
    }

    /// Write as much of the queue as the socket accepts
    pub(crate) fn flush_queue(&mut self, limit: usize) -> Flush {
        loop {
            if self.queue.is_empty() {
                return Flush::Drained;
            }
            let result = {
                let slices = self.queue.io_slices();
                self.sink.try_write_vectored(&slices)
            };
            match result {
                Ok(0) => return Flush::Failed(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    if self.queue.consume(n) > 0 {
                        self.dequeued(limit);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Flush::WouldBlock,
                Err(e) => return Flush::Failed(e),
            }
        }
    }

    /// Release everything the connection owns: the reader task (and with it
    /// any partially received frame), the writer task, queued messages and
    /// the socket. Returns the number of queued messages discarded.
    pub(crate) fn destroy(mut self) -> usize {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        let discarded = self.queue.clear();
        self.drained.notify_waiters();
        discarded
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("eid", &self.eid)
            .field("label", &self.label)
            .field("state", &self.state)
            .field("version", &self.version)
            .field("queue_len", &self.queue.len())
            .field("blockers", &self.blockers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::testing::MemorySink;
    use crate::wire::{MessageType, WireCodec};
    use bytes::{Bytes, BytesMut};
    use tokio_util::codec::Decoder;

    fn conn(sink: Arc<MemorySink>) -> Connection {
        let mut c = Connection::new(ConnId(1), Some(Eid(0)), "test".into(), true, sink);
        c.set_ready(ProtocolVersion::CURRENT);
        c
    }

    fn msg(payload: &'static [u8]) -> OutboundMessage {
        OutboundMessage::encode(MessageType::RepMessage, Bytes::new(), Bytes::from_static(payload))
    }

    fn payloads(bytes: Vec<u8>) -> Vec<Vec<u8>> {
        let mut codec = WireCodec::new(1 << 20);
        let mut buf = BytesMut::from(&bytes[..]);
        let mut out = Vec::new();
        while let Some(frame) = codec.decode(&mut buf).unwrap() {
            out.push(frame.payload.to_vec());
        }
        out
    }

    #[test]
    fn test_state_transitions() {
        let sink = Arc::new(MemorySink::unlimited());
        let mut c = Connection::new(ConnId(1), None, "test".into(), false, sink);
        assert_eq!(c.state(), ConnState::Connecting);
        assert!(!c.is_ready());

        c.set_ready(ProtocolVersion::V1);
        assert_eq!(c.state(), ConnState::Ready);
        assert_eq!(c.version, ProtocolVersion::V1);
        assert!(c.was_ready());

        assert!(c.set_defunct());
        assert!(!c.set_defunct());
        c.set_ready(ProtocolVersion::V2);
        assert_eq!(c.state(), ConnState::Defunct);
    }

    #[test]
    fn test_inline_write_when_socket_accepts() {
        let sink = Arc::new(MemorySink::unlimited());
        let mut c = conn(Arc::clone(&sink));

        assert!(matches!(c.write_inline(&mut msg(b"one"), 4, false), Inline::Sent));
        assert_eq!(c.queue_len(), 0);
        assert_eq!(payloads(sink.written()), vec![b"one".to_vec()]);
    }

    #[test]
    fn test_partial_write_hands_off_remainder() {
        let sink = Arc::new(MemorySink::new(5));
        let mut c = conn(Arc::clone(&sink));

        let mut m = msg(b"partial");
        assert!(matches!(c.write_inline(&mut m, 4, false), Inline::Handoff));
        assert_eq!(c.queue_len(), 1);
        assert_eq!(sink.written().len(), 5);

        // While queued, later sends go behind it.
        assert!(matches!(c.write_inline(&mut msg(b"next"), 4, false), Inline::Queued));

        sink.grow(1024);
        assert!(matches!(c.flush_queue(4), Flush::Drained));
        assert_eq!(payloads(sink.written()), vec![b"partial".to_vec(), b"next".to_vec()]);
    }

    #[test]
    fn test_full_queue_drops_or_refuses() {
        let sink = Arc::new(MemorySink::new(0));
        let mut c = conn(Arc::clone(&sink));

        assert!(matches!(c.write_inline(&mut msg(b"a"), 2, false), Inline::Handoff));
        assert!(matches!(c.write_inline(&mut msg(b"b"), 2, false), Inline::Queued));
        assert_eq!(c.state(), ConnState::Congested);

        assert!(matches!(c.write_inline(&mut msg(b"c"), 2, false), Inline::Dropped));
        assert!(matches!(c.write_inline(&mut msg(b"c"), 2, true), Inline::Full));
        assert_eq!(c.queue_len(), 2);

        sink.grow(1024);
        assert!(matches!(c.flush_queue(2), Flush::Drained));
        assert_eq!(c.state(), ConnState::Ready);
    }

    #[test]
    fn test_write_failure_reported() {
        let sink = Arc::new(MemorySink::unlimited());
        let mut c = conn(Arc::clone(&sink));
        sink.fail();

        assert!(matches!(c.write_inline(&mut msg(b"x"), 4, false), Inline::Failed(_)));
    }

    #[test]
    fn test_destroy_releases_queued_buffers() {
        let sink = Arc::new(MemorySink::new(0));
        let mut c = conn(sink);

        let mut m = msg(b"held");
        assert!(matches!(c.write_inline(&mut m, 4, false), Inline::Handoff));
        let weak = m.flat_weak().unwrap();
        drop(m);
        assert!(weak.upgrade().is_some());

        assert_eq!(c.destroy(), 1);
        assert!(weak.upgrade().is_none());
    }
}
