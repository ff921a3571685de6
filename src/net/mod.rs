//! Network Module
//!
//! Connections to remote sites, their outbound queues, the send path and the
//! background reader/writer tasks.
//!
//! Socket write ownership moves between two parties: while a connection's
//! queue is empty any sender may write to the socket inline; once something
//! is queued only the connection's writer task writes, until the queue
//! drains again.

mod connection;
mod connector;
mod io;
mod queue;
mod send;

pub use connection::{ConnState, Connection};
pub use queue::OutboundQueue;

pub use send::Delivery;

pub(crate) use connection::{Flush, Inline};

use std::io::IoSlice;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::tcp::OwnedWriteHalf;

/// Identifier of a connection object. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnId(pub u64);

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Write side of a connection
#[async_trait]
pub trait WireSink: Send + Sync {
    /// Non-blocking vectored write; `WouldBlock` when the socket is full
    fn try_write_vectored(&self, bufs: &[IoSlice<'_>]) -> std::io::Result<usize>;

    /// Wait until the socket may accept more bytes
    async fn writable(&self) -> std::io::Result<()>;
}

#[async_trait]
impl WireSink for OwnedWriteHalf {
    fn try_write_vectored(&self, bufs: &[IoSlice<'_>]) -> std::io::Result<usize> {
        OwnedWriteHalf::try_write_vectored(self, bufs)
    }

    async fn writable(&self) -> std::io::Result<()> {
        OwnedWriteHalf::writable(self).await
    }
}
