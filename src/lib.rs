//! WolfRepl - Replication Transport and Durability Engine
//!
//! The network side of a replicated database: it turns local writes into
//! framed messages, fans them out to the other sites of the replication
//! group, tracks each site's acknowledged LSN and decides whether a
//! transaction is permanent under the configured acknowledgment policy.
//!
//! # Architecture
//!
//! All shared state (sites, connections, counters) lives behind one lock in
//! the transport. Senders write to a socket inline while its queue is empty;
//! once anything is queued a per-connection writer task owns the socket until
//! the queue drains. Broken connections are marked defunct and torn down by a
//! single reaper loop, never while a sender is still blocked on them.
//!
//! # Features
//!
//! - Length-prefixed wire protocol with protocol version negotiation
//! - Bounded outbound queues with timeout-based backpressure
//! - Zero-copy broadcast fan-out over a shared flattened buffer
//! - NONE / ONE / ONE_PEER / ALL / ALL_PEERS / QUORUM acknowledgment policies
//! - Automatic reconnect and election triggering on master loss

pub mod config;
pub mod error;
pub mod net;
pub mod perm;
pub mod site;
pub mod transport;
pub mod wire;

pub use config::RepConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::RepConfig;
    pub use crate::error::{Error, Result};
    pub use crate::net::{ConnState, Delivery};
    pub use crate::perm::{AckPolicy, PermPolicy, SendCounts};
    pub use crate::site::{Eid, Site};
    pub use crate::transport::{ElectionHook, Incoming, NetStats, RepTransport, SendFlags, Target};
    pub use crate::wire::{Lsn, MessageType};
}
