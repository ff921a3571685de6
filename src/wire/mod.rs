//! Wire Module
//!
//! Framed message format shared by every replication connection:
//!
//! ```text
//! [1 byte type][4 bytes BE control_len][4 bytes BE payload_len][control][payload]
//! ```
//!
//! Both length fields are always present, even when zero.

mod codec;
mod message;

pub use codec::{FlatMessage, OutboundMessage, WireCodec, WireFrame, HEADER_SIZE};
pub use message::{AckBody, Handshake, MessageType, ProtocolVersion};

/// Log sequence number identifying a position in the replicated log
pub type Lsn = u64;
