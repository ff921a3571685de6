//! Message types, protocol versions and fixed control bodies

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::Lsn;
use crate::error::{Error, Result};

/// Message type tags carried in the first byte of every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Acknowledgment of a permanent log record
    Ack = 1,
    /// Connection handshake carrying version, priority and listen address
    Handshake = 2,
    /// Opaque replication message from the storage engine
    RepMessage = 3,
    /// Keepalive broadcast
    Heartbeat = 4,
}

impl MessageType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Ack),
            2 => Some(Self::Handshake),
            3 => Some(Self::RepMessage),
            4 => Some(Self::Heartbeat),
            _ => None,
        }
    }

    /// Get the message type name (for logging)
    pub fn name(&self) -> &'static str {
        match self {
            MessageType::Ack => "Ack",
            MessageType::Handshake => "Handshake",
            MessageType::RepMessage => "RepMessage",
            MessageType::Heartbeat => "Heartbeat",
        }
    }
}

/// Wire protocol versions
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolVersion {
    V1 = 1,
    V2 = 2,
}

impl ProtocolVersion {
    /// Version this build speaks
    pub const CURRENT: ProtocolVersion = ProtocolVersion::V2;

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Pick the version to use with a peer advertising `remote`.
    ///
    /// Peers newer than us are spoken to at our version; zero is invalid.
    pub fn negotiate(remote: u32) -> Option<ProtocolVersion> {
        match remote {
            0 => None,
            1 => Some(ProtocolVersion::V1),
            _ => Some(Self::CURRENT),
        }
    }

    /// Whether a peer at this version understands `msg_type`
    pub fn supports(self, msg_type: MessageType) -> bool {
        match (self, msg_type) {
            (_, MessageType::Ack | MessageType::Handshake | MessageType::RepMessage) => true,
            (ProtocolVersion::V1, MessageType::Heartbeat) => false,
            (ProtocolVersion::V2, MessageType::Heartbeat) => true,
        }
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.as_u32())
    }
}

/// Handshake control body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Highest protocol version the sender speaks
    pub version: u32,
    /// Sender's election priority (0 = client-only)
    pub priority: u32,
    /// Sender's listen port
    pub port: u16,
    /// Sender's advertised host name
    pub host: String,
}

impl Handshake {
    const FIXED_SIZE: usize = 4 + 4 + 2;

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::FIXED_SIZE + self.host.len());
        buf.put_u32(self.version);
        buf.put_u32(self.priority);
        buf.put_u16(self.port);
        buf.put_slice(self.host.as_bytes());
        buf.freeze()
    }

    pub fn from_bytes(mut bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::FIXED_SIZE {
            return Err(Error::Protocol(format!(
                "handshake body too short: {} bytes",
                bytes.len()
            )));
        }
        let version = bytes.get_u32();
        let priority = bytes.get_u32();
        let port = bytes.get_u16();
        let host = std::str::from_utf8(bytes)
            .map_err(|_| Error::Protocol("handshake host is not valid UTF-8".into()))?
            .to_string();

        if host.is_empty() {
            return Err(Error::Protocol("handshake host is empty".into()));
        }

        Ok(Self {
            version,
            priority,
            port,
            host,
        })
    }
}

/// Ack control body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckBody {
    pub lsn: Lsn,
}

impl AckBody {
    const SIZE: usize = 8;

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u64(self.lsn);
        buf.freeze()
    }

    pub fn from_bytes(mut bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::SIZE {
            return Err(Error::Protocol(format!(
                "ack body must be {} bytes, got {}",
                Self::SIZE,
                bytes.len()
            )));
        }
        Ok(Self {
            lsn: bytes.get_u64(),
        })
    }
}
