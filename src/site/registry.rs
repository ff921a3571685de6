//! Site Registry
//!
//! Maps site identifiers to addresses, priority, acknowledgment progress and
//! the current connection. The registry holds no lock of its own; it lives
//! inside the transport's shared state and is only touched under that lock.

use std::net::SocketAddr;

use super::Eid;
use crate::error::{Error, Result};
use crate::net::ConnId;
use crate::wire::Lsn;

/// Connection state of a site
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteState {
    /// No connection and none in progress
    Idle,
    /// Outbound connect or handshake in progress
    Connecting,
    /// Handshake completed on the current connection
    Connected,
}

impl std::fmt::Display for SiteState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SiteState::Idle => write!(f, "IDLE"),
            SiteState::Connecting => write!(f, "CONNECTING"),
            SiteState::Connected => write!(f, "CONNECTED"),
        }
    }
}

/// A remote site
#[derive(Debug, Clone)]
pub struct Site {
    /// Site identifier
    pub eid: Eid,
    /// Advertised host
    pub host: String,
    /// Advertised port
    pub port: u16,
    /// Resolved addresses (empty while resolution is pending)
    addrs: Vec<SocketAddr>,
    /// Index of the address to try next
    cursor: usize,
    /// Connection state
    pub state: SiteState,
    /// Current connection, replaced on every reconnect
    pub conn: Option<ConnId>,
    /// Election priority; 0 means client-only
    pub priority: u32,
    /// Whether priority has been learned from a handshake
    pub priority_known: bool,
    /// Highest LSN this site has acknowledged
    pub max_ack: Lsn,
}

impl Site {
    fn new(eid: Eid, host: String, port: u16) -> Self {
        Self {
            eid,
            host,
            port,
            addrs: Vec::new(),
            cursor: 0,
            state: SiteState::Idle,
            conn: None,
            priority: 0,
            priority_known: false,
            max_ack: 0,
        }
    }

    /// `host:port` form of the site address
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Voting peer: priority observed and non-zero
    pub fn is_peer(&self) -> bool {
        self.priority_known && self.priority > 0
    }

    /// Whether address resolution still has to succeed
    pub fn needs_resolution(&self) -> bool {
        self.addrs.is_empty()
    }

    /// Install a freshly resolved address list
    pub fn set_addresses(&mut self, addrs: Vec<SocketAddr>) {
        self.addrs = addrs;
        self.cursor = 0;
    }

    /// Addresses in connect order, starting at the cursor
    pub fn connect_order(&self) -> Vec<SocketAddr> {
        let n = self.addrs.len();
        (0..n).map(|i| self.addrs[(self.cursor + i) % n]).collect()
    }

    /// Remember which address worked so the next attempt starts there
    pub fn set_current(&mut self, addr: SocketAddr) {
        if let Some(i) = self.addrs.iter().position(|a| *a == addr) {
            self.cursor = i;
        }
    }

    /// Record learned priority
    pub fn set_priority(&mut self, priority: u32) {
        self.priority = priority;
        self.priority_known = true;
    }

    /// Raise the acknowledged LSN; acks never move it backwards
    pub fn record_ack(&mut self, lsn: Lsn) -> bool {
        if lsn > self.max_ack {
            self.max_ack = lsn;
            true
        } else {
            false
        }
    }
}

/// Registry of remote sites. The local site is not stored here.
#[derive(Debug, Default)]
pub struct SiteRegistry {
    sites: Vec<Site>,
}

impl SiteRegistry {
    pub fn new() -> Self {
        Self { sites: Vec::new() }
    }

    /// Add a site with resolution pending
    pub fn add_site(&mut self, host: &str, port: u16) -> Result<Eid> {
        if self.lookup(host, port).is_some() {
            return Err(Error::SiteExists(format!("{}:{}", host, port)));
        }
        let eid = Eid(self.sites.len() as u32);
        self.sites.push(Site::new(eid, host.to_string(), port));
        Ok(eid)
    }

    /// Find a site by its advertised address
    pub fn find_site(&self, host: &str, port: u16) -> Result<Eid> {
        self.lookup(host, port)
            .ok_or_else(|| Error::SiteNotFound(format!("{}:{}", host, port)))
    }

    fn lookup(&self, host: &str, port: u16) -> Option<Eid> {
        self.sites
            .iter()
            .find(|s| s.port == port && s.host.eq_ignore_ascii_case(host))
            .map(|s| s.eid)
    }

    /// The site, if its connection has completed the handshake
    pub fn available_site(&self, eid: Eid) -> Option<&Site> {
        self.get(eid).filter(|s| s.state == SiteState::Connected)
    }

    pub fn get(&self, eid: Eid) -> Option<&Site> {
        self.sites.get(eid.0 as usize)
    }

    pub fn get_mut(&mut self, eid: Eid) -> Option<&mut Site> {
        self.sites.get_mut(eid.0 as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Site> {
        self.sites.iter()
    }

    /// Number of remote sites
    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    /// Group size including the local site
    pub fn configured_site_count(&self) -> usize {
        self.sites.len() + 1
    }
}
