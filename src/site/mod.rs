//! Site Module
//!
//! Remote sites known to this process and the addresses used to reach them.

mod registry;

pub use registry::{Site, SiteRegistry, SiteState};

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Logical identifier of a remote site
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Eid(pub u32);

impl std::fmt::Display for Eid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resolve a host/port pair to its socket addresses
pub async fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| Error::Resolution(format!("{}:{}: {}", host, port, e)))?
        .collect();

    if addrs.is_empty() {
        return Err(Error::Resolution(format!("{}:{}: no addresses", host, port)));
    }
    Ok(addrs)
}

/// Split a `host:port` string
pub fn parse_address(address: &str) -> Result<(String, u16)> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| Error::Config(format!("address '{}' is missing a port", address)))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(Error::Config(format!("address '{}' is missing a host", address)));
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| Error::Config(format!("address '{}' has an invalid port", address)))?;
    Ok((host.to_string(), port))
}
