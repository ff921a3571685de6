//! Durability Acknowledgment
//!
//! Decides whether a log record is permanent under the configured ack policy,
//! and how many sites a message must at least have been sent to before it is
//! worth waiting for acks at all.

use serde::{Deserialize, Serialize};

use crate::site::SiteRegistry;
use crate::wire::Lsn;

/// Acknowledgment policy for permanent messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    /// Never wait for acks
    None,
    /// Any one site
    One,
    /// Any one voting peer
    OnePeer,
    /// Every remote site
    All,
    /// Every remote voting peer
    AllPeers,
    /// A majority of voting peers
    Quorum,
}

impl Default for AckPolicy {
    fn default() -> Self {
        AckPolicy::Quorum
    }
}

impl std::fmt::Display for AckPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AckPolicy::None => write!(f, "none"),
            AckPolicy::One => write!(f, "one"),
            AckPolicy::OnePeer => write!(f, "one_peer"),
            AckPolicy::All => write!(f, "all"),
            AckPolicy::AllPeers => write!(f, "all_peers"),
            AckPolicy::Quorum => write!(f, "quorum"),
        }
    }
}

/// Active permanence policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermPolicy {
    pub ack_policy: AckPolicy,
    /// Require a true majority even in a two-site group
    pub two_site_strict: bool,
}

impl PermPolicy {
    pub fn new(ack_policy: AckPolicy, two_site_strict: bool) -> Self {
        Self {
            ack_policy,
            two_site_strict,
        }
    }

    /// Voting peers that must ack under `Quorum` for a group of `site_count`
    /// sites (local site included).
    ///
    /// In a two-site group a client that loses its master may promote itself
    /// without a majority, so unless strict mode is on the other site must
    /// hold the record.
    pub fn quorum_peers(&self, site_count: usize) -> usize {
        if site_count == 2 && !self.two_site_strict {
            1
        } else {
            site_count.saturating_sub(1) / 2
        }
    }

    /// Whether `lsn` is durable given the acks recorded in `sites`
    pub fn is_permanent(&self, sites: &SiteRegistry, lsn: Lsn) -> bool {
        if self.ack_policy == AckPolicy::None {
            return true;
        }

        let mut nsites = 0usize;
        let mut npeers = 0usize;
        let mut missing_peer = false;

        for site in sites.iter() {
            if !site.priority_known {
                // Never connected: it might be a peer, and it cannot have acked.
                missing_peer = true;
                continue;
            }
            if site.max_ack >= lsn {
                nsites += 1;
                if site.priority > 0 {
                    npeers += 1;
                }
            } else if site.priority > 0 {
                missing_peer = true;
            }
        }

        let site_count = sites.configured_site_count();
        match self.ack_policy {
            AckPolicy::None => true,
            AckPolicy::One => nsites >= 1,
            AckPolicy::OnePeer => npeers >= 1,
            AckPolicy::All => nsites >= site_count - 1,
            AckPolicy::AllPeers => !missing_peer,
            AckPolicy::Quorum => npeers >= self.quorum_peers(site_count),
        }
    }

    /// Minimum send counts that could ever satisfy the policy.
    ///
    /// `None` means no fast-fail check applies: either nothing is needed, or
    /// (for `AllPeers`) the number of peers still to be heard from cannot be
    /// known from send counts alone.
    pub fn required_ack_count(&self, site_count: usize) -> Option<RequiredAcks> {
        match self.ack_policy {
            AckPolicy::None | AckPolicy::AllPeers => None,
            AckPolicy::One => Some(RequiredAcks::sites(1)),
            AckPolicy::All => Some(RequiredAcks::sites(site_count.saturating_sub(1))),
            AckPolicy::OnePeer => Some(RequiredAcks::peers(1)),
            AckPolicy::Quorum => Some(RequiredAcks::peers(self.quorum_peers(site_count))),
        }
    }

    /// Whether a message sent to `attempted` could still become permanent
    pub fn can_satisfy(&self, site_count: usize, attempted: SendCounts) -> bool {
        self.required_ack_count(site_count)
            .map_or(true, |req| req.satisfied_by(attempted))
    }
}

/// Which send count a requirement is measured against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckCount {
    Sites,
    Peers,
}

/// Number of sites or peers a permanent message must reach
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequiredAcks {
    pub needed: usize,
    pub counted: AckCount,
}

impl RequiredAcks {
    fn sites(needed: usize) -> Self {
        Self {
            needed,
            counted: AckCount::Sites,
        }
    }

    fn peers(needed: usize) -> Self {
        Self {
            needed,
            counted: AckCount::Peers,
        }
    }

    pub fn satisfied_by(&self, attempted: SendCounts) -> bool {
        let have = match self.counted {
            AckCount::Sites => attempted.sites,
            AckCount::Peers => attempted.peers,
        };
        have >= self.needed
    }
}

/// Sites and voting peers a message was sent or queued to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendCounts {
    pub sites: usize,
    pub peers: usize,
}
