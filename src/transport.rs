//! Replication Transport
//!
//! Owns the site registry and every connection behind one coarse lock, runs
//! the background loops (accept, reaper, heartbeat) and exposes the send and
//! durability entry points used by the storage engine.
//!
//! Connection teardown has exactly one path: `mark_defunct` flags the
//! connection and hands its id to the reaper loop, which calls `cleanup`.
//! Cleanup is deferred while any sender is blocked on the connection; the
//! last blocked sender to leave hands the id back to the reaper.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::RepConfig;
use crate::error::{Error, Result};
use crate::net::{ConnId, ConnState, Connection, Delivery};
use crate::perm::{PermPolicy, RequiredAcks, SendCounts};
use crate::site::{parse_address, Eid, Site, SiteRegistry, SiteState};
use crate::wire::{AckBody, Lsn, MessageType, OutboundMessage};

/// A replication message received from a remote site
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incoming {
    pub eid: Eid,
    pub control: Bytes,
    pub payload: Bytes,
}

/// Election subsystem hook
pub trait ElectionHook: Send + Sync {
    /// The connection to the master site was lost after it had been
    /// established. Must not block.
    fn master_lost(&self, master: Eid);
}

/// Destination of a replication message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Site(Eid),
    Broadcast,
}

/// Flags supplied with a replication message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendFlags {
    /// Caller wants a durability decision
    pub permanent: bool,
    /// Any up-to-date site may serve the request
    pub anywhere: bool,
    /// Re-request of missing records; never forwarded opportunistically
    pub rerequest: bool,
}

/// Transport counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetStats {
    /// Messages left on an outbound queue for the background writer
    pub messages_queued: u64,
    /// Messages dropped on a full queue
    pub messages_dropped: u64,
    /// Connections marked defunct
    pub connections_dropped: u64,
    /// Connection objects torn down
    pub connections_destroyed: u64,
    /// Permanent messages that could not be confirmed
    pub perm_failed: u64,
    /// Failed outbound connect attempts
    pub connect_failures: u64,
}

/// The local site as advertised in handshakes
#[derive(Debug, Clone)]
pub(crate) struct LocalSite {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) priority: u32,
}

impl LocalSite {
    pub(crate) fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Everything guarded by the transport lock
pub(crate) struct State {
    pub(crate) local: LocalSite,
    pub(crate) sites: SiteRegistry,
    pub(crate) conns: HashMap<ConnId, Connection>,
    next_conn: u64,
    pub(crate) master: Option<Eid>,
    pub(crate) c2c_peer: Option<Eid>,
    pub(crate) started: bool,
    pub(crate) stats: NetStats,
}

impl State {
    pub(crate) fn next_conn_id(&mut self) -> ConnId {
        self.next_conn += 1;
        ConnId(self.next_conn)
    }

    /// Ready connection serving a site
    pub(crate) fn site_conn(&self, eid: Eid) -> Option<ConnId> {
        self.sites.available_site(eid).and_then(|s| s.conn)
    }
}

/// Outcome of a cleanup attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Cleanup {
    /// Connection is gone; carries the site that lost its connection, if any
    Done(Option<LostSite>),
    /// Senders are still blocked on the connection
    Deferred,
}

/// A site whose connection was torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LostSite {
    pub(crate) eid: Eid,
    pub(crate) was_master: bool,
}

pub(crate) struct Shared {
    pub(crate) state: Mutex<State>,
    pub(crate) config: RepConfig,
    pub(crate) perm: PermPolicy,
    pub(crate) shutdown: CancellationToken,
    /// Signalled whenever a site's acknowledged LSN advances
    pub(crate) acks: Notify,
    pub(crate) incoming_tx: mpsc::Sender<Incoming>,
    defunct_tx: mpsc::UnboundedSender<ConnId>,
    election: Option<Arc<dyn ElectionHook>>,
}

impl Shared {
    /// Declare a connection broken. Nothing is released here; the reaper
    /// loop tears the connection down.
    pub(crate) fn mark_defunct(&self, state: &mut State, id: ConnId, reason: &str) {
        let Some(conn) = state.conns.get_mut(&id) else {
            return;
        };
        if !conn.set_defunct() {
            return;
        }

        tracing::warn!("Connection {} ({}) defunct: {}", id, conn.label, reason);
        state.stats.connections_dropped += 1;

        if let Some(site) = conn.eid.and_then(|eid| state.sites.get_mut(eid)) {
            if site.conn == Some(id) {
                site.state = SiteState::Idle;
            }
        }

        self.requeue_cleanup(id);
    }

    /// Hand a defunct connection to the reaper
    pub(crate) fn requeue_cleanup(&self, id: ConnId) {
        if self.defunct_tx.send(id).is_err() {
            tracing::debug!("Reaper gone, {} left for shutdown", id);
        }
    }

    /// Tear down a defunct connection unless a sender is blocked on it.
    /// Safe to call repeatedly for the same id.
    pub(crate) fn cleanup(&self, state: &mut State, id: ConnId) -> Cleanup {
        match state.conns.get(&id) {
            None => return Cleanup::Done(None),
            Some(conn) => {
                debug_assert!(conn.is_defunct(), "cleanup of live connection {}", id);
                if conn.blockers > 0 {
                    conn.drained().notify_waiters();
                    tracing::debug!("Cleanup of {} deferred, {} sender(s) blocked", id, conn.blockers);
                    return Cleanup::Deferred;
                }
            }
        }

        let Some(conn) = state.conns.remove(&id) else {
            return Cleanup::Done(None);
        };

        let mut lost = None;
        if let Some(eid) = conn.eid {
            if let Some(site) = state.sites.get_mut(eid) {
                if site.conn == Some(id) {
                    site.conn = None;
                    site.state = SiteState::Idle;
                    lost = Some(LostSite {
                        eid,
                        was_master: conn.was_ready() && state.master == Some(eid),
                    });
                }
            }
        }

        let label = conn.label.clone();
        let discarded = conn.destroy();
        state.stats.connections_destroyed += 1;
        tracing::debug!(
            "Connection {} ({}) destroyed, {} queued message(s) discarded",
            id,
            label,
            discarded
        );

        Cleanup::Done(lost)
    }

    /// React to a site losing its connection
    pub(crate) fn connection_lost(self: &Arc<Self>, lost: LostSite) {
        if lost.was_master {
            if let Some(hook) = &self.election {
                tracing::info!("Lost connection to master site {}, calling election", lost.eid);
                hook.master_lost(lost.eid);
            }
        }
        self.schedule_reconnect(lost.eid);
    }

    /// Try the site again after the retry delay
    pub(crate) fn schedule_reconnect(self: &Arc<Self>, eid: Eid) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let shared = Arc::clone(self);
        let delay = self.config.connection_retry();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => shared.open(eid).await,
                _ = shared.shutdown.cancelled() => {}
            }
        });
    }

    /// Raise a site's acknowledged LSN and wake durability waiters
    pub(crate) fn record_ack(&self, state: &mut State, eid: Eid, lsn: Lsn) {
        if let Some(site) = state.sites.get_mut(eid) {
            if site.record_ack(lsn) {
                tracing::trace!("Site {} acknowledged LSN {}", eid, lsn);
                self.acks.notify_waiters();
            }
        }
    }

    /// Wait until `lsn` is permanent, the ack timeout passes, or shutdown
    pub(crate) async fn await_permanent(&self, lsn: Lsn) -> Result<()> {
        let deadline = Instant::now() + self.config.ack_timeout();
        loop {
            let acked = self.acks.notified();
            {
                let state = self.state.lock().await;
                if self.perm.is_permanent(&state.sites, lsn) {
                    return Ok(());
                }
            }

            tokio::select! {
                _ = acked => continue,
                _ = tokio::time::sleep_until(deadline) => {
                    self.state.lock().await.stats.perm_failed += 1;
                    tracing::warn!(
                        "LSN {} not acknowledged under {} policy within {:?}",
                        lsn,
                        self.perm.ack_policy,
                        self.config.ack_timeout()
                    );
                    return Err(Error::PermTimeout { lsn });
                }
                _ = self.shutdown.cancelled() => return Err(Error::ShuttingDown),
            }
        }
    }

    /// Pick the connection for a direct send, and whether it leads to a peer
    fn route(&self, state: &State, eid: Eid, flags: SendFlags) -> Result<(ConnId, bool)> {
        if flags.anywhere && !flags.rerequest {
            if let Some(peer) = state.c2c_peer.and_then(|p| state.sites.available_site(p)) {
                if let Some(conn) = peer.conn {
                    tracing::trace!("Forwarding request for site {} to peer {}", eid, peer.eid);
                    return Ok((conn, peer.is_peer()));
                }
            }
        }

        let site = state
            .sites
            .available_site(eid)
            .ok_or_else(|| Error::unavailable(eid))?;
        let conn = site.conn.ok_or_else(|| Error::unavailable(eid))?;
        Ok((conn, site.is_peer()))
    }

    /// Resolve a site's address; failure leaves it pending
    pub(crate) async fn resolve_site(&self, eid: Eid) {
        let (host, port) = {
            let state = self.state.lock().await;
            match state.sites.get(eid) {
                Some(site) => (site.host.clone(), site.port),
                None => return,
            }
        };

        match crate::site::resolve(&host, port).await {
            Ok(addrs) => {
                let mut state = self.state.lock().await;
                if let Some(site) = state.sites.get_mut(eid) {
                    site.set_addresses(addrs);
                }
            }
            Err(e) => {
                tracing::warn!("Site {} ({}:{}) left pending: {}", eid, host, port, e);
            }
        }
    }

    async fn run_reaper(self: Arc<Self>, mut defunct_rx: mpsc::UnboundedReceiver<ConnId>) {
        tracing::debug!("Connection reaper started");
        loop {
            let id = tokio::select! {
                id = defunct_rx.recv() => match id {
                    Some(id) => id,
                    None => break,
                },
                _ = self.shutdown.cancelled() => break,
            };

            let outcome = {
                let mut state = self.state.lock().await;
                self.cleanup(&mut state, id)
            };
            if let Cleanup::Done(Some(lost)) = outcome {
                self.connection_lost(lost);
            }
        }
        tracing::debug!("Connection reaper stopped");
    }

    async fn run_heartbeat(self: Arc<Self>, interval: std::time::Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.shutdown.cancelled() => break,
            }

            let mut msg = OutboundMessage::encode(MessageType::Heartbeat, Bytes::new(), Bytes::new());
            let mut state = self.state.lock().await;
            let counts = self.send_broadcast(&mut state, &mut msg);
            tracing::trace!("Heartbeat sent to {} site(s)", counts.sites);
        }
    }
}

/// Replication transport handle
#[derive(Clone)]
pub struct RepTransport {
    shared: Arc<Shared>,
    defunct_rx: Arc<std::sync::Mutex<Option<mpsc::UnboundedReceiver<ConnId>>>>,
}

impl RepTransport {
    /// Create a transport. Replication messages from remote sites are
    /// delivered on `incoming_tx`.
    pub fn new(
        config: RepConfig,
        incoming_tx: mpsc::Sender<Incoming>,
        election: Option<Arc<dyn ElectionHook>>,
    ) -> Result<Self> {
        config.validate()?;

        let (defunct_tx, defunct_rx) = mpsc::unbounded_channel();
        let state = State {
            local: LocalSite {
                host: config.node.host.clone(),
                port: config.node.port,
                priority: config.node.priority,
            },
            sites: SiteRegistry::new(),
            conns: HashMap::new(),
            next_conn: 0,
            master: None,
            c2c_peer: None,
            started: false,
            stats: NetStats::default(),
        };

        let shared = Arc::new(Shared {
            state: Mutex::new(state),
            perm: config.perm_policy(),
            config,
            shutdown: CancellationToken::new(),
            acks: Notify::new(),
            incoming_tx,
            defunct_tx,
            election,
        });

        Ok(Self {
            shared,
            defunct_rx: Arc::new(std::sync::Mutex::new(Some(defunct_rx))),
        })
    }

    /// Bind the listener, start background loops and connect to the
    /// configured sites. Returns the bound listen address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let defunct_rx = self
            .defunct_rx
            .lock()
            .ok()
            .and_then(|mut rx| rx.take())
            .ok_or_else(|| Error::Config("transport already started".into()))?;

        let listener = TcpListener::bind(self.shared.config.listen_address()).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!("Replication listener on {}", local_addr);

        {
            let mut state = self.shared.state.lock().await;
            if state.local.port == 0 {
                state.local.port = local_addr.port();
            }
            state.started = true;
        }

        tokio::spawn(Arc::clone(&self.shared).run_reaper(defunct_rx));
        tokio::spawn(Arc::clone(&self.shared).accept_loop(listener));
        if let Some(interval) = self.shared.config.heartbeat_interval() {
            tokio::spawn(Arc::clone(&self.shared).run_heartbeat(interval));
        }

        for remote in self.shared.config.sites.remotes.clone() {
            let (host, port) = parse_address(&remote)?;
            match self.add_site(&host, port).await {
                Ok(_) | Err(Error::SiteExists(_)) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(local_addr)
    }

    /// Stop background loops and release blocked senders
    pub async fn shutdown(&self) {
        tracing::info!("Replication transport shutting down");
        self.shared.shutdown.cancel();

        let mut state = self.shared.state.lock().await;
        let ids: Vec<ConnId> = state.conns.keys().copied().collect();
        for id in ids {
            self.shared.mark_defunct(&mut state, id, "shutdown");
            // Blocked senders finish the teardown themselves.
            let _ = self.shared.cleanup(&mut state, id);
        }
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Add a remote site. Resolution failure leaves the site pending
    /// rather than failing the add.
    pub async fn add_site(&self, host: &str, port: u16) -> Result<Eid> {
        let (eid, started) = {
            let mut state = self.shared.state.lock().await;
            let local = state.local.clone();
            if local.port == port && local.host.eq_ignore_ascii_case(host) {
                return Err(Error::Config(format!("{}:{} is the local site", host, port)));
            }
            (state.sites.add_site(host, port)?, state.started)
        };
        tracing::info!("Added site {} at {}:{}", eid, host, port);

        self.shared.resolve_site(eid).await;
        if started {
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move { shared.open(eid).await });
        }
        Ok(eid)
    }

    /// Look up a site by address
    pub async fn find_site(&self, host: &str, port: u16) -> Result<Eid> {
        self.shared.state.lock().await.sites.find_site(host, port)
    }

    /// The site, if it currently has a ready connection
    pub async fn available_site(&self, eid: Eid) -> Option<Site> {
        self.shared.state.lock().await.sites.available_site(eid).cloned()
    }

    /// Snapshot of every known site
    pub async fn sites(&self) -> Vec<Site> {
        self.shared.state.lock().await.sites.iter().cloned().collect()
    }

    /// State of a site's current connection
    pub async fn connection_state(&self, eid: Eid) -> Option<ConnState> {
        let state = self.shared.state.lock().await;
        let id = state.sites.get(eid)?.conn?;
        state.conns.get(&id).map(|c| c.state())
    }

    /// Record which site is the master, for election triggering
    pub async fn set_master(&self, master: Option<Eid>) {
        self.shared.state.lock().await.master = master;
    }

    /// Designate the site that `anywhere` requests are forwarded to
    pub async fn set_peer(&self, peer: Option<Eid>) {
        self.shared.state.lock().await.c2c_peer = peer;
    }

    /// Send a replication message on behalf of the storage engine.
    ///
    /// With `flags.permanent` the call returns only once `lsn` is permanent
    /// under the configured policy, fails fast with `Unavailable` if the
    /// message did not reach enough sites to ever get there, or fails with
    /// `PermTimeout`.
    pub async fn send(
        &self,
        target: Target,
        control: Bytes,
        payload: Bytes,
        lsn: Lsn,
        flags: SendFlags,
    ) -> Result<()> {
        let shared = &self.shared;
        let mut msg = OutboundMessage::encode(MessageType::RepMessage, control, payload);

        let attempted = match target {
            Target::Broadcast => {
                let mut state = shared.state.lock().await;
                shared.send_broadcast(&mut state, &mut msg)
            }
            Target::Site(eid) => {
                let (id, is_peer) = {
                    let state = shared.state.lock().await;
                    shared.route(&state, eid, flags)?
                };
                shared.send_one(id, &mut msg, flags.permanent).await?;
                SendCounts {
                    sites: 1,
                    peers: usize::from(is_peer),
                }
            }
        };

        if !flags.permanent {
            return Ok(());
        }

        {
            let mut state = shared.state.lock().await;
            let site_count = state.sites.configured_site_count();
            if !shared.perm.can_satisfy(site_count, attempted) {
                state.stats.perm_failed += 1;
                tracing::debug!(
                    "LSN {} sent to {} site(s) / {} peer(s), cannot satisfy {} policy",
                    lsn,
                    attempted.sites,
                    attempted.peers,
                    shared.perm.ack_policy
                );
                return Err(Error::Unavailable(format!(
                    "LSN {} cannot satisfy {} policy",
                    lsn, shared.perm.ack_policy
                )));
            }
        }

        shared.await_permanent(lsn).await
    }

    /// Send one message to a site's current connection
    pub async fn send_one(
        &self,
        eid: Eid,
        msg_type: MessageType,
        control: Bytes,
        payload: Bytes,
        blockable: bool,
    ) -> Result<Delivery> {
        let id = self
            .shared
            .state
            .lock()
            .await
            .site_conn(eid)
            .ok_or_else(|| Error::unavailable(eid))?;
        let mut msg = OutboundMessage::encode(msg_type, control, payload);
        self.shared.send_one(id, &mut msg, blockable).await
    }

    /// Send a message to every ready site that understands it. Never blocks.
    pub async fn send_broadcast(
        &self,
        msg_type: MessageType,
        control: Bytes,
        payload: Bytes,
    ) -> SendCounts {
        let mut msg = OutboundMessage::encode(msg_type, control, payload);
        let mut state = self.shared.state.lock().await;
        self.shared.send_broadcast(&mut state, &mut msg)
    }

    /// Acknowledge a permanent record to a site
    pub async fn send_ack(&self, eid: Eid, lsn: Lsn) -> Result<()> {
        self.send_one(eid, MessageType::Ack, AckBody { lsn }.to_bytes(), Bytes::new(), false)
            .await
            .map(|_| ())
    }

    /// Record an acknowledgment from a site
    pub async fn record_ack(&self, eid: Eid, lsn: Lsn) {
        let mut state = self.shared.state.lock().await;
        self.shared.record_ack(&mut state, eid, lsn);
    }

    /// Whether `lsn` is permanent under the configured policy
    pub async fn is_permanent(&self, lsn: Lsn) -> bool {
        let state = self.shared.state.lock().await;
        self.shared.perm.is_permanent(&state.sites, lsn)
    }

    /// Send counts a permanent message needs under the configured policy
    pub async fn required_ack_count(&self) -> Option<RequiredAcks> {
        let state = self.shared.state.lock().await;
        self.shared
            .perm
            .required_ack_count(state.sites.configured_site_count())
    }

    /// Transport counters
    pub async fn stats(&self) -> NetStats {
        self.shared.state.lock().await.stats.clone()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::net::testing::MemorySink;
    use crate::perm::AckPolicy;
    use crate::wire::Handshake;

    pub(crate) fn transport(config: RepConfig) -> (RepTransport, mpsc::Receiver<Incoming>) {
        let (tx, rx) = mpsc::channel(64);
        (RepTransport::new(config, tx, None).unwrap(), rx)
    }

    pub(crate) fn test_config() -> RepConfig {
        let mut config = RepConfig::new("127.0.0.1", 7000);
        config.replication.ack_timeout_ms = 20;
        config.replication.queue_limit = 3;
        config.replication.connection_retry_ms = 60_000;
        config
    }

    /// Register a site with a ready in-memory connection
    pub(crate) async fn ready_site(
        t: &RepTransport,
        host: &str,
        priority: u32,
        sink: Arc<MemorySink>,
    ) -> (Eid, ConnId) {
        let shared = &t.shared;
        let mut state = shared.state.lock().await;
        let eid = state.sites.add_site(host, 6000).unwrap();
        let id = shared.attach(&mut state, Some(eid), host.to_string(), true, sink);
        shared
            .on_handshake(
                &mut state,
                id,
                Handshake {
                    version: 2,
                    priority,
                    port: 6000,
                    host: host.to_string(),
                },
            )
            .unwrap();
        (eid, id)
    }

    struct CountingElection(AtomicUsize);

    impl ElectionHook for CountingElection {
        fn master_lost(&self, _master: Eid) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_add_site_and_lookup() {
        let (t, _rx) = transport(test_config());

        let eid = t.add_site("127.0.0.1", 6001).await.unwrap();
        assert_eq!(t.find_site("127.0.0.1", 6001).await.unwrap(), eid);
        assert!(matches!(t.add_site("127.0.0.1", 6001).await, Err(Error::SiteExists(_))));
        assert!(matches!(t.find_site("127.0.0.1", 6002).await, Err(Error::SiteNotFound(_))));
        assert!(t.available_site(eid).await.is_none());
        assert!(matches!(t.add_site("127.0.0.1", 7000).await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_unresolvable_site_is_still_added() {
        let (t, _rx) = transport(test_config());

        let eid = t.add_site("no-such-host.invalid", 6000).await.unwrap();
        let sites = t.sites().await;
        assert_eq!(sites.len(), 1);
        assert_eq!(sites[0].eid, eid);
        assert!(sites[0].needs_resolution());
    }

    #[tokio::test]
    async fn test_handshake_makes_site_available() {
        let (t, _rx) = transport(test_config());
        let (eid, _) = ready_site(&t, "db-2", 100, Arc::new(MemorySink::unlimited())).await;

        let site = t.available_site(eid).await.unwrap();
        assert!(site.is_peer());
        assert_eq!(t.connection_state(eid).await, Some(ConnState::Ready));
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let (t, _rx) = transport(test_config());
        let (eid, id) = ready_site(&t, "db-2", 100, Arc::new(MemorySink::unlimited())).await;

        {
            let mut state = t.shared.state.lock().await;
            t.shared.mark_defunct(&mut state, id, "test");
            t.shared.mark_defunct(&mut state, id, "test again");
        }
        assert!(t.available_site(eid).await.is_none());

        let a = {
            let shared = Arc::clone(&t.shared);
            tokio::spawn(async move {
                let mut state = shared.state.lock().await;
                shared.cleanup(&mut state, id)
            })
        };
        let b = {
            let shared = Arc::clone(&t.shared);
            tokio::spawn(async move {
                let mut state = shared.state.lock().await;
                shared.cleanup(&mut state, id)
            })
        };
        let outcomes = [a.await.unwrap(), b.await.unwrap()];

        let lost: Vec<_> = outcomes
            .iter()
            .filter(|o| matches!(o, Cleanup::Done(Some(_))))
            .collect();
        assert_eq!(lost.len(), 1);

        let stats = t.stats().await;
        assert_eq!(stats.connections_dropped, 1);
        assert_eq!(stats.connections_destroyed, 1);

        let sites = t.sites().await;
        assert_eq!(sites[0].conn, None);
        assert_eq!(sites[0].state, SiteState::Idle);
    }

    #[tokio::test]
    async fn test_cleanup_deferred_while_sender_blocked() {
        let mut config = test_config();
        config.replication.ack_timeout_ms = 1_000;
        let (t, _rx) = transport(config);
        let sink = Arc::new(MemorySink::unlimited());
        let (eid, id) = ready_site(&t, "db-2", 100, Arc::clone(&sink)).await;
        sink.stall();

        // Saturate the queue so the next blockable send waits.
        for _ in 0..3 {
            t.send_one(eid, MessageType::RepMessage, Bytes::new(), Bytes::from_static(b"x"), true)
                .await
                .unwrap();
        }
        let blocked = {
            let t = t.clone();
            tokio::spawn(async move {
                t.send_one(eid, MessageType::RepMessage, Bytes::new(), Bytes::from_static(b"y"), true)
                    .await
            })
        };

        // Wait for the sender to register as blocked.
        loop {
            let state = t.shared.state.lock().await;
            if state.conns.get(&id).map_or(false, |c| c.blockers == 1) {
                break;
            }
            drop(state);
            tokio::task::yield_now().await;
        }

        {
            let mut state = t.shared.state.lock().await;
            t.shared.mark_defunct(&mut state, id, "test");
            assert_eq!(t.shared.cleanup(&mut state, id), Cleanup::Deferred);
        }

        // The blocked sender wakes, sees the connection is gone and fails.
        assert!(matches!(blocked.await.unwrap(), Err(Error::Unavailable(_))));

        let mut state = t.shared.state.lock().await;
        assert_eq!(state.conns.get(&id).map(|c| c.blockers), Some(0));
        assert!(matches!(t.shared.cleanup(&mut state, id), Cleanup::Done(Some(_))));
        assert_eq!(state.stats.connections_destroyed, 1);
    }

    #[tokio::test]
    async fn test_master_loss_calls_election() {
        let election = Arc::new(CountingElection(AtomicUsize::new(0)));
        let (tx, _rx) = mpsc::channel(8);
        let t = RepTransport::new(
            test_config(),
            tx,
            Some(Arc::clone(&election) as Arc<dyn ElectionHook>),
        )
        .unwrap();

        let (master, master_conn) = ready_site(&t, "db-2", 100, Arc::new(MemorySink::unlimited())).await;
        let (_, other_conn) = ready_site(&t, "db-3", 100, Arc::new(MemorySink::unlimited())).await;
        t.set_master(Some(master)).await;

        for id in [other_conn, master_conn] {
            let outcome = {
                let mut state = t.shared.state.lock().await;
                t.shared.mark_defunct(&mut state, id, "test");
                t.shared.cleanup(&mut state, id)
            };
            if let Cleanup::Done(Some(lost)) = outcome {
                t.shared.connection_lost(lost);
            }
        }

        assert_eq!(election.0.load(Ordering::SeqCst), 1);
        t.shutdown().await;
    }

    #[tokio::test]
    async fn test_permanent_send_waits_for_quorum() {
        let mut config = test_config();
        config.replication.ack_timeout_ms = 2_000;
        let (t, _rx) = transport(config);

        let mut eids = Vec::new();
        for host in ["db-2", "db-3", "db-4", "db-5"] {
            let (eid, _) = ready_site(&t, host, 100, Arc::new(MemorySink::unlimited())).await;
            eids.push(eid);
        }

        let flags = SendFlags {
            permanent: true,
            ..Default::default()
        };
        let send = {
            let t = t.clone();
            tokio::spawn(async move {
                t.send(Target::Broadcast, Bytes::new(), Bytes::from_static(b"commit"), 42, flags)
                    .await
            })
        };

        t.record_ack(eids[0], 42).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!send.is_finished());

        t.record_ack(eids[2], 50).await;
        send.await.unwrap().unwrap();
        assert!(t.is_permanent(42).await);
    }

    #[tokio::test]
    async fn test_permanent_send_times_out() {
        let (t, _rx) = transport(test_config());
        let (eid, _) = ready_site(&t, "db-2", 100, Arc::new(MemorySink::unlimited())).await;

        let flags = SendFlags {
            permanent: true,
            ..Default::default()
        };
        let result = t
            .send(Target::Site(eid), Bytes::new(), Bytes::from_static(b"txn"), 9, flags)
            .await;

        assert!(matches!(result, Err(Error::PermTimeout { lsn: 9 })));
        assert_eq!(t.stats().await.perm_failed, 1);
    }

    #[tokio::test]
    async fn test_permanent_send_fails_fast_without_peers() {
        let mut config = test_config();
        config.replication.ack_policy = AckPolicy::OnePeer;
        let (t, _rx) = transport(config);
        let (client, _) = ready_site(&t, "db-2", 0, Arc::new(MemorySink::unlimited())).await;

        let flags = SendFlags {
            permanent: true,
            ..Default::default()
        };
        let start = Instant::now();
        let result = t
            .send(Target::Site(client), Bytes::new(), Bytes::from_static(b"txn"), 9, flags)
            .await;

        assert!(matches!(result, Err(Error::Unavailable(_))));
        assert!(start.elapsed() < Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_send_to_unavailable_site() {
        let (t, _rx) = transport(test_config());
        let eid = t.add_site("127.0.0.1", 6001).await.unwrap();

        let result = t
            .send(Target::Site(eid), Bytes::new(), Bytes::new(), 1, SendFlags::default())
            .await;
        assert!(matches!(result, Err(Error::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_anywhere_requests_forward_to_peer() {
        let (t, _rx) = transport(test_config());
        let master_sink = Arc::new(MemorySink::unlimited());
        let peer_sink = Arc::new(MemorySink::unlimited());
        let (master, _) = ready_site(&t, "db-2", 100, Arc::clone(&master_sink)).await;
        let (peer, _) = ready_site(&t, "db-3", 100, Arc::clone(&peer_sink)).await;
        t.set_peer(Some(peer)).await;

        let master_before = master_sink.written().len();
        let peer_before = peer_sink.written().len();

        let anywhere = SendFlags {
            anywhere: true,
            ..Default::default()
        };
        t.send(Target::Site(master), Bytes::new(), Bytes::from_static(b"req"), 0, anywhere)
            .await
            .unwrap();
        assert_eq!(master_sink.written().len(), master_before);
        assert!(peer_sink.written().len() > peer_before);

        let rerequest = SendFlags {
            anywhere: true,
            rerequest: true,
            ..Default::default()
        };
        t.send(Target::Site(master), Bytes::new(), Bytes::from_static(b"req"), 0, rerequest)
            .await
            .unwrap();
        assert!(master_sink.written().len() > master_before);
    }

    #[tokio::test]
    async fn test_shutdown_releases_blocked_sender() {
        let mut config = test_config();
        config.replication.ack_timeout_ms = 60_000;
        let (t, _rx) = transport(config);
        let sink = Arc::new(MemorySink::unlimited());
        let (eid, _) = ready_site(&t, "db-2", 100, Arc::clone(&sink)).await;
        sink.stall();

        for _ in 0..3 {
            t.send_one(eid, MessageType::RepMessage, Bytes::new(), Bytes::from_static(b"x"), true)
                .await
                .unwrap();
        }
        let blocked = {
            let t = t.clone();
            tokio::spawn(async move {
                t.send_one(eid, MessageType::RepMessage, Bytes::new(), Bytes::from_static(b"y"), true)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let start = Instant::now();
        t.shutdown().await;
        let result = tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::Timeout) | Err(Error::Unavailable(_))));
        assert!(start.elapsed() < Duration::from_secs(1));

        // The last blocked sender finishes the teardown itself.
        let state = t.shared.state.lock().await;
        assert!(state.conns.is_empty());
        assert_eq!(state.stats.connections_destroyed, 1);
        assert_eq!(state.sites.get(eid).unwrap().conn, None);
    }

    async fn eventually<F, Fut, T>(mut probe: F) -> T
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Option<T>>,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(v) = probe().await {
                    return v;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_loopback_permanent_send() {
        let mut config = RepConfig::new("127.0.0.1", 0);
        config.replication.ack_timeout_ms = 5_000;
        config.replication.heartbeat_interval_ms = 10;
        let (a, _a_rx) = transport(config.clone());
        let (b, mut b_rx) = transport(config);

        let a_addr = a.start().await.unwrap();
        let b_addr = b.start().await.unwrap();
        assert!(matches!(a.start().await, Err(Error::Config(_))));

        let b_eid = a.add_site("127.0.0.1", b_addr.port()).await.unwrap();
        let (a_ref, b_ref) = (&a, &b);
        eventually(move || async move { a_ref.available_site(b_eid).await }).await;
        let a_eid = eventually(move || async move {
            let eid = b_ref.find_site("127.0.0.1", a_addr.port()).await.ok()?;
            b_ref.available_site(eid).await.map(|_| eid)
        })
        .await;

        let flags = SendFlags {
            permanent: true,
            ..Default::default()
        };
        let send = {
            let a = a.clone();
            tokio::spawn(async move {
                a.send(
                    Target::Site(b_eid),
                    Bytes::from_static(b"ctl"),
                    Bytes::from_static(b"log record"),
                    5,
                    flags,
                )
                .await
            })
        };

        let incoming = tokio::time::timeout(Duration::from_secs(5), b_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(incoming.eid, a_eid);
        assert_eq!(incoming.payload, Bytes::from_static(b"log record"));

        b.send_ack(a_eid, 5).await.unwrap();
        send.await.unwrap().unwrap();
        assert!(a.is_permanent(5).await);
        assert_eq!(a.connection_state(b_eid).await, Some(ConnState::Ready));

        a.shutdown().await;
        b.shutdown().await;
    }
}
