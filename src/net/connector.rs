//! Connection establishment
//!
//! Outbound connects, inbound accepts and the handshake that turns a raw
//! socket into a ready connection bound to a site.

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncRead;
use tokio::net::{TcpListener, TcpStream};

use super::{io, ConnId, Connection, Inline, WireSink};
use crate::error::{Error, Result};
use crate::site::{Eid, SiteState};
use crate::transport::{Shared, State};
use crate::wire::{Handshake, MessageType, OutboundMessage, ProtocolVersion};

impl Shared {
    /// Register a freshly opened socket and send our handshake on it
    pub(crate) fn attach(
        self: &Arc<Self>,
        state: &mut State,
        eid: Option<Eid>,
        label: String,
        initiated_locally: bool,
        sink: Arc<dyn WireSink>,
    ) -> ConnId {
        let id = state.next_conn_id();
        let mut conn = Connection::new(id, eid, label, initiated_locally, sink);

        let writer = tokio::spawn(io::run_writer(
            Arc::clone(self),
            id,
            conn.wake_writer(),
            conn.sink(),
        ));
        conn.attach_task(writer);

        if let Some(site) = eid.and_then(|eid| state.sites.get_mut(eid)) {
            site.conn = Some(id);
            site.state = SiteState::Connecting;
        }

        let handshake = Handshake {
            version: ProtocolVersion::CURRENT.as_u32(),
            priority: state.local.priority,
            port: state.local.port,
            host: state.local.host.clone(),
        };
        let mut msg = OutboundMessage::encode(MessageType::Handshake, handshake.to_bytes(), Bytes::new());
        let sent = conn.write_inline(&mut msg, self.config.replication.queue_limit, false);
        state.conns.insert(id, conn);

        match sent {
            Inline::Failed(e) => self.mark_defunct(state, id, &e.to_string()),
            Inline::Handoff | Inline::Queued => state.stats.messages_queued += 1,
            _ => {}
        }
        id
    }

    /// Start decoding frames for a connection
    pub(crate) fn spawn_reader<R>(self: &Arc<Self>, state: &mut State, id: ConnId, reader: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let handle = tokio::spawn(io::run_reader(Arc::clone(self), id, reader));
        match state.conns.get_mut(&id) {
            Some(conn) => conn.attach_task(handle),
            None => handle.abort(),
        }
    }

    /// Complete the handshake on a connection.
    ///
    /// Inbound connections are matched to a site by the advertised address,
    /// discovering the site if it is new. When both sides connected to each
    /// other, both keep the connection opened by the side with the lower
    /// `host:port`.
    pub(crate) fn on_handshake(
        self: &Arc<Self>,
        state: &mut State,
        id: ConnId,
        handshake: Handshake,
    ) -> Result<()> {
        let version = ProtocolVersion::negotiate(handshake.version).ok_or_else(|| {
            Error::Protocol(format!("unsupported protocol version {}", handshake.version))
        })?;

        let (initiated_locally, known_eid) = match state.conns.get(&id) {
            None => return Ok(()),
            Some(conn) if conn.state() != super::ConnState::Connecting => {
                return Err(Error::Protocol(format!("unexpected handshake on {}", id)));
            }
            Some(conn) => (conn.initiated_locally, conn.eid),
        };

        let eid = match known_eid {
            Some(eid) => eid,
            None => match state.sites.find_site(&handshake.host, handshake.port) {
                Ok(eid) => eid,
                Err(_) => {
                    let eid = state.sites.add_site(&handshake.host, handshake.port)?;
                    tracing::info!(
                        "Discovered site {} at {}:{}",
                        eid,
                        handshake.host,
                        handshake.port
                    );
                    let shared = Arc::clone(self);
                    tokio::spawn(async move { shared.resolve_site(eid).await });
                    eid
                }
            },
        };

        let existing = state
            .sites
            .get(eid)
            .and_then(|s| s.conn)
            .filter(|other| *other != id);
        if let Some(other_id) = existing {
            if let Some(other) = state.conns.get(&other_id).filter(|c| !c.is_defunct()) {
                let remote = format!("{}:{}", handshake.host, handshake.port);
                let local_is_lower = state.local.address() < remote;
                let keep_new = other.initiated_locally == initiated_locally
                    || initiated_locally == local_is_lower;
                if !keep_new {
                    return Err(Error::Protocol(format!(
                        "duplicate connection to site {}, keeping {}",
                        eid, other_id
                    )));
                }
                self.mark_defunct(state, other_id, "replaced by duplicate connection");
            }
        }

        let site = state
            .sites
            .get_mut(eid)
            .ok_or_else(|| Error::SiteNotFound(eid.to_string()))?;
        site.conn = Some(id);
        site.state = SiteState::Connected;
        site.set_priority(handshake.priority);

        if let Some(conn) = state.conns.get_mut(&id) {
            conn.eid = Some(eid);
            conn.set_ready(version);
            tracing::info!(
                "Connection {} to site {} ({}) ready, protocol {}, priority {}",
                id,
                eid,
                conn.label,
                version,
                handshake.priority
            );
        }
        Ok(())
    }

    /// Connect to a site that has no connection.
    ///
    /// Each resolved address is tried in turn, starting from the one that
    /// worked last. If none accepts, the attempt is rescheduled.
    pub(crate) async fn open(self: &Arc<Self>, eid: Eid) {
        if self.shutdown.is_cancelled() {
            return;
        }

        let pending = {
            let mut state = self.state.lock().await;
            let Some(site) = state.sites.get_mut(eid) else {
                return;
            };
            if site.state != SiteState::Idle || site.conn.is_some() {
                return;
            }
            site.state = SiteState::Connecting;
            site.needs_resolution()
        };

        if pending {
            self.resolve_site(eid).await;
        }

        let addrs = match self.state.lock().await.sites.get(eid) {
            Some(site) => site.connect_order(),
            None => return,
        };

        for addr in addrs {
            let error = match tokio::time::timeout(
                self.config.connect_timeout(),
                TcpStream::connect(addr),
            )
            .await
            {
                Ok(Ok(stream)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!("Failed to set TCP_NODELAY on {}: {}", addr, e);
                    }
                    let (read_half, write_half) = stream.into_split();

                    let mut state = self.state.lock().await;
                    let Some(site) = state.sites.get_mut(eid) else {
                        return;
                    };
                    if site.conn.is_some() {
                        tracing::debug!("Site {} connected meanwhile, dropping {}", eid, addr);
                        return;
                    }
                    site.set_current(addr);

                    let id = self.attach(&mut state, Some(eid), addr.to_string(), true, Arc::new(write_half));
                    self.spawn_reader(&mut state, id, read_half);
                    tracing::debug!("Connected to site {} at {} as {}", eid, addr, id);
                    return;
                }
                Ok(Err(e)) => Error::ConnectionFailed {
                    address: addr.to_string(),
                    reason: e.to_string(),
                },
                Err(_) => Error::ConnectionFailed {
                    address: addr.to_string(),
                    reason: format!("timed out after {:?}", self.config.connect_timeout()),
                },
            };

            tracing::warn!("Site {}: {}", eid, error);
            self.state.lock().await.stats.connect_failures += 1;
        }

        {
            let mut state = self.state.lock().await;
            match state.sites.get_mut(eid) {
                Some(site) if site.conn.is_none() => site.state = SiteState::Idle,
                _ => return,
            }
        }
        self.schedule_reconnect(eid);
    }

    /// Accept inbound connections until shutdown
    pub(crate) async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = self.shutdown.cancelled() => break,
            };

            let (stream, peer) = match accepted {
                Ok(v) => v,
                Err(e) => {
                    tracing::error!("Accept error: {}", e);
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    continue;
                }
            };

            tracing::debug!("Inbound replication connection from {}", peer);
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!("Failed to set TCP_NODELAY on {}: {}", peer, e);
            }
            let (read_half, write_half) = stream.into_split();

            let mut state = self.state.lock().await;
            let id = self.attach(&mut state, None, peer.to_string(), false, Arc::new(write_half));
            self.spawn_reader(&mut state, id, read_half);
        }
        tracing::debug!("Accept loop stopped");
    }
}
