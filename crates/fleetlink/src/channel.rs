// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Connection channel: one discovery endpoint plus the set of active
// per-peer links.
//
// `update` is the only method that touches the network. Everything else
// operates on in-memory state, so the orchestrator can query and mutate the
// channel freely between updates.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::discovery::{
    AdvertisementDatagram, AdvertisementRecord, AdvertisementRegistry, DiscoveryDatagram,
    RegistrationDatagram,
};
use crate::framing::MAX_FRAME_PAYLOAD;
use crate::transport::{
    Connector, DatagramEndpoint, LinkKind, PeerLink, StreamAcceptor, TransportAddress,
    TransportError,
};
use crate::types::{DisconnectReason, PeerId};

/// Largest datagram or read chunk handled in one piece.
pub const MAX_PACKET_SIZE: usize = 2048;

/// Upper bound on datagrams drained from the discovery endpoint per update.
const MAX_DATAGRAMS_PER_UPDATE: usize = 256;

/// Upper bound on reads from one peer per update.
const MAX_READS_PER_PEER: usize = 64;

// ---------------------------------------------------------------------------
// Errors and public value types
// ---------------------------------------------------------------------------

/// Failures returned by channel operations.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("peer {0} is not active")]
    NotActive(PeerId),

    #[error("payload of {size} bytes exceeds link limit of {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("deferred send queue for peer {0} is full")]
    QueueFull(PeerId),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Lifecycle of a peer as seen by one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Known only through its advertisement.
    Advertising,
    /// Outbound connect in flight.
    Connecting,
    /// Reliable link established.
    Active,
    /// Link failed; removed at the next update.
    Evicted,
}

/// Bytes read from one peer's link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    pub source: PeerId,
    pub dest: PeerId,
    pub payload: Vec<u8>,
    /// Stream chunks need deframing; datagrams hold whole messages, one or more.
    pub link: LinkKind,
    pub received_at: Instant,
}

/// One-shot notifications produced by [`ConnectionChannel::update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// An active peer was evicted after a transport failure.
    Disconnected {
        peer_id: PeerId,
        reason: DisconnectReason,
    },
    /// A peer opened a reliable connection to our listener.
    ConnectionRequest { address: TransportAddress },
    /// An outbound connect completed; the peer is now active.
    Connected { peer_id: PeerId },
    /// An outbound connect failed or timed out; the peer was dropped.
    ConnectFailed {
        peer_id: PeerId,
        address: TransportAddress,
    },
}

/// Snapshot of one active connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub peer_id: PeerId,
    pub address: TransportAddress,
    pub link: LinkKind,
    pub state: ConnectionState,
    /// When the link became active, or when the connect started while
    /// still `Connecting`.
    pub connected_at: Instant,
    pub last_received: Option<Instant>,
    pub queued_packets: usize,
    pub deferred_sends: usize,
    /// Bytes accepted by the link but not yet written.
    pub send_backlog: usize,
}

/// Channel counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub datagrams_received: u64,
    pub datagrams_dropped: u64,
    pub advertisements: u64,
    pub registrations: u64,
    pub packets_received: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub deferred_sends: u64,
    pub evictions: u64,
    pub connect_failures: u64,
    pub announcements: u64,
}

/// Channel configuration.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Label used in logs ("robots", "ui").
    pub name: String,
    pub bind_host: String,
    pub discovery_port: u16,
    /// Reliable-accept listener port, if incoming connections are allowed.
    pub listen_port: Option<u16>,
    /// Link class opened to advertised peers.
    pub link: LinkKind,
    pub staleness: Duration,
    /// This side's id, used in announcements and as `RawPacket::dest`.
    pub local_peer_id: PeerId,
    /// Where presence announcements go.
    pub announce_to: Option<TransportAddress>,
    /// Updates between announcements (0 disables).
    pub announce_interval_updates: u32,
    /// Outgoing byte budget per update.
    pub send_budget_bytes: Option<usize>,
    /// Per-peer bound for both the receive queue and the deferred send queue.
    pub max_queued_packets: usize,
    pub max_packet_size: usize,
    /// How long an outbound connect may stay in flight.
    pub connect_timeout: Duration,
    /// Unwritten bytes a link may hold before the peer is evicted.
    pub max_send_backlog_bytes: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            name: "channel".into(),
            bind_host: "127.0.0.1".into(),
            discovery_port: 0,
            listen_port: None,
            link: LinkKind::Stream,
            staleness: Duration::from_secs(2),
            local_peer_id: 0,
            announce_to: None,
            announce_interval_updates: 10,
            send_budget_bytes: None,
            max_queued_packets: 1024,
            max_packet_size: MAX_PACKET_SIZE,
            connect_timeout: Duration::from_secs(5),
            max_send_backlog_bytes: 64 * 1024,
        }
    }
}

impl ChannelConfig {
    pub fn new(name: impl Into<String>, bind_host: impl Into<String>, discovery_port: u16) -> Self {
        Self {
            name: name.into(),
            bind_host: bind_host.into(),
            discovery_port,
            ..Default::default()
        }
    }

    pub fn discovery_address(&self) -> TransportAddress {
        TransportAddress::new(self.bind_host.clone(), self.discovery_port)
    }
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct Connection {
    peer_id: PeerId,
    address: TransportAddress,
    link: Box<dyn PeerLink>,
    state: ConnectionState,
    inbox: VecDeque<RawPacket>,
    deferred: VecDeque<Vec<u8>>,
    connected_at: Instant,
    last_received: Option<Instant>,
}

struct PendingRequest {
    address: TransportAddress,
    link: Box<dyn PeerLink>,
    since: Instant,
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// Discovery plus active per-peer connections for one peer population.
pub struct ConnectionChannel {
    config: ChannelConfig,
    connector: Arc<dyn Connector>,
    discovery: Option<Box<dyn DatagramEndpoint>>,
    acceptor: Option<Box<dyn StreamAcceptor>>,
    registry: AdvertisementRegistry,
    connections: BTreeMap<PeerId, Connection>,
    pending: Vec<PendingRequest>,
    events: Vec<ChannelEvent>,
    update_count: u64,
    last_update: Option<Instant>,
    sent_this_update: usize,
    recv_buf: Vec<u8>,
    stats: ChannelStats,
}

impl ConnectionChannel {
    pub fn new(config: ChannelConfig, connector: Arc<dyn Connector>) -> Self {
        let registry = AdvertisementRegistry::new(config.staleness);
        let recv_buf = vec![0u8; config.max_packet_size.max(1)];
        Self {
            config,
            connector,
            discovery: None,
            acceptor: None,
            registry,
            connections: BTreeMap::new(),
            pending: Vec::new(),
            events: Vec::new(),
            update_count: 0,
            last_update: None,
            sent_this_update: 0,
            recv_buf,
            stats: ChannelStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn stats(&self) -> ChannelStats {
        self.stats
    }

    pub fn is_started(&self) -> bool {
        self.discovery.is_some()
    }

    /// Bind the discovery endpoint and, if configured, the listener.
    pub fn start(&mut self) -> Result<(), TransportError> {
        if self.is_started() {
            return Err(TransportError::AlreadyStarted);
        }
        let discovery_addr = self.config.discovery_address();
        let endpoint = self.connector.bind_discovery(&discovery_addr)?;
        let acceptor = match self.config.listen_port {
            Some(port) => {
                let addr = TransportAddress::new(self.config.bind_host.clone(), port);
                Some(self.connector.listen(&addr)?)
            }
            None => None,
        };
        log::info!(
            "[{}] channel started, discovery on {}",
            self.config.name,
            discovery_addr
        );
        self.discovery = Some(endpoint);
        self.acceptor = acceptor;
        Ok(())
    }

    /// Close every endpoint and forget all peers.
    pub fn stop(&mut self) {
        if self.discovery.take().is_some() {
            log::info!("[{}] channel stopped", self.config.name);
        }
        self.acceptor = None;
        self.connections.clear();
        self.pending.clear();
        self.registry.clear();
        self.events.clear();
    }

    /// Time of the last update, or the wall clock before the first one.
    fn now(&self) -> Instant {
        self.last_update.unwrap_or_else(Instant::now)
    }

    /// One non-blocking I/O pass.
    pub fn update(&mut self, now: Instant) -> Result<(), TransportError> {
        if !self.is_started() {
            return Err(TransportError::NotStarted);
        }
        self.last_update = Some(now);
        self.update_count += 1;
        self.sent_this_update = 0;

        self.reap_evicted();
        self.poll_connecting(now);
        self.drain_discovery(now);
        self.registry.sweep(now);
        self.accept_links(now);
        self.read_connections(now);
        self.flush_deferred();
        self.flush_links();
        self.announce();
        Ok(())
    }

    fn poll_connecting(&mut self, now: Instant) {
        let timeout = self.config.connect_timeout;
        let mut failed = Vec::new();
        for conn in self.connections.values_mut() {
            if conn.state != ConnectionState::Connecting {
                continue;
            }
            match conn.link.poll_connect() {
                Ok(true) => {
                    log::info!(
                        "[{}] connected to peer {} at {}",
                        self.config.name,
                        conn.peer_id,
                        conn.address
                    );
                    conn.state = ConnectionState::Active;
                    conn.connected_at = now;
                    self.events.push(ChannelEvent::Connected {
                        peer_id: conn.peer_id,
                    });
                }
                Ok(false) if now.saturating_duration_since(conn.connected_at) < timeout => {}
                Ok(false) => {
                    log::warn!(
                        "[{}] connect to peer {} at {} timed out after {:?}",
                        self.config.name,
                        conn.peer_id,
                        conn.address,
                        timeout
                    );
                    failed.push(conn.peer_id);
                }
                Err(e) => {
                    log::warn!(
                        "[{}] connect to peer {} at {} failed: {}",
                        self.config.name,
                        conn.peer_id,
                        conn.address,
                        e
                    );
                    failed.push(conn.peer_id);
                }
            }
        }
        for peer_id in failed {
            if let Some(conn) = self.connections.remove(&peer_id) {
                self.stats.connect_failures += 1;
                self.events.push(ChannelEvent::ConnectFailed {
                    peer_id,
                    address: conn.address,
                });
            }
        }
    }

    fn reap_evicted(&mut self) {
        let evicted: Vec<PeerId> = self
            .connections
            .values()
            .filter(|c| c.state == ConnectionState::Evicted)
            .map(|c| c.peer_id)
            .collect();
        for peer_id in evicted {
            if let Some(conn) = self.connections.remove(&peer_id) {
                log::warn!(
                    "[{}] evicted peer {} ({}) after transport failure, {} queued packets dropped",
                    self.config.name,
                    peer_id,
                    conn.address,
                    conn.inbox.len()
                );
            }
            self.stats.evictions += 1;
            self.events.push(ChannelEvent::Disconnected {
                peer_id,
                reason: DisconnectReason::TransportError,
            });
        }
    }

    fn drain_discovery(&mut self, now: Instant) {
        let mut received = Vec::new();
        if let Some(endpoint) = self.discovery.as_mut() {
            while received.len() < MAX_DATAGRAMS_PER_UPDATE {
                match endpoint.recv_from(&mut self.recv_buf) {
                    Ok(Some((n, from))) => received.push((self.recv_buf[..n].to_vec(), from)),
                    Ok(None) => break,
                    Err(e) => {
                        log::warn!("[{}] discovery read failed: {}", self.config.name, e);
                        break;
                    }
                }
            }
        }
        for (bytes, from) in received {
            self.stats.datagrams_received += 1;
            self.handle_discovery_datagram(&bytes, &from, now);
        }
    }

    fn handle_discovery_datagram(&mut self, bytes: &[u8], from: &TransportAddress, now: Instant) {
        match DiscoveryDatagram::decode(bytes) {
            Ok(DiscoveryDatagram::Advertisement(ad)) => {
                self.stats.advertisements += 1;
                if self.connections.contains_key(&ad.peer_id) {
                    log::trace!(
                        "[{}] ignoring advertisement from connected peer {}",
                        self.config.name,
                        ad.peer_id
                    );
                    return;
                }
                self.registry
                    .observe(ad.peer_id, ad.address(), self.config.link, now);
            }
            Ok(DiscoveryDatagram::Registration(reg)) => {
                self.stats.registrations += 1;
                self.apply_registration(&reg);
            }
            Ok(DiscoveryDatagram::Keepalive) => {
                log::trace!("[{}] keepalive from {}", self.config.name, from);
            }
            Err(e) => {
                self.stats.datagrams_dropped += 1;
                log::warn!(
                    "[{}] dropping malformed discovery datagram ({} bytes) from {}: {}",
                    self.config.name,
                    bytes.len(),
                    from,
                    e
                );
            }
        }
    }

    fn accept_links(&mut self, now: Instant) {
        let Some(acceptor) = self.acceptor.as_mut() else {
            return;
        };
        loop {
            match acceptor.accept() {
                Ok(Some(link)) => {
                    let address = link.remote().clone();
                    log::info!(
                        "[{}] connection request from {}",
                        self.config.name,
                        address
                    );
                    self.events.push(ChannelEvent::ConnectionRequest {
                        address: address.clone(),
                    });
                    self.pending.push(PendingRequest {
                        address,
                        link,
                        since: now,
                    });
                }
                Ok(None) => break,
                Err(e) => {
                    log::warn!("[{}] accept failed: {}", self.config.name, e);
                    break;
                }
            }
        }
    }

    fn read_connections(&mut self, now: Instant) {
        let local = self.config.local_peer_id;
        for conn in self.connections.values_mut() {
            if conn.state != ConnectionState::Active {
                continue;
            }
            let mut reads = 0;
            while conn.inbox.len() < self.config.max_queued_packets && reads < MAX_READS_PER_PEER {
                match conn.link.recv(&mut self.recv_buf) {
                    Ok(Some(0)) => break,
                    Ok(Some(n)) => {
                        reads += 1;
                        self.stats.packets_received += 1;
                        self.stats.bytes_received += n as u64;
                        conn.last_received = Some(now);
                        conn.inbox.push_back(RawPacket {
                            source: conn.peer_id,
                            dest: local,
                            payload: self.recv_buf[..n].to_vec(),
                            link: conn.link.kind(),
                            received_at: now,
                        });
                    }
                    Ok(None) => break,
                    Err(e) => {
                        log::warn!(
                            "[{}] read from peer {} failed: {}",
                            self.config.name,
                            conn.peer_id,
                            e
                        );
                        conn.state = ConnectionState::Evicted;
                        break;
                    }
                }
            }
        }
    }

    fn flush_deferred(&mut self) {
        let Some(budget) = self.config.send_budget_bytes else {
            return;
        };
        for conn in self.connections.values_mut() {
            while conn.state == ConnectionState::Active {
                let Some(front) = conn.deferred.front() else {
                    break;
                };
                if over_budget(self.sent_this_update, front.len(), budget) {
                    return;
                }
                let payload = front.clone();
                if transmit(conn, &payload, &mut self.stats).is_ok() {
                    self.sent_this_update += payload.len();
                }
                conn.deferred.pop_front();
            }
        }
    }

    fn flush_links(&mut self) {
        let cap = self.config.max_send_backlog_bytes;
        for conn in self.connections.values_mut() {
            if conn.state != ConnectionState::Active {
                continue;
            }
            if let Err(e) = conn.link.flush() {
                log::warn!(
                    "[{}] write to peer {} failed: {}",
                    self.config.name,
                    conn.peer_id,
                    e
                );
                conn.state = ConnectionState::Evicted;
                continue;
            }
            let backlog = conn.link.pending_bytes();
            if backlog > cap {
                log::warn!(
                    "[{}] peer {} is not draining ({} bytes unsent, limit {})",
                    self.config.name,
                    conn.peer_id,
                    backlog,
                    cap
                );
                conn.state = ConnectionState::Evicted;
            }
        }
    }

    fn announce(&mut self) {
        let interval = u64::from(self.config.announce_interval_updates);
        if interval == 0 || (self.update_count - 1) % interval != 0 {
            return;
        }
        let (Some(target), Some(endpoint)) = (self.config.announce_to.as_ref(), self.discovery.as_mut())
        else {
            return;
        };
        // Without a listener there is nothing to connect to: send a bare
        // keepalive so the registrar still sees this side.
        let datagram = match self.config.listen_port {
            Some(port) => AdvertisementDatagram {
                port,
                ip: self.config.bind_host.clone(),
                peer_id: self.config.local_peer_id,
            }
            .encode(),
            None => Ok(vec![0u8]),
        };
        match datagram {
            Ok(bytes) => match endpoint.send_to(&bytes, target) {
                Ok(()) => self.stats.announcements += 1,
                Err(e) => log::warn!(
                    "[{}] announcement to {} failed: {}",
                    self.config.name,
                    target,
                    e
                ),
            },
            Err(e) => log::warn!("[{}] cannot encode announcement: {}", self.config.name, e),
        }
    }

    // -----------------------------------------------------------------------
    // Advertising peers
    // -----------------------------------------------------------------------

    /// Open a link to an advertising peer.
    ///
    /// The peer becomes `Active` at once if the link is up, otherwise
    /// `Connecting` until a later update reports [`ChannelEvent::Connected`]
    /// or [`ChannelEvent::ConnectFailed`]. Returns false, without any state
    /// change, if the peer is not advertising, is already known, or cannot
    /// be reached.
    pub fn accept_advertising(&mut self, peer_id: PeerId) -> bool {
        let now = self.now();
        self.accept_advertising_at(peer_id, now)
    }

    /// [`accept_advertising`](Self::accept_advertising) with staleness
    /// judged at `now` rather than at the last update.
    pub fn accept_advertising_at(&mut self, peer_id: PeerId, now: Instant) -> bool {
        let Some(record) = self
            .registry
            .get(peer_id)
            .filter(|r| !r.is_stale(now, self.config.staleness))
        else {
            log::warn!(
                "[{}] cannot accept peer {}: not advertising",
                self.config.name,
                peer_id
            );
            return false;
        };
        if self.connections.contains_key(&peer_id) {
            log::warn!(
                "[{}] peer {} is already connected",
                self.config.name,
                peer_id
            );
            return false;
        }
        let address = record.address.clone();
        let kind = record.link;
        match self
            .connector
            .connect(&address, kind)
            .and_then(|link| self.admit(peer_id, address.clone(), link, now))
        {
            Ok(_) => true,
            Err(e) => {
                log::warn!(
                    "[{}] failed to connect to peer {} at {}: {}",
                    self.config.name,
                    peer_id,
                    address,
                    e
                );
                false
            }
        }
    }

    /// Accept every advertising peer; returns how many became active.
    pub fn accept_all_advertising(&mut self) -> usize {
        self.advertising_peer_ids()
            .into_iter()
            .filter(|&id| self.accept_advertising(id))
            .count()
    }

    /// Apply a force-registration: enable pins the advertisement, disable
    /// withdraws it.
    pub fn apply_registration(&mut self, reg: &RegistrationDatagram) {
        if reg.enable {
            log::info!(
                "[{}] registered peer {} at {}",
                self.config.name,
                reg.peer_id,
                reg.address()
            );
            let now = self.now();
            self.registry.pin(reg.peer_id, reg.address(), reg.link, now);
        } else if self.registry.remove(reg.peer_id).is_some() {
            log::info!("[{}] unregistered peer {}", self.config.name, reg.peer_id);
        }
    }

    /// Peers advertising right now.
    pub fn advertising_peer_ids(&self) -> Vec<PeerId> {
        self.registry.list_active(self.now())
    }

    pub fn advertisement(&self, peer_id: PeerId) -> Option<&AdvertisementRecord> {
        self.registry.get(peer_id)
    }

    pub fn registry(&self) -> &AdvertisementRegistry {
        &self.registry
    }

    pub fn clear_advertising(&mut self) {
        self.registry.clear();
    }

    // -----------------------------------------------------------------------
    // Active connections
    // -----------------------------------------------------------------------

    /// Take ownership of a fresh link for `peer_id`.
    fn admit(
        &mut self,
        peer_id: PeerId,
        address: TransportAddress,
        mut link: Box<dyn PeerLink>,
        now: Instant,
    ) -> Result<ConnectionState, TransportError> {
        let state = if link.poll_connect()? {
            ConnectionState::Active
        } else {
            ConnectionState::Connecting
        };
        self.registry.remove(peer_id);
        self.insert_connection(peer_id, address, link, state, now);
        Ok(state)
    }

    fn insert_connection(
        &mut self,
        peer_id: PeerId,
        address: TransportAddress,
        link: Box<dyn PeerLink>,
        state: ConnectionState,
        connected_at: Instant,
    ) {
        log::info!(
            "[{}] peer {} {} at {} ({:?})",
            self.config.name,
            peer_id,
            if state == ConnectionState::Active { "active" } else { "connecting" },
            address,
            link.kind()
        );
        let previous = self.connections.insert(
            peer_id,
            Connection {
                peer_id,
                address,
                link,
                state,
                inbox: VecDeque::new(),
                deferred: VecDeque::new(),
                connected_at,
                last_received: None,
            },
        );
        if let Some(old) = previous {
            log::warn!(
                "[{}] replaced existing connection for peer {} ({})",
                self.config.name,
                peer_id,
                old.address
            );
        }
    }

    /// Connect to `address` for `peer_id` without an advertisement. An
    /// existing connection for the peer is replaced.
    pub fn force_register(
        &mut self,
        peer_id: PeerId,
        address: TransportAddress,
        link: LinkKind,
    ) -> Result<ConnectionState, TransportError> {
        let l = self.connector.connect(&address, link)?;
        let now = self.now();
        self.admit(peer_id, address, l, now)
    }

    /// Send one message payload to an active peer.
    ///
    /// With a send budget configured, payloads beyond the budget wait in a
    /// per-peer FIFO until the next update.
    pub fn send(&mut self, peer_id: PeerId, payload: &[u8]) -> Result<(), ChannelError> {
        self.send_inner(peer_id, payload, true)
    }

    /// Send now, bypassing the budget and the deferred queue.
    pub fn send_immediate(&mut self, peer_id: PeerId, payload: &[u8]) -> Result<(), ChannelError> {
        self.send_inner(peer_id, payload, false)
    }

    fn send_inner(&mut self, peer_id: PeerId, payload: &[u8], budgeted: bool) -> Result<(), ChannelError> {
        let max_packet = self.config.max_packet_size;
        let max_queued = self.config.max_queued_packets;
        let conn = self
            .connections
            .get_mut(&peer_id)
            .filter(|c| c.state == ConnectionState::Active)
            .ok_or(ChannelError::NotActive(peer_id))?;

        let limit = match conn.link.kind() {
            LinkKind::Stream => MAX_FRAME_PAYLOAD,
            LinkKind::Datagram => max_packet,
        };
        if payload.len() > limit {
            return Err(ChannelError::PayloadTooLarge {
                size: payload.len(),
                limit,
            });
        }

        if budgeted {
            if let Some(budget) = self.config.send_budget_bytes {
                if !conn.deferred.is_empty()
                    || over_budget(self.sent_this_update, payload.len(), budget)
                {
                    if conn.deferred.len() >= max_queued {
                        return Err(ChannelError::QueueFull(peer_id));
                    }
                    conn.deferred.push_back(payload.to_vec());
                    self.stats.deferred_sends += 1;
                    return Ok(());
                }
            }
        }

        transmit(conn, payload, &mut self.stats)?;
        self.sent_this_update += payload.len();
        Ok(())
    }

    /// Pop the oldest buffered inbound packet for `peer_id`.
    ///
    /// Packets already read from a peer that has since failed can still be
    /// drained until the next update removes it.
    pub fn pop_received(&mut self, peer_id: PeerId) -> Option<RawPacket> {
        self.connections.get_mut(&peer_id)?.inbox.pop_front()
    }

    /// Drop an active connection immediately. No event is produced.
    pub fn evict(&mut self, peer_id: PeerId) -> bool {
        match self.connections.remove(&peer_id) {
            Some(conn) => {
                self.stats.evictions += 1;
                log::info!(
                    "[{}] evicted peer {} ({})",
                    self.config.name,
                    peer_id,
                    conn.address
                );
                true
            }
            None => false,
        }
    }

    /// Drop every connection; returns the ids that had an established
    /// link. Connects still in flight are abandoned.
    pub fn evict_all(&mut self) -> Vec<PeerId> {
        let ids: Vec<PeerId> = self
            .connections
            .values()
            .filter(|c| c.state != ConnectionState::Connecting)
            .map(|c| c.peer_id)
            .collect();
        let all: Vec<PeerId> = self.connections.keys().copied().collect();
        for id in all {
            self.evict(id);
        }
        ids
    }

    pub fn is_connecting(&self, peer_id: PeerId) -> bool {
        self.connections
            .get(&peer_id)
            .is_some_and(|c| c.state == ConnectionState::Connecting)
    }

    pub fn connecting_peer_ids(&self) -> Vec<PeerId> {
        self.connections
            .values()
            .filter(|c| c.state == ConnectionState::Connecting)
            .map(|c| c.peer_id)
            .collect()
    }

    /// When anything was last read from `peer_id`'s link.
    pub fn last_received(&self, peer_id: PeerId) -> Option<Instant> {
        self.connections.get(&peer_id)?.last_received
    }

    pub fn is_active(&self, peer_id: PeerId) -> bool {
        self.connections
            .get(&peer_id)
            .is_some_and(|c| c.state == ConnectionState::Active)
    }

    pub fn active_peer_ids(&self) -> Vec<PeerId> {
        self.connections
            .values()
            .filter(|c| c.state == ConnectionState::Active)
            .map(|c| c.peer_id)
            .collect()
    }

    /// Where `peer_id` stands in this channel, if it is known at all.
    pub fn connection_state(&self, peer_id: PeerId) -> Option<ConnectionState> {
        if let Some(conn) = self.connections.get(&peer_id) {
            return Some(conn.state);
        }
        self.registry
            .get(peer_id)
            .map(|_| ConnectionState::Advertising)
    }

    pub fn connection_info(&self, peer_id: PeerId) -> Option<ConnectionInfo> {
        self.connections.get(&peer_id).map(|c| ConnectionInfo {
            peer_id: c.peer_id,
            address: c.address.clone(),
            link: c.link.kind(),
            state: c.state,
            connected_at: c.connected_at,
            last_received: c.last_received,
            queued_packets: c.inbox.len(),
            deferred_sends: c.deferred.len(),
            send_backlog: c.link.pending_bytes(),
        })
    }

    // -----------------------------------------------------------------------
    // Incoming connection requests
    // -----------------------------------------------------------------------

    /// Listener connections waiting for accept/refuse, oldest first.
    pub fn pending_requests(&self) -> Vec<(TransportAddress, Instant)> {
        self.pending
            .iter()
            .map(|p| (p.address.clone(), p.since))
            .collect()
    }

    /// Bind a pending connection to `peer_id` and make it active.
    pub fn accept_incoming(&mut self, address: &TransportAddress, peer_id: PeerId) -> bool {
        if self.connections.contains_key(&peer_id) {
            log::warn!(
                "[{}] refusing to bind {} to peer {}: already connected",
                self.config.name,
                address,
                peer_id
            );
            return false;
        }
        let Some(idx) = self.pending.iter().position(|p| &p.address == address) else {
            return false;
        };
        let request = self.pending.remove(idx);
        let now = self.now();
        match self.admit(peer_id, request.address, request.link, now) {
            Ok(_) => true,
            Err(e) => {
                log::warn!(
                    "[{}] connection from {} failed before accept: {}",
                    self.config.name,
                    address,
                    e
                );
                false
            }
        }
    }

    /// Drop a pending connection.
    pub fn refuse_incoming(&mut self, address: &TransportAddress) -> bool {
        let Some(idx) = self.pending.iter().position(|p| &p.address == address) else {
            return false;
        };
        self.pending.remove(idx);
        log::info!(
            "[{}] refused connection from {}",
            self.config.name,
            address
        );
        true
    }

    /// Take the notifications produced since the last call.
    pub fn drain_events(&mut self) -> Vec<ChannelEvent> {
        std::mem::take(&mut self.events)
    }
}

fn over_budget(sent: usize, len: usize, budget: usize) -> bool {
    // An empty budget window always admits one packet, however large.
    sent > 0 && sent + len > budget
}

fn transmit(conn: &mut Connection, payload: &[u8], stats: &mut ChannelStats) -> Result<(), ChannelError> {
    match conn.link.send(payload) {
        Ok(()) => {
            stats.packets_sent += 1;
            stats.bytes_sent += payload.len() as u64;
            Ok(())
        }
        Err(e) => {
            log::warn!("Send to peer {} failed: {}", conn.peer_id, e);
            conn.state = ConnectionState::Evicted;
            Err(e.into())
        }
    }
}
