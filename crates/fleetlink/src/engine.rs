// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Engine orchestrator: owns both connection channels, drives the lifecycle
// state machine once per tick and publishes engine events.
//
// Tick order:
//   1. late-tick check
//   2. commands queued through EngineHandle
//   3. state loop (each state services its channels, then transitions are
//      re-evaluated until none applies)
//   4. silence eviction, UI keepalive pings
//   5. event publication to subscribers

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use thiserror::Error;

use crate::channel::{ChannelEvent, ConnectionChannel};
use crate::config::{ConfigError, EngineConfig};
use crate::dispatch::{DispatchError, DispatchTable, DispatchTableBuilder, Priority};
use crate::handler::{HandlerStats, MessageHandler, SendError};
use crate::mailbox::{EngineCommand, EngineHandle, Mailbox};
use crate::protocol::{
    fixed_size, EngineStateChangedPayload, Message, PeerAvailablePayload,
    PeerConnectedPayload, PeerDisconnectedPayload, PingPayload, SyncTimePayload,
    TAG_GENERIC_COMMAND, TAG_IMAGE_CHUNK, TAG_PING, TAG_STATE_UPDATE, TAG_SYNC_TIME_ACK,
};
use crate::transport::{Connector, TransportError};
use crate::types::{DisconnectReason, EngineState, PeerId, PeerKind};

const COMMAND_MAILBOX_CAPACITY: usize = 64;

/// Subscriber backlog cap, as a multiple of the channel capacity.
const BACKLOG_FACTOR: usize = 4;

/// Engine errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine is not initialized")]
    NotInitialized,

    #[error("engine is already initialized")]
    AlreadyInitialized,

    #[error("engine is already running")]
    AlreadyRunning,

    #[error("no {0} channel in this role")]
    ChannelUnavailable(PeerKind),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Send(#[from] SendError),
}

/// What this engine instance coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineRole {
    /// Bind the robot channel and wait for robots.
    pub accepts_robots: bool,
    /// Bind the UI channel and wait for UI devices.
    pub is_host: bool,
}

impl EngineRole {
    pub fn host() -> Self {
        Self {
            accepts_robots: true,
            is_host: true,
        }
    }

    pub fn client() -> Self {
        Self {
            accepts_robots: true,
            is_host: false,
        }
    }

    pub fn ui_only() -> Self {
        Self {
            accepts_robots: false,
            is_host: true,
        }
    }

    /// State entered by `start`.
    fn first_state(self) -> EngineState {
        if self.is_host {
            EngineState::WaitingForPeers(PeerKind::Ui)
        } else if self.accepts_robots {
            EngineState::WaitingForPeers(PeerKind::Robot)
        } else {
            EngineState::Running
        }
    }
}

/// Notifications published to subscribers once per tick.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    StateChanged {
        old: EngineState,
        new: EngineState,
    },
    PeerAvailable {
        kind: PeerKind,
        peer_id: PeerId,
    },
    PeerConnected {
        kind: PeerKind,
        peer_id: PeerId,
        success: bool,
    },
    PeerDisconnected {
        kind: PeerKind,
        peer_id: PeerId,
        reason: DisconnectReason,
    },
    /// A robot acknowledged the time-sync handshake.
    HandshakeComplete { peer_id: PeerId },
    /// Application message forwarded by a dispatch handler.
    Message {
        kind: PeerKind,
        peer_id: PeerId,
        message: Message,
    },
}

/// Per-peer bookkeeping kept by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerRecord {
    pub connected_at: Instant,
    /// Last inbound traffic of any kind; starts at `connected_at`.
    pub last_message: Instant,
    pub synced: bool,
    pub last_rtt_ms: Option<f64>,
}

impl PeerRecord {
    fn new(now: Instant) -> Self {
        Self {
            connected_at: now,
            last_message: now,
            synced: false,
            last_rtt_ms: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub ticks: u64,
    pub late_ticks: u64,
    pub state_changes: u64,
    pub commands_applied: u64,
    pub messages_delivered: u64,
    pub silence_evictions: u64,
    pub transport_evictions: u64,
    pub events_published: u64,
    pub events_dropped: u64,
}

// ---------------------------------------------------------------------------
// Handler context
// ---------------------------------------------------------------------------

/// Context handed to dispatch handlers while one channel's inbound traffic
/// is processed. Effects are applied by the engine after processing.
pub struct EngineContext {
    kind: PeerKind,
    now: Instant,
    clock_ms: f64,
    replies: Vec<(PeerId, Message)>,
    events: Vec<EngineEvent>,
    synced: Vec<PeerId>,
    round_trips: Vec<(PeerId, f64)>,
}

impl EngineContext {
    fn new(kind: PeerKind, now: Instant, clock_ms: f64) -> Self {
        Self {
            kind,
            now,
            clock_ms,
            replies: Vec::new(),
            events: Vec::new(),
            synced: Vec::new(),
            round_trips: Vec::new(),
        }
    }

    /// Population of the peer being processed.
    pub fn kind(&self) -> PeerKind {
        self.kind
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    /// Milliseconds since the engine's first tick.
    pub fn clock_ms(&self) -> f64 {
        self.clock_ms
    }

    /// Queue a message back to `peer_id` on the same channel.
    pub fn reply(&mut self, peer_id: PeerId, msg: Message) {
        self.replies.push((peer_id, msg));
    }

    pub fn publish(&mut self, event: EngineEvent) {
        self.events.push(event);
    }

    /// Publish the message itself to subscribers.
    pub fn forward(&mut self, peer_id: PeerId, msg: &Message) {
        self.events.push(EngineEvent::Message {
            kind: self.kind,
            peer_id,
            message: msg.clone(),
        });
    }

    pub fn mark_synced(&mut self, peer_id: PeerId) {
        self.synced.push(peer_id);
    }

    pub fn record_round_trip(&mut self, peer_id: PeerId, rtt_ms: f64) {
        self.round_trips.push((peer_id, rtt_ms));
    }
}

fn handle_ping(ctx: &mut EngineContext, peer_id: PeerId, msg: &Message) {
    let Message::Ping(ping) = msg else {
        return;
    };
    if ping.is_response {
        let rtt = ctx.clock_ms() - ping.time_sent_ms;
        ctx.record_round_trip(peer_id, rtt);
    } else {
        ctx.reply(
            peer_id,
            Message::Ping(PingPayload {
                is_response: true,
                ..*ping
            }),
        );
    }
}

fn handle_sync_ack(ctx: &mut EngineContext, peer_id: PeerId, _msg: &Message) {
    ctx.mark_synced(peer_id);
}

/// Dispatch handler that republishes the message as [`EngineEvent::Message`].
pub fn forward_message(ctx: &mut EngineContext, peer_id: PeerId, msg: &Message) {
    ctx.forward(peer_id, msg);
}

/// Keepalive and handshake handlers the engine relies on.
pub fn builtin_dispatch() -> Result<DispatchTableBuilder<EngineContext>, DispatchError> {
    DispatchTable::builder()
        .register(
            TAG_PING,
            fixed_size(TAG_PING).unwrap_or(0),
            Priority::High,
            handle_ping,
        )?
        .register(
            TAG_SYNC_TIME_ACK,
            fixed_size(TAG_SYNC_TIME_ACK).unwrap_or(0),
            Priority::Normal,
            handle_sync_ack,
        )
}

/// Builtins plus forwarding of robot telemetry and commands.
pub fn standard_dispatch() -> Result<DispatchTable<EngineContext>, DispatchError> {
    Ok(builtin_dispatch()?
        .register(
            TAG_STATE_UPDATE,
            fixed_size(TAG_STATE_UPDATE).unwrap_or(0),
            Priority::Normal,
            forward_message,
        )?
        .register(TAG_IMAGE_CHUNK, 0, Priority::Low, forward_message)?
        .register(TAG_GENERIC_COMMAND, 0, Priority::Normal, forward_message)?
        .build())
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

struct Side {
    kind: PeerKind,
    channel: ConnectionChannel,
    handler: MessageHandler,
    peers: BTreeMap<PeerId, PeerRecord>,
    /// Advertising peers already announced during their current appearance.
    announced: BTreeSet<PeerId>,
    updated: bool,
}

struct Subscriber {
    tx: Sender<EngineEvent>,
    backlog: VecDeque<EngineEvent>,
}

fn slot(kind: PeerKind) -> usize {
    usize::from(kind.as_u8())
}

pub struct EngineOrchestrator {
    role: EngineRole,
    connector: Arc<dyn Connector>,
    dispatch: DispatchTable<EngineContext>,
    config: Option<Arc<EngineConfig>>,
    state: EngineState,
    /// Indexed by `PeerKind`.
    sides: [Option<Side>; 2],
    mailbox: Arc<Mailbox<EngineCommand>>,
    subscribers: Vec<Subscriber>,
    pending_events: Vec<EngineEvent>,
    epoch: Option<Instant>,
    last_tick: Option<Instant>,
    last_ping: Option<Instant>,
    ping_counter: u32,
    stats: EngineStats,
}

impl EngineOrchestrator {
    pub fn new(
        role: EngineRole,
        connector: Arc<dyn Connector>,
        dispatch: DispatchTable<EngineContext>,
    ) -> Self {
        Self {
            role,
            connector,
            dispatch,
            config: None,
            state: EngineState::Stopped,
            sides: [None, None],
            mailbox: Arc::new(Mailbox::new(COMMAND_MAILBOX_CAPACITY)),
            subscribers: Vec::new(),
            pending_events: Vec::new(),
            epoch: None,
            last_tick: None,
            last_ping: None,
            ping_counter: 0,
            stats: EngineStats::default(),
        }
    }

    pub fn role(&self) -> EngineRole {
        self.role
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    pub fn config(&self) -> Option<&EngineConfig> {
        self.config.as_deref()
    }

    pub fn is_initialized(&self) -> bool {
        self.config.is_some()
    }

    /// Thread-safe command sender for this engine.
    pub fn handle(&self) -> EngineHandle {
        EngineHandle::new(self.mailbox.clone())
    }

    /// Receive engine events. Events published before subscribing are not
    /// replayed.
    pub fn subscribe(&mut self) -> Receiver<EngineEvent> {
        let capacity = self
            .config
            .as_ref()
            .map(|c| c.event_channel_capacity)
            .unwrap_or(256);
        let (tx, rx) = channel::bounded(capacity);
        self.subscribers.push(Subscriber {
            tx,
            backlog: VecDeque::new(),
        });
        rx
    }

    /// Validate the configuration and bind the channels this role needs.
    pub fn init(&mut self, config: EngineConfig) -> Result<(), EngineError> {
        if self.config.is_some() {
            return Err(EngineError::AlreadyInitialized);
        }
        config.validate()?;

        let mut sides: [Option<Side>; 2] = [None, None];
        if self.role.accepts_robots {
            sides[slot(PeerKind::Robot)] = Some(self.open_side(
                PeerKind::Robot,
                ConnectionChannel::new(config.robot_channel_config(), self.connector.clone()),
                &config,
            )?);
        }
        if self.role.is_host {
            sides[slot(PeerKind::Ui)] = Some(self.open_side(
                PeerKind::Ui,
                ConnectionChannel::new(config.ui_channel_config(), self.connector.clone()),
                &config,
            )?);
        }

        log::info!(
            "Engine initialized (robots: {}, ui: {}, min ui {}, min robots {})",
            self.role.accepts_robots,
            self.role.is_host,
            config.min_ui_devices,
            config.min_robots
        );
        self.sides = sides;
        self.config = Some(Arc::new(config));
        Ok(())
    }

    fn open_side(
        &self,
        kind: PeerKind,
        mut channel: ConnectionChannel,
        config: &EngineConfig,
    ) -> Result<Side, EngineError> {
        channel.start()?;
        Ok(Side {
            kind,
            channel,
            handler: MessageHandler::new(config.handler_config()),
            peers: BTreeMap::new(),
            announced: BTreeSet::new(),
            updated: false,
        })
    }

    /// Leave Stopped and begin waiting for peers.
    pub fn start(&mut self) -> Result<(), EngineError> {
        if self.config.is_none() {
            return Err(EngineError::NotInitialized);
        }
        match self.state {
            EngineState::Running => Err(EngineError::AlreadyRunning),
            EngineState::Stopped => {
                self.set_state(self.role.first_state());
                Ok(())
            }
            EngineState::WaitingForPeers(_) => Ok(()),
        }
    }

    /// Drop every peer, return to Stopped and start again.
    pub fn reinitialize(&mut self) -> Result<(), EngineError> {
        if self.config.is_none() {
            return Err(EngineError::NotInitialized);
        }
        log::info!("Engine re-initializing");
        self.drop_all_peers(DisconnectReason::Shutdown);
        for side in self.sides.iter_mut().flatten() {
            side.channel.clear_advertising();
            side.announced.clear();
        }
        self.set_state(EngineState::Stopped);
        self.start()
    }

    /// Drop every peer, close the channels and forget the configuration.
    pub fn shutdown(&mut self) {
        if self.config.is_none() {
            return;
        }
        self.drop_all_peers(DisconnectReason::Shutdown);
        self.set_state(EngineState::Stopped);
        for side in self.sides.iter_mut().flatten() {
            side.channel.stop();
        }
        self.sides = [None, None];
        self.config = None;
        self.publish_events();
        log::info!("Engine shut down");
    }

    fn drop_all_peers(&mut self, reason: DisconnectReason) {
        for kind in [PeerKind::Robot, PeerKind::Ui] {
            let (connecting, evicted) = match self.sides[slot(kind)].as_mut() {
                Some(side) => (side.channel.connecting_peer_ids(), side.channel.evict_all()),
                None => continue,
            };
            for peer_id in connecting {
                self.publish_connected(kind, peer_id, false);
            }
            for peer_id in evicted {
                self.remove_peer(kind, peer_id, reason);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Tick
    // -----------------------------------------------------------------------

    /// Run one tick at time `now`.
    pub fn update(&mut self, now: Instant) -> Result<(), EngineError> {
        let config = self.config.clone().ok_or(EngineError::NotInitialized)?;

        if let Some(last) = self.last_tick {
            let gap = now.saturating_duration_since(last);
            if gap > config.late_tick_threshold() {
                self.stats.late_ticks += 1;
                log::warn!(
                    "Late tick: {:?} since previous tick (period {:?})",
                    gap,
                    config.tick_period()
                );
            }
        }
        self.last_tick = Some(now);
        self.epoch.get_or_insert(now);
        self.stats.ticks += 1;
        for side in self.sides.iter_mut().flatten() {
            side.updated = false;
        }

        self.apply_commands();

        loop {
            match self.state {
                EngineState::Stopped => break,
                EngineState::WaitingForPeers(PeerKind::Ui) => {
                    self.service(PeerKind::Ui, now);
                    self.accept_local_ui(&config);
                    self.announce_advertising(PeerKind::Ui, &config);
                }
                EngineState::WaitingForPeers(PeerKind::Robot) => {
                    self.service(PeerKind::Ui, now);
                    self.service(PeerKind::Robot, now);
                    if config.auto_connect_robots {
                        self.accept_all(PeerKind::Robot);
                    }
                    self.announce_advertising(PeerKind::Robot, &config);
                }
                EngineState::Running => {
                    self.service(PeerKind::Ui, now);
                    self.service(PeerKind::Robot, now);
                    self.accept_local_ui(&config);
                    self.announce_advertising(PeerKind::Ui, &config);
                    self.announce_advertising(PeerKind::Robot, &config);
                    break;
                }
            }
            match self.next_state(&config) {
                Some(next) => self.set_state(next),
                None => break,
            }
        }

        if self.state == EngineState::Running {
            self.evict_silent(PeerKind::Robot, now, config.disconnect_timeout());
        }
        if self.state != EngineState::Stopped {
            if let Some(timeout) = config.ui_disconnect_timeout() {
                self.evict_silent(PeerKind::Ui, now, timeout);
            }
            if let Some(interval) = config.ping_interval() {
                self.ping_ui(now, interval);
            }
        }

        self.publish_events();
        Ok(())
    }

    fn apply_commands(&mut self) {
        for cmd in self.mailbox.drain() {
            self.stats.commands_applied += 1;
            log::debug!("Applying command {:?}", cmd);
            let result = match cmd {
                EngineCommand::Connect(kind, peer_id) => {
                    self.connect_to_peer(kind, peer_id);
                    Ok(())
                }
                EngineCommand::Disconnect(kind, peer_id) => {
                    self.disconnect_from_peer(kind, peer_id);
                    Ok(())
                }
                EngineCommand::Start => self.start(),
                EngineCommand::Reinitialize => self.reinitialize(),
            };
            if let Err(e) = result {
                log::warn!("Command {:?} failed: {}", cmd, e);
            }
        }
    }

    fn next_state(&self, config: &EngineConfig) -> Option<EngineState> {
        match self.state {
            EngineState::WaitingForPeers(PeerKind::Ui)
                if self.active_count(PeerKind::Ui) >= config.min_ui_devices =>
            {
                Some(if self.role.accepts_robots {
                    EngineState::WaitingForPeers(PeerKind::Robot)
                } else {
                    EngineState::Running
                })
            }
            EngineState::WaitingForPeers(PeerKind::Robot)
                if self.active_count(PeerKind::Robot) >= config.min_robots =>
            {
                Some(EngineState::Running)
            }
            _ => None,
        }
    }

    fn active_count(&self, kind: PeerKind) -> usize {
        self.sides[slot(kind)]
            .as_ref()
            .map(|s| s.channel.active_peer_ids().len())
            .unwrap_or(0)
    }

    fn set_state(&mut self, new: EngineState) {
        let old = self.state;
        if old == new {
            return;
        }
        self.state = new;
        self.stats.state_changes += 1;
        log::info!("Engine state {} -> {}", old, new);
        self.pending_events.push(EngineEvent::StateChanged { old, new });
        self.tell_ui(&Message::EngineStateChanged(EngineStateChangedPayload {
            old,
            new,
        }));
    }

    /// Update one channel (at most once per tick) and process its traffic.
    fn service(&mut self, kind: PeerKind, now: Instant) {
        let Some(side) = self.sides[slot(kind)].as_mut() else {
            return;
        };
        if side.updated {
            return;
        }
        side.updated = true;
        if let Err(e) = side.channel.update(now) {
            log::warn!("[{}] channel update failed: {}", side.channel.name(), e);
            return;
        }

        for event in side.channel.drain_events() {
            match event {
                ChannelEvent::Disconnected { peer_id, reason } => {
                    self.stats.transport_evictions += 1;
                    self.remove_peer(kind, peer_id, reason);
                }
                ChannelEvent::ConnectionRequest { address } => {
                    log::debug!("Pending {} connection from {}", kind, address);
                }
                ChannelEvent::Connected { peer_id } => {
                    self.on_connected(kind, peer_id, now);
                }
                ChannelEvent::ConnectFailed { peer_id, address } => {
                    log::warn!("Connect to {} {} at {} failed", kind, peer_id, address);
                    self.publish_connected(kind, peer_id, false);
                }
            }
        }

        self.resolve_incoming(kind, now);
        self.process_inbound(kind, now);
    }

    fn process_inbound(&mut self, kind: PeerKind, now: Instant) {
        let clock_ms = self.clock_ms(now);
        let mut ctx = EngineContext::new(kind, now, clock_ms);
        let Some(side) = self.sides[slot(kind)].as_mut() else {
            return;
        };
        for peer_id in side.channel.active_peer_ids() {
            let delivered = side
                .handler
                .process_inbound(&mut side.channel, peer_id, &self.dispatch, &mut ctx);
            self.stats.messages_delivered += delivered as u64;
            // Any bytes from the peer prove it is alive, handled or not.
            if let Some(heard) = side.channel.last_received(peer_id) {
                let record = side
                    .peers
                    .entry(peer_id)
                    .or_insert_with(|| PeerRecord::new(now));
                record.last_message = record.last_message.max(heard);
            }
        }

        for (peer_id, rtt) in ctx.round_trips {
            if let Some(record) = side.peers.get_mut(&peer_id) {
                record.last_rtt_ms = Some(rtt);
            }
        }
        for peer_id in ctx.synced {
            if let Some(record) = side.peers.get_mut(&peer_id) {
                if !record.synced {
                    record.synced = true;
                    log::info!("Robot {} completed time sync", peer_id);
                    self.pending_events
                        .push(EngineEvent::HandshakeComplete { peer_id });
                }
            }
        }
        for (peer_id, msg) in ctx.replies {
            if let Err(e) =
                side.handler
                    .send_message(&mut side.channel, peer_id, &msg, true, &self.dispatch)
            {
                log::warn!("Reply {} to {} {} failed: {}", msg.name(), kind, peer_id, e);
            }
        }
        self.pending_events.extend(ctx.events);
    }

    /// Bind listener connections to advertising peers by host, and refuse
    /// those nobody claims within the staleness window.
    fn resolve_incoming(&mut self, kind: PeerKind, now: Instant) {
        let Some(side) = self.sides[slot(kind)].as_mut() else {
            return;
        };
        let staleness = side.channel.config().staleness;
        let mut accepted = Vec::new();
        for (address, since) in side.channel.pending_requests() {
            let claimant = side
                .channel
                .registry()
                .records()
                .find(|r| r.address.host == address.host)
                .map(|r| r.peer_id);
            match claimant {
                Some(peer_id) if side.channel.accept_incoming(&address, peer_id) => {
                    accepted.push(peer_id);
                }
                _ if now.saturating_duration_since(since) >= staleness => {
                    log::warn!("Refusing unclaimed {} connection from {}", kind, address);
                    side.channel.refuse_incoming(&address);
                }
                _ => {}
            }
        }
        for peer_id in accepted {
            self.on_connected(kind, peer_id, now);
        }
    }

    fn accept_local_ui(&mut self, config: &EngineConfig) {
        let Some(local) = config.local_ui_peer_id else {
            return;
        };
        let advertising = self.sides[slot(PeerKind::Ui)]
            .as_ref()
            .is_some_and(|s| s.channel.advertisement(local).is_some());
        if advertising {
            self.connect_to_peer(PeerKind::Ui, local);
        }
    }

    fn accept_all(&mut self, kind: PeerKind) {
        for peer_id in self.list_advertising_peers(kind) {
            self.connect_to_peer(kind, peer_id);
        }
    }

    /// Announce each newly advertising peer once per appearance.
    fn announce_advertising(&mut self, kind: PeerKind, config: &EngineConfig) {
        let Some(side) = self.sides[slot(kind)].as_mut() else {
            return;
        };
        let advertising: BTreeSet<PeerId> =
            side.channel.advertising_peer_ids().into_iter().collect();
        side.announced.retain(|id| advertising.contains(id));
        let fresh: Vec<PeerId> = advertising
            .into_iter()
            .filter(|id| !(kind == PeerKind::Ui && config.local_ui_peer_id == Some(*id)))
            .filter(|id| side.announced.insert(*id))
            .collect();
        for peer_id in fresh {
            log::debug!("{} {} is advertising", kind, peer_id);
            self.pending_events
                .push(EngineEvent::PeerAvailable { kind, peer_id });
            self.tell_ui(&Message::PeerAvailable(PeerAvailablePayload { peer_id, kind }));
        }
    }

    fn evict_silent(&mut self, kind: PeerKind, now: Instant, timeout: Duration) {
        let Some(side) = self.sides[slot(kind)].as_mut() else {
            return;
        };
        let silent: Vec<PeerId> = side
            .peers
            .iter()
            .filter(|(_, r)| now.saturating_duration_since(r.last_message) > timeout)
            .map(|(id, _)| *id)
            .collect();
        for peer_id in &silent {
            side.channel.evict(*peer_id);
        }
        for peer_id in silent {
            log::warn!(
                "{} {} silent for more than {:?}, disconnecting",
                kind,
                peer_id,
                timeout
            );
            self.stats.silence_evictions += 1;
            self.remove_peer(kind, peer_id, DisconnectReason::Timeout);
        }
    }

    fn ping_ui(&mut self, now: Instant, interval: Duration) {
        if self
            .last_ping
            .is_some_and(|last| now.saturating_duration_since(last) < interval)
        {
            return;
        }
        if self.active_count(PeerKind::Ui) == 0 {
            return;
        }
        self.last_ping = Some(now);
        let ping = Message::Ping(PingPayload {
            counter: self.ping_counter,
            time_sent_ms: self.clock_ms(now),
            is_response: false,
        });
        self.ping_counter = self.ping_counter.wrapping_add(1);
        self.tell_ui(&ping);
    }

    fn clock_ms(&self, now: Instant) -> f64 {
        self.epoch
            .map(|e| now.saturating_duration_since(e).as_micros() as f64 / 1000.0)
            .unwrap_or(0.0)
    }

    // -----------------------------------------------------------------------
    // Peers
    // -----------------------------------------------------------------------

    fn on_connected(&mut self, kind: PeerKind, peer_id: PeerId, now: Instant) {
        if let Some(side) = self.sides[slot(kind)].as_mut() {
            side.peers.insert(peer_id, PeerRecord::new(now));
            side.handler.forget_peer(peer_id);
            side.announced.remove(&peer_id);
        }
        log::info!("{} {} connected", kind, peer_id);
        self.publish_connected(kind, peer_id, true);

        if kind == PeerKind::Robot {
            let sync = Message::SyncTime(SyncTimePayload {
                peer_id,
                timestamp_ms: self.clock_ms(now) as u32,
            });
            if let Err(e) = self.send_message(kind, peer_id, &sync) {
                log::warn!("Time sync to robot {} failed: {}", peer_id, e);
            }
        }
    }

    fn publish_connected(&mut self, kind: PeerKind, peer_id: PeerId, success: bool) {
        self.pending_events.push(EngineEvent::PeerConnected {
            kind,
            peer_id,
            success,
        });
        self.tell_ui(&Message::PeerConnected(PeerConnectedPayload {
            peer_id,
            kind,
            success,
        }));
    }

    fn remove_peer(&mut self, kind: PeerKind, peer_id: PeerId, reason: DisconnectReason) {
        if let Some(side) = self.sides[slot(kind)].as_mut() {
            side.peers.remove(&peer_id);
            side.handler.forget_peer(peer_id);
        }
        log::info!("{} {} disconnected ({})", kind, peer_id, reason);
        self.pending_events.push(EngineEvent::PeerDisconnected {
            kind,
            peer_id,
            reason,
        });
        self.tell_ui(&Message::PeerDisconnected(PeerDisconnectedPayload {
            peer_id,
            kind,
            reason,
        }));
    }

    /// Send to every active UI peer, logging failures.
    fn tell_ui(&mut self, msg: &Message) {
        let Some(ui) = self.sides[slot(PeerKind::Ui)].as_mut() else {
            return;
        };
        for peer_id in ui.channel.active_peer_ids() {
            if let Err(e) =
                ui.handler
                    .send_message(&mut ui.channel, peer_id, msg, true, &self.dispatch)
            {
                log::warn!("{} to ui {} failed: {}", msg.name(), peer_id, e);
            }
        }
    }

    /// Accept an advertising peer. Already-active peers count as success.
    ///
    /// A connect that cannot complete at once is finished by later ticks,
    /// which publish `PeerConnected` with the outcome.
    pub fn connect_to_peer(&mut self, kind: PeerKind, peer_id: PeerId) -> bool {
        let Some(side) = self.sides[slot(kind)].as_mut() else {
            log::warn!("Cannot connect {} {}: no {} channel", kind, peer_id, kind);
            return false;
        };
        if side.channel.is_active(peer_id) {
            log::info!("{} {} is already connected", kind, peer_id);
            return true;
        }
        if side.channel.is_connecting(peer_id) {
            log::info!("{} {} connect already in progress", kind, peer_id);
            return true;
        }
        let now = self.last_tick.unwrap_or_else(Instant::now);
        if !side.channel.accept_advertising_at(peer_id, now) {
            self.publish_connected(kind, peer_id, false);
            return false;
        }
        if side.channel.is_active(peer_id) {
            self.on_connected(kind, peer_id, now);
        } else {
            log::debug!("{} {} connecting", kind, peer_id);
        }
        true
    }

    /// Drop an active peer, or abandon a connect in flight, on request.
    pub fn disconnect_from_peer(&mut self, kind: PeerKind, peer_id: PeerId) -> bool {
        let Some(side) = self.sides[slot(kind)].as_mut() else {
            return false;
        };
        let connecting = side.channel.is_connecting(peer_id);
        if !side.channel.evict(peer_id) {
            return false;
        }
        if connecting {
            self.publish_connected(kind, peer_id, false);
        } else {
            self.remove_peer(kind, peer_id, DisconnectReason::Requested);
        }
        true
    }

    pub fn list_advertising_peers(&self, kind: PeerKind) -> Vec<PeerId> {
        self.sides[slot(kind)]
            .as_ref()
            .map(|s| s.channel.advertising_peer_ids())
            .unwrap_or_default()
    }

    pub fn list_active_peers(&self, kind: PeerKind) -> Vec<PeerId> {
        self.sides[slot(kind)]
            .as_ref()
            .map(|s| s.channel.active_peer_ids())
            .unwrap_or_default()
    }

    pub fn peer_info(&self, kind: PeerKind, peer_id: PeerId) -> Option<PeerRecord> {
        self.sides[slot(kind)]
            .as_ref()
            .and_then(|s| s.peers.get(&peer_id).cloned())
    }

    pub fn channel(&self, kind: PeerKind) -> Option<&ConnectionChannel> {
        self.sides[slot(kind)].as_ref().map(|s| &s.channel)
    }

    pub fn handler_stats(&self, kind: PeerKind) -> Option<HandlerStats> {
        self.sides[slot(kind)].as_ref().map(|s| s.handler.stats())
    }

    pub fn send_message(
        &mut self,
        kind: PeerKind,
        peer_id: PeerId,
        msg: &Message,
    ) -> Result<(), EngineError> {
        let side = self.sides[slot(kind)]
            .as_mut()
            .ok_or(EngineError::ChannelUnavailable(kind))?;
        side.handler
            .send_message(&mut side.channel, peer_id, msg, true, &self.dispatch)?;
        Ok(())
    }

    /// Send to every active peer of `kind`; returns how many sends succeeded.
    pub fn broadcast(&mut self, kind: PeerKind, msg: &Message) -> usize {
        self.list_active_peers(kind)
            .into_iter()
            .filter(|&peer_id| match self.send_message(kind, peer_id, msg) {
                Ok(()) => true,
                Err(e) => {
                    log::warn!("Broadcast {} to {} {} failed: {}", msg.name(), kind, peer_id, e);
                    false
                }
            })
            .count()
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    fn publish_events(&mut self) {
        let events = std::mem::take(&mut self.pending_events);
        if events.is_empty() && self.subscribers.iter().all(|s| s.backlog.is_empty()) {
            return;
        }
        self.stats.events_published += events.len() as u64;

        let mut dropped = 0u64;
        self.subscribers.retain_mut(|sub| {
            sub.backlog.extend(events.iter().cloned());
            while let Some(event) = sub.backlog.pop_front() {
                match sub.tx.try_send(event) {
                    Ok(()) => {}
                    Err(TrySendError::Full(event)) => {
                        sub.backlog.push_front(event);
                        break;
                    }
                    Err(TrySendError::Disconnected(_)) => return false,
                }
            }
            let cap = sub.tx.capacity().unwrap_or(0) * BACKLOG_FACTOR;
            while sub.backlog.len() > cap {
                sub.backlog.pop_front();
                dropped += 1;
            }
            true
        });
        if dropped > 0 {
            self.stats.events_dropped += dropped;
            log::warn!("Event backlog full, dropped {} oldest events", dropped);
        }
    }
}
