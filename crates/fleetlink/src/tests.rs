// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Scenario tests for fleetlink.
//
// Channel, handler and engine behaviour end to end over the in-memory
// loopback network, with time driven by explicit `Instant`s.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::Receiver;

use crate::channel::{ChannelConfig, ChannelEvent, ConnectionChannel, ConnectionState};
use crate::config::EngineConfig;
use crate::discovery::{AdvertisementDatagram, RegistrationDatagram};
use crate::dispatch::{DispatchError, Priority};
use crate::engine::{builtin_dispatch, standard_dispatch, EngineEvent, EngineOrchestrator, EngineRole};
use crate::framing::encode_frame;
use crate::protocol::*;
use crate::transport::loopback::LoopbackNet;
use crate::transport::{LinkKind, TransportAddress};
use crate::types::{DisconnectReason, EngineState, PeerId, PeerKind};

fn robot_discovery() -> TransportAddress {
    TransportAddress::new("127.0.0.1", 5100)
}

fn ui_discovery() -> TransportAddress {
    TransportAddress::new("127.0.0.1", 5103)
}

fn advert(peer_id: PeerId, addr: &TransportAddress) -> Vec<u8> {
    AdvertisementDatagram {
        port: addr.port,
        ip: addr.host.clone(),
        peer_id,
    }
    .encode()
    .unwrap()
}

fn robot_channel(net: &LoopbackNet, config: ChannelConfig) -> ConnectionChannel {
    let mut channel = ConnectionChannel::new(config, Arc::new(net.clone()));
    channel.start().unwrap();
    channel
}

fn decode_all(payloads: Vec<Vec<u8>>) -> Vec<Message> {
    payloads
        .iter()
        .map(|p| Message::decode(p).unwrap().0)
        .collect()
}

fn state_update(peer_id: PeerId) -> Message {
    Message::StateUpdate(StateUpdatePayload {
        peer_id,
        timestamp_ms: 1234,
        pose_x: 1.5,
        pose_y: -2.0,
        heading_rad: 0.25,
        battery_mv: 11800,
        status_flags: 0x3,
    })
}

/// Host engine over a loopback network, started, with a subscriber.
struct Station {
    net: LoopbackNet,
    engine: EngineOrchestrator,
    events: Receiver<EngineEvent>,
    t0: Instant,
}

impl Station {
    fn new(config: EngineConfig) -> Self {
        let net = LoopbackNet::new();
        let mut engine = EngineOrchestrator::new(
            EngineRole::host(),
            Arc::new(net.clone()),
            standard_dispatch().unwrap(),
        );
        engine.init(config).unwrap();
        let events = engine.subscribe();
        engine.start().unwrap();
        Self {
            net,
            engine,
            events,
            t0: Instant::now(),
        }
    }

    /// Robots only: no UI devices required.
    fn robots_only() -> Self {
        Self::new(EngineConfig {
            min_ui_devices: 0,
            ..Default::default()
        })
    }

    fn at(&self, ms: u64) -> Instant {
        self.t0 + Duration::from_millis(ms)
    }

    fn tick(&mut self, ms: u64) {
        let now = self.at(ms);
        self.engine.update(now).unwrap();
    }

    fn advertise(&self, kind: PeerKind, peer_id: PeerId, addr: &TransportAddress) {
        self.net.add_peer(addr);
        let to = match kind {
            PeerKind::Robot => robot_discovery(),
            PeerKind::Ui => ui_discovery(),
        };
        self.net.inject_datagram(&to, addr, &advert(peer_id, addr));
    }

    fn events(&self) -> Vec<EngineEvent> {
        self.events.try_iter().collect()
    }

    /// Robot 7 at 10.0.0.5:5551, connected, engine in Running.
    fn with_running_robot() -> (Self, TransportAddress) {
        let mut st = Self::robots_only();
        let robot = TransportAddress::new("10.0.0.5", 5551);
        st.advertise(PeerKind::Robot, 7, &robot);
        st.tick(0);
        assert!(st.engine.connect_to_peer(PeerKind::Robot, 7));
        st.tick(30);
        assert_eq!(st.engine.state(), EngineState::Running);
        st.net.take_sent(&robot);
        st.events();
        (st, robot)
    }
}

// -----------------------------------------------------------------------
// 1. Discovery to active: advertise, list, accept
// -----------------------------------------------------------------------
#[test]
fn test_discovery_to_active() {
    let net = LoopbackNet::new();
    let mut channel = robot_channel(&net, ChannelConfig::new("robots", "127.0.0.1", 5100));
    let robot = TransportAddress::new("10.0.0.5", 5551);
    net.add_peer(&robot);
    net.inject_datagram(&robot_discovery(), &robot, &advert(7, &robot));

    channel.update(Instant::now()).unwrap();
    assert_eq!(channel.advertising_peer_ids(), vec![7]);
    assert_eq!(channel.connection_state(7), Some(ConnectionState::Advertising));

    assert!(channel.accept_advertising(7));
    assert_eq!(channel.active_peer_ids(), vec![7]);
    assert!(channel.advertising_peer_ids().is_empty());
    assert_eq!(channel.connection_state(7), Some(ConnectionState::Active));
    assert!(net.is_connected(&robot));
    assert_eq!(net.link_kind(&robot), Some(LinkKind::Stream));
}

// -----------------------------------------------------------------------
// 2. Discovery to active through the engine control surface
// -----------------------------------------------------------------------
#[test]
fn test_engine_lists_and_connects_peers() {
    let mut st = Station::robots_only();
    let robot = TransportAddress::new("10.0.0.5", 5551);
    st.advertise(PeerKind::Robot, 7, &robot);
    st.tick(0);

    assert_eq!(st.engine.list_advertising_peers(PeerKind::Robot), vec![7]);
    assert!(st.engine.connect_to_peer(PeerKind::Robot, 7));
    assert_eq!(st.engine.list_active_peers(PeerKind::Robot), vec![7]);
    assert!(st.engine.list_advertising_peers(PeerKind::Robot).is_empty());
    // Already active counts as success.
    assert!(st.engine.connect_to_peer(PeerKind::Robot, 7));
    // Not advertising.
    assert!(!st.engine.connect_to_peer(PeerKind::Robot, 8));

    st.tick(30);
    let events = st.events();
    assert!(events.contains(&EngineEvent::PeerAvailable {
        kind: PeerKind::Robot,
        peer_id: 7
    }));
    assert!(events.contains(&EngineEvent::PeerConnected {
        kind: PeerKind::Robot,
        peer_id: 7,
        success: true
    }));
    assert!(events.contains(&EngineEvent::PeerConnected {
        kind: PeerKind::Robot,
        peer_id: 8,
        success: false
    }));

    // Accepting a robot starts the time-sync handshake.
    let sent = decode_all(st.net.take_sent(&robot));
    assert!(matches!(
        sent.as_slice(),
        [Message::SyncTime(SyncTimePayload { peer_id: 7, .. })]
    ));
}

// -----------------------------------------------------------------------
// 3. At most one active connection per peer
// -----------------------------------------------------------------------
#[test]
fn test_accept_twice_keeps_one_connection() {
    let net = LoopbackNet::new();
    let mut channel = robot_channel(&net, ChannelConfig::new("robots", "127.0.0.1", 5100));
    let robot = TransportAddress::new("10.0.0.5", 5551);
    net.add_peer(&robot);
    net.inject_datagram(&robot_discovery(), &robot, &advert(7, &robot));
    channel.update(Instant::now()).unwrap();

    assert!(channel.accept_advertising(7));
    assert!(!channel.accept_advertising(7));
    assert_eq!(channel.active_peer_ids(), vec![7]);
    assert!(net.is_connected(&robot));

    // A re-advertisement from a connected peer is ignored.
    net.inject_datagram(&robot_discovery(), &robot, &advert(7, &robot));
    channel.update(Instant::now()).unwrap();
    assert!(channel.advertising_peer_ids().is_empty());
    assert!(!channel.accept_advertising(7));
    assert_eq!(channel.active_peer_ids(), vec![7]);
}

// -----------------------------------------------------------------------
// 4. Accept failures leave state untouched
// -----------------------------------------------------------------------
#[test]
fn test_accept_unreachable_or_bad_address() {
    let net = LoopbackNet::new();
    let mut channel = robot_channel(&net, ChannelConfig::new("robots", "127.0.0.1", 5100));
    let unreachable = TransportAddress::new("10.0.0.6", 5551);
    net.inject_datagram(&robot_discovery(), &unreachable, &advert(3, &unreachable));
    let named = TransportAddress::new("robot.local", 5551);
    net.inject_datagram(&robot_discovery(), &named, &advert(4, &named));
    channel.update(Instant::now()).unwrap();

    assert_eq!(channel.advertising_peer_ids(), vec![3, 4]);
    assert!(!channel.accept_advertising(3));
    assert!(!channel.accept_advertising(4));
    assert!(!channel.accept_advertising(5));
    assert_eq!(channel.advertising_peer_ids(), vec![3, 4]);
    assert!(channel.active_peer_ids().is_empty());
    assert_eq!(channel.accept_all_advertising(), 0);
}

// -----------------------------------------------------------------------
// 5. Malformed discovery datagrams are dropped and counted
// -----------------------------------------------------------------------
#[test]
fn test_malformed_discovery_datagram() {
    let net = LoopbackNet::new();
    let mut channel = robot_channel(&net, ChannelConfig::new("robots", "127.0.0.1", 5100));
    let from = TransportAddress::new("10.0.0.5", 5100);
    net.inject_datagram(&robot_discovery(), &from, &[1, 2, 3, 4, 5]);
    net.inject_datagram(&robot_discovery(), &from, &[0]);
    channel.update(Instant::now()).unwrap();

    let stats = channel.stats();
    assert_eq!(stats.datagrams_received, 2);
    assert_eq!(stats.datagrams_dropped, 1);
    assert!(channel.registry().is_empty());
}

// -----------------------------------------------------------------------
// 6. Staleness through channel updates
// -----------------------------------------------------------------------
#[test]
fn test_advertisement_goes_stale_between_updates() {
    let net = LoopbackNet::new();
    let mut channel = robot_channel(&net, ChannelConfig::new("robots", "127.0.0.1", 5100));
    let robot = TransportAddress::new("10.0.0.5", 5551);
    let t0 = Instant::now();
    net.inject_datagram(&robot_discovery(), &robot, &advert(7, &robot));
    channel.update(t0).unwrap();

    channel.update(t0 + Duration::from_millis(1999)).unwrap();
    assert_eq!(channel.advertising_peer_ids(), vec![7]);
    channel.update(t0 + Duration::from_millis(2000)).unwrap();
    assert!(channel.advertising_peer_ids().is_empty());
    assert!(channel.registry().is_empty());
}

// -----------------------------------------------------------------------
// 7. Force registration datagrams
// -----------------------------------------------------------------------
#[test]
fn test_registration_pins_and_withdraws() {
    let net = LoopbackNet::new();
    let mut channel = robot_channel(&net, ChannelConfig::new("robots", "127.0.0.1", 5100));
    let host = TransportAddress::new("10.0.0.99", 5100);
    let reg = RegistrationDatagram {
        peer_id: 9,
        port: 7000,
        link: LinkKind::Datagram,
        enable: true,
        ip: "10.0.0.7".into(),
    };
    let t0 = Instant::now();
    net.inject_datagram(&robot_discovery(), &host, &reg.encode().unwrap());
    channel.update(t0).unwrap();
    assert!(channel.advertisement(9).unwrap().pinned);

    // Pinned records survive the staleness sweep.
    channel.update(t0 + Duration::from_secs(10)).unwrap();
    assert_eq!(channel.advertising_peer_ids(), vec![9]);

    let withdraw = RegistrationDatagram {
        enable: false,
        ..reg.clone()
    };
    net.inject_datagram(&robot_discovery(), &host, &withdraw.encode().unwrap());
    channel.update(t0 + Duration::from_secs(11)).unwrap();
    assert!(channel.advertisement(9).is_none());

    // Register again and connect over the selected link class.
    channel.apply_registration(&reg);
    let target = TransportAddress::new("10.0.0.7", 7000);
    net.add_peer(&target);
    assert!(channel.accept_advertising(9));
    assert_eq!(net.link_kind(&target), Some(LinkKind::Datagram));
    assert_eq!(channel.stats().registrations, 2);
}

// -----------------------------------------------------------------------
// 8. Force register replaces an existing connection
// -----------------------------------------------------------------------
#[test]
fn test_force_register_replaces_connection() {
    let net = LoopbackNet::new();
    let mut channel = robot_channel(&net, ChannelConfig::new("robots", "127.0.0.1", 5100));
    let first = TransportAddress::new("10.0.0.5", 5551);
    let second = TransportAddress::new("10.0.0.6", 5551);
    net.add_peer(&first);
    net.add_peer(&second);

    channel.force_register(7, first.clone(), LinkKind::Stream).unwrap();
    channel.force_register(7, second.clone(), LinkKind::Stream).unwrap();
    assert_eq!(channel.active_peer_ids(), vec![7]);
    assert_eq!(channel.connection_info(7).unwrap().address, second);
    assert!(!net.is_connected(&first));
    assert!(channel
        .force_register(8, TransportAddress::new("10.9.9.9", 1), LinkKind::Stream)
        .is_err());
}

// -----------------------------------------------------------------------
// 9. Unknown tag inside a frame is dropped, the stream continues
// -----------------------------------------------------------------------
#[test]
fn test_unknown_tag_frame_dropped() {
    assert_eq!(
        Message::decode(&[0xFF, 0x01, 0x02]),
        Err(CodecError::UnknownTag(0xFF))
    );

    let (mut st, robot) = Station::with_running_robot();
    st.net.push_frame(&robot, &[0xFF, 0x01, 0x02]);
    st.net.push_frame(&robot, &state_update(7).encode().unwrap());
    st.tick(60);

    let stats = st.engine.handler_stats(PeerKind::Robot).unwrap();
    assert_eq!(stats.unknown_tag, 1);
    assert_eq!(stats.delivered, 1);
    assert_eq!(
        st.events(),
        vec![EngineEvent::Message {
            kind: PeerKind::Robot,
            peer_id: 7,
            message: state_update(7)
        }]
    );
}

// -----------------------------------------------------------------------
// 10. Framing resync: garbage before a frame, frame split across ticks
// -----------------------------------------------------------------------
#[test]
fn test_framing_resync_across_ticks() {
    let (mut st, robot) = Station::with_running_robot();
    let frame = encode_frame(&state_update(7).encode().unwrap()).unwrap();
    st.net.push_bytes(&robot, &[0x13, 0x37, 0x00]);
    st.net.push_bytes(&robot, &frame[..10]);
    st.tick(60);
    assert!(st.events().is_empty());

    st.net.push_bytes(&robot, &frame[10..]);
    st.tick(90);
    assert_eq!(st.events().len(), 1);

    let stats = st.engine.handler_stats(PeerKind::Robot).unwrap();
    assert_eq!(stats.resync_events, 1);
    assert_eq!(stats.bytes_discarded, 3);
    assert_eq!(stats.delivered, 1);
}

// -----------------------------------------------------------------------
// 11. Disconnect on silence: exactly one eviction and one notification
// -----------------------------------------------------------------------
#[test]
fn test_silent_robot_evicted_once() {
    let (mut st, robot) = Station::with_running_robot();

    st.tick(1000);
    st.tick(3000);
    assert_eq!(st.engine.list_active_peers(PeerKind::Robot), vec![7]);

    st.tick(3001);
    st.tick(4000);
    st.tick(5000);
    assert!(st.engine.list_active_peers(PeerKind::Robot).is_empty());
    assert!(st.engine.peer_info(PeerKind::Robot, 7).is_none());
    assert!(!st.net.is_connected(&robot));

    let disconnects: Vec<_> = st
        .events()
        .into_iter()
        .filter(|e| matches!(e, EngineEvent::PeerDisconnected { .. }))
        .collect();
    assert_eq!(
        disconnects,
        vec![EngineEvent::PeerDisconnected {
            kind: PeerKind::Robot,
            peer_id: 7,
            reason: DisconnectReason::Timeout
        }]
    );
    assert_eq!(st.engine.stats().silence_evictions, 1);
    // Running has no way back on its own.
    assert_eq!(st.engine.state(), EngineState::Running);
}

// -----------------------------------------------------------------------
// 12. Delivered messages refresh the silence timer
// -----------------------------------------------------------------------
#[test]
fn test_traffic_keeps_robot_alive() {
    let (mut st, robot) = Station::with_running_robot();
    for ms in [2000, 4000, 6000] {
        st.net.push_frame(&robot, &state_update(7).encode().unwrap());
        st.tick(ms);
    }
    assert_eq!(st.engine.list_active_peers(PeerKind::Robot), vec![7]);
    assert_eq!(
        st.engine.peer_info(PeerKind::Robot, 7).unwrap().last_message,
        st.at(6000)
    );
}

// -----------------------------------------------------------------------
// 13. State machine: Running in the tick that meets the last condition
// -----------------------------------------------------------------------
#[test]
fn test_state_machine_reaches_running_same_tick() {
    let mut st = Station::new(EngineConfig {
        min_ui_devices: 1,
        min_robots: 1,
        local_ui_peer_id: Some(1),
        auto_connect_robots: true,
        ..Default::default()
    });
    let ui = TransportAddress::new("10.0.0.9", 6000);
    let robot = TransportAddress::new("10.0.0.5", 5551);
    assert_eq!(st.engine.state(), EngineState::WaitingForPeers(PeerKind::Ui));

    st.advertise(PeerKind::Ui, 1, &ui);
    st.tick(0);
    assert_eq!(st.engine.state(), EngineState::WaitingForPeers(PeerKind::Robot));
    assert_eq!(
        st.events(),
        vec![
            EngineEvent::StateChanged {
                old: EngineState::Stopped,
                new: EngineState::WaitingForPeers(PeerKind::Ui)
            },
            EngineEvent::PeerConnected {
                kind: PeerKind::Ui,
                peer_id: 1,
                success: true
            },
            EngineEvent::StateChanged {
                old: EngineState::WaitingForPeers(PeerKind::Ui),
                new: EngineState::WaitingForPeers(PeerKind::Robot)
            },
        ]
    );

    st.advertise(PeerKind::Robot, 7, &robot);
    st.tick(33);
    assert_eq!(st.engine.state(), EngineState::Running);
    assert_eq!(
        st.events(),
        vec![
            EngineEvent::PeerConnected {
                kind: PeerKind::Robot,
                peer_id: 7,
                success: true
            },
            EngineEvent::StateChanged {
                old: EngineState::WaitingForPeers(PeerKind::Robot),
                new: EngineState::Running
            },
        ]
    );

    // The UI device is told about every transition.
    let to_ui = decode_all(st.net.take_sent(&ui));
    assert_eq!(
        to_ui.last(),
        Some(&Message::EngineStateChanged(EngineStateChangedPayload {
            old: EngineState::WaitingForPeers(PeerKind::Robot),
            new: EngineState::Running,
        }))
    );
    assert!(to_ui.contains(&Message::PeerConnected(PeerConnectedPayload {
        peer_id: 7,
        kind: PeerKind::Robot,
        success: true,
    })));
}

// -----------------------------------------------------------------------
// 14. Round trip over the message catalog
// -----------------------------------------------------------------------
#[test]
fn test_message_roundtrip_catalog() {
    let messages = vec![
        Message::Ping(PingPayload {
            counter: u32::MAX,
            time_sent_ms: 1.0e9,
            is_response: true,
        }),
        Message::PeerAvailable(PeerAvailablePayload {
            peer_id: 2,
            kind: PeerKind::Ui,
        }),
        Message::PeerConnected(PeerConnectedPayload {
            peer_id: 3,
            kind: PeerKind::Robot,
            success: false,
        }),
        Message::PeerDisconnected(PeerDisconnectedPayload {
            peer_id: 4,
            kind: PeerKind::Robot,
            reason: DisconnectReason::Shutdown,
        }),
        state_update(5),
        Message::ImageChunk(ImageChunkPayload {
            image_id: 77,
            chunk_index: 1,
            chunk_count: 3,
            data: vec![0xBE, 0xEF, 0x00, 0xFF],
        }),
        Message::GenericCommand(GenericCommandPayload {
            name: "dock".into(),
            args: vec![],
        }),
        Message::EngineStateChanged(EngineStateChangedPayload {
            old: EngineState::Stopped,
            new: EngineState::Running,
        }),
        Message::SyncTime(SyncTimePayload {
            peer_id: 6,
            timestamp_ms: 42,
        }),
        Message::SyncTimeAck(SyncTimeAckPayload { peer_id: 6 }),
    ];
    let tags: Vec<u8> = messages.iter().map(|m| m.tag()).collect();
    assert_eq!(tags, ALL_TAGS.to_vec());

    for msg in messages {
        let bytes = msg.encode().unwrap();
        assert_eq!(bytes.len(), msg.size(), "{}", msg.name());
        assert_eq!(Message::decode(&bytes).unwrap(), (msg.clone(), msg.size()));
    }
}

// -----------------------------------------------------------------------
// 15. Duplicate dispatch registration fails at build time
// -----------------------------------------------------------------------
#[test]
fn test_duplicate_dispatch_registration() {
    let err = builtin_dispatch()
        .unwrap()
        .register(TAG_PING, 14, Priority::Low, |_, _, _| {})
        .err();
    assert_eq!(err, Some(DispatchError::DuplicateTag(TAG_PING)));

    let table = standard_dispatch().unwrap();
    assert_eq!(
        table.tags(),
        vec![
            TAG_PING,
            TAG_STATE_UPDATE,
            TAG_IMAGE_CHUNK,
            TAG_GENERIC_COMMAND,
            TAG_SYNC_TIME_ACK
        ]
    );
}

// -----------------------------------------------------------------------
// 16. Size mismatch: lenient delivers, strict rejects
// -----------------------------------------------------------------------
#[test]
fn test_size_mismatch_policy() {
    let mut padded = state_update(7).encode().unwrap();
    padded.push(0xAA);

    let (mut lenient, robot) = Station::with_running_robot();
    lenient.net.push_frame(&robot, &padded);
    lenient.tick(60);
    assert_eq!(lenient.events().len(), 1);
    let stats = lenient.engine.handler_stats(PeerKind::Robot).unwrap();
    assert_eq!((stats.size_mismatches, stats.rejected), (1, 0));

    let mut strict = Station::new(EngineConfig {
        min_ui_devices: 0,
        strict_size_check: true,
        ..Default::default()
    });
    strict.advertise(PeerKind::Robot, 7, &robot);
    strict.tick(0);
    assert!(strict.engine.connect_to_peer(PeerKind::Robot, 7));
    strict.tick(30);
    strict.events();
    strict.net.push_frame(&robot, &padded);
    strict.tick(60);
    assert!(strict.events().is_empty());
    let stats = strict.engine.handler_stats(PeerKind::Robot).unwrap();
    assert_eq!((stats.size_mismatches, stats.rejected), (1, 1));
}

// -----------------------------------------------------------------------
// 17. Transport failure: eviction on the next update, one signal
// -----------------------------------------------------------------------
#[test]
fn test_transport_error_evicts_on_next_update() {
    let net = LoopbackNet::new();
    let mut channel = robot_channel(&net, ChannelConfig::new("robots", "127.0.0.1", 5100));
    let robot = TransportAddress::new("10.0.0.5", 5551);
    net.add_peer(&robot);
    channel.force_register(7, robot.clone(), LinkKind::Stream).unwrap();

    // Bytes read before the failure can still be drained.
    net.push_frame(&robot, &[TAG_SYNC_TIME_ACK, 7]);
    let t0 = Instant::now();
    channel.update(t0).unwrap();
    net.break_link(&robot);
    channel.update(t0).unwrap();
    assert!(!channel.is_active(7));
    assert_eq!(channel.connection_state(7), Some(ConnectionState::Evicted));
    assert!(channel.drain_events().is_empty());
    assert!(channel.pop_received(7).is_some());

    channel.update(t0).unwrap();
    assert_eq!(
        channel.drain_events(),
        vec![ChannelEvent::Disconnected {
            peer_id: 7,
            reason: DisconnectReason::TransportError
        }]
    );
    channel.update(t0).unwrap();
    assert!(channel.drain_events().is_empty());
    assert_eq!(channel.connection_state(7), None);
}

#[test]
fn test_engine_reports_transport_disconnect() {
    let (mut st, robot) = Station::with_running_robot();
    st.net.break_link(&robot);
    st.tick(60);
    st.tick(90);
    st.tick(120);
    let events = st.events();
    assert_eq!(
        events,
        vec![EngineEvent::PeerDisconnected {
            kind: PeerKind::Robot,
            peer_id: 7,
            reason: DisconnectReason::TransportError
        }]
    );
    assert_eq!(st.engine.stats().transport_evictions, 1);
}

// -----------------------------------------------------------------------
// 18. Send failure marks the connection evicted
// -----------------------------------------------------------------------
#[test]
fn test_send_failure_and_non_active_peer() {
    let net = LoopbackNet::new();
    let mut channel = robot_channel(&net, ChannelConfig::new("robots", "127.0.0.1", 5100));
    let robot = TransportAddress::new("10.0.0.5", 5551);
    net.add_peer(&robot);
    channel.force_register(7, robot.clone(), LinkKind::Stream).unwrap();

    assert!(channel.send(9, &[1]).is_err());
    assert!(channel.send(7, &[0u8; 256]).is_err());
    net.break_link(&robot);
    assert!(channel.send(7, &[1, 2]).is_err());
    assert!(!channel.is_active(7));
    assert!(channel.send(7, &[1, 2]).is_err());
}

// -----------------------------------------------------------------------
// 19. Send budget defers and flushes in order
// -----------------------------------------------------------------------
#[test]
fn test_send_budget_defers_to_next_update() {
    let net = LoopbackNet::new();
    let config = ChannelConfig {
        send_budget_bytes: Some(20),
        ..ChannelConfig::new("robots", "127.0.0.1", 5100)
    };
    let mut channel = robot_channel(&net, config);
    let robot = TransportAddress::new("10.0.0.5", 5551);
    net.add_peer(&robot);
    channel.force_register(7, robot.clone(), LinkKind::Stream).unwrap();

    channel.send(7, &[1; 14]).unwrap();
    channel.send(7, &[2; 14]).unwrap();
    channel.send(7, &[3; 4]).unwrap();
    assert_eq!(net.take_sent(&robot), vec![vec![1; 14]]);
    assert_eq!(channel.connection_info(7).unwrap().deferred_sends, 2);

    // Immediate sends skip the queue.
    channel.send_immediate(7, &[9; 2]).unwrap();
    assert_eq!(net.take_sent(&robot), vec![vec![9; 2]]);

    channel.update(Instant::now()).unwrap();
    assert_eq!(net.take_sent(&robot), vec![vec![2; 14], vec![3; 4]]);
    assert_eq!(channel.stats().deferred_sends, 2);
}

// -----------------------------------------------------------------------
// 20. Receive queue back-pressure keeps bytes in the link
// -----------------------------------------------------------------------
#[test]
fn test_receive_queue_back_pressure() {
    let net = LoopbackNet::new();
    let config = ChannelConfig {
        max_queued_packets: 2,
        ..ChannelConfig::new("robots", "127.0.0.1", 5100)
    };
    let mut channel = robot_channel(&net, config);
    let robot = TransportAddress::new("10.0.0.5", 5551);
    net.add_peer(&robot);
    channel.force_register(7, robot.clone(), LinkKind::Datagram).unwrap();
    for i in 0..3u8 {
        net.push_bytes(&robot, &[TAG_SYNC_TIME_ACK, i]);
    }

    let t0 = Instant::now();
    channel.update(t0).unwrap();
    assert_eq!(channel.connection_info(7).unwrap().queued_packets, 2);

    let mut drained = Vec::new();
    while let Some(packet) = channel.pop_received(7) {
        drained.push(packet.payload);
    }
    channel.update(t0).unwrap();
    while let Some(packet) = channel.pop_received(7) {
        drained.push(packet.payload);
    }
    assert_eq!(
        drained,
        vec![
            vec![TAG_SYNC_TIME_ACK, 0],
            vec![TAG_SYNC_TIME_ACK, 1],
            vec![TAG_SYNC_TIME_ACK, 2]
        ]
    );
}

// -----------------------------------------------------------------------
// 21. Incoming connections: claimed by host, refused when unclaimed
// -----------------------------------------------------------------------
#[test]
fn test_incoming_connection_requests() {
    let mut st = Station::new(EngineConfig {
        min_ui_devices: 0,
        robot_listen_port: Some(5600),
        ..Default::default()
    });
    let listener = TransportAddress::new("127.0.0.1", 5600);
    let robot = TransportAddress::new("10.0.0.5", 5551);
    let dialer = TransportAddress::new("10.0.0.5", 40000);
    let stranger = TransportAddress::new("10.0.0.99", 40001);

    st.net.inject_datagram(&robot_discovery(), &robot, &advert(7, &robot));
    st.net.dial_in(&listener, &dialer);
    st.net.dial_in(&listener, &stranger);
    st.tick(0);

    assert_eq!(st.engine.state(), EngineState::Running);
    assert_eq!(st.engine.list_active_peers(PeerKind::Robot), vec![7]);
    let channel = st.engine.channel(PeerKind::Robot).unwrap();
    assert_eq!(channel.connection_info(7).unwrap().address, dialer);
    assert_eq!(channel.pending_requests().len(), 1);

    st.net.push_frame(&dialer, &state_update(7).encode().unwrap());
    st.tick(1000);
    st.tick(2000);
    assert!(st.engine.channel(PeerKind::Robot).unwrap().pending_requests().is_empty());
    assert!(!st.net.is_connected(&stranger));
    assert!(st.events().contains(&EngineEvent::Message {
        kind: PeerKind::Robot,
        peer_id: 7,
        message: state_update(7)
    }));
}

// -----------------------------------------------------------------------
// 22. Commands from another thread are applied on the next tick
// -----------------------------------------------------------------------
#[test]
fn test_engine_handle_across_threads() {
    let mut st = Station::robots_only();
    let robot = TransportAddress::new("10.0.0.5", 5551);
    st.advertise(PeerKind::Robot, 7, &robot);
    st.tick(0);

    let handle = st.engine.handle();
    std::thread::spawn(move || {
        assert!(handle.connect(PeerKind::Robot, 7));
    })
    .join()
    .unwrap();

    st.tick(30);
    assert_eq!(st.engine.list_active_peers(PeerKind::Robot), vec![7]);
    assert_eq!(st.engine.state(), EngineState::Running);

    let handle = st.engine.handle();
    assert!(handle.disconnect(PeerKind::Robot, 7));
    st.tick(60);
    assert!(st.engine.list_active_peers(PeerKind::Robot).is_empty());
    assert!(st.events().contains(&EngineEvent::PeerDisconnected {
        kind: PeerKind::Robot,
        peer_id: 7,
        reason: DisconnectReason::Requested
    }));
    assert_eq!(st.engine.stats().commands_applied, 2);
}

// -----------------------------------------------------------------------
// 23. Event backlog preserves order when the channel is full
// -----------------------------------------------------------------------
#[test]
fn test_event_backlog_in_order() {
    let mut st = Station::new(EngineConfig {
        min_ui_devices: 0,
        event_channel_capacity: 1,
        ..Default::default()
    });
    st.tick(0);
    let first: Vec<_> = st.events();
    assert_eq!(
        first,
        vec![EngineEvent::StateChanged {
            old: EngineState::Stopped,
            new: EngineState::WaitingForPeers(PeerKind::Ui)
        }]
    );

    st.tick(30);
    assert_eq!(
        st.events(),
        vec![EngineEvent::StateChanged {
            old: EngineState::WaitingForPeers(PeerKind::Ui),
            new: EngineState::WaitingForPeers(PeerKind::Robot)
        }]
    );
    assert_eq!(st.engine.stats().events_dropped, 0);
}

// -----------------------------------------------------------------------
// 24. Late ticks are counted but still processed
// -----------------------------------------------------------------------
#[test]
fn test_late_tick_counted() {
    let mut st = Station::robots_only();
    st.tick(0);
    st.tick(33);
    st.tick(66);
    assert_eq!(st.engine.stats().late_ticks, 0);
    st.tick(100);
    assert_eq!(st.engine.stats().late_ticks, 1);
    assert_eq!(st.engine.stats().ticks, 4);

    // Slack widens the window beyond one period.
    let mut relaxed = Station::new(EngineConfig {
        min_ui_devices: 0,
        late_tick_slack_ms: 15,
        ..Default::default()
    });
    relaxed.tick(0);
    relaxed.tick(48);
    assert_eq!(relaxed.engine.stats().late_ticks, 0);
    relaxed.tick(97);
    assert_eq!(relaxed.engine.stats().late_ticks, 1);
}

// -----------------------------------------------------------------------
// 25. Re-initialization drops peers and waits again
// -----------------------------------------------------------------------
#[test]
fn test_reinitialize_resets_to_waiting() {
    let (mut st, robot) = Station::with_running_robot();
    st.engine.reinitialize().unwrap();
    assert_eq!(st.engine.state(), EngineState::WaitingForPeers(PeerKind::Ui));
    assert!(st.engine.list_active_peers(PeerKind::Robot).is_empty());
    assert!(!st.net.is_connected(&robot));

    st.tick(60);
    assert_eq!(
        st.events(),
        vec![
            EngineEvent::PeerDisconnected {
                kind: PeerKind::Robot,
                peer_id: 7,
                reason: DisconnectReason::Shutdown
            },
            EngineEvent::StateChanged {
                old: EngineState::Running,
                new: EngineState::Stopped
            },
            EngineEvent::StateChanged {
                old: EngineState::Stopped,
                new: EngineState::WaitingForPeers(PeerKind::Ui)
            },
            EngineEvent::StateChanged {
                old: EngineState::WaitingForPeers(PeerKind::Ui),
                new: EngineState::WaitingForPeers(PeerKind::Robot)
            },
        ]
    );
    assert!(matches!(
        st.engine.start(),
        Ok(())
    ));
}

// -----------------------------------------------------------------------
// 26. UI keepalive: pings out, echoes back, round-trip recorded
// -----------------------------------------------------------------------
#[test]
fn test_ui_keepalive_pings() {
    let mut st = Station::new(EngineConfig {
        local_ui_peer_id: Some(1),
        ..Default::default()
    });
    let ui = TransportAddress::new("10.0.0.9", 6000);
    st.advertise(PeerKind::Ui, 1, &ui);
    st.tick(0);

    let pings: Vec<_> = decode_all(st.net.take_sent(&ui))
        .into_iter()
        .filter(|m| matches!(m, Message::Ping(_)))
        .collect();
    assert_eq!(
        pings,
        vec![Message::Ping(PingPayload {
            counter: 0,
            time_sent_ms: 0.0,
            is_response: false
        })]
    );

    // The device answers ours and sends its own.
    let answer = Message::Ping(PingPayload {
        counter: 0,
        time_sent_ms: 0.0,
        is_response: true,
    });
    let request = Message::Ping(PingPayload {
        counter: 5,
        time_sent_ms: 99.0,
        is_response: false,
    });
    st.net.push_frame(&ui, &answer.encode().unwrap());
    st.net.push_frame(&ui, &request.encode().unwrap());
    st.tick(25);

    let record = st.engine.peer_info(PeerKind::Ui, 1).unwrap();
    assert_eq!(record.last_rtt_ms, Some(25.0));
    assert_eq!(record.last_message, st.at(25));
    assert!(decode_all(st.net.take_sent(&ui)).contains(&Message::Ping(PingPayload {
        counter: 5,
        time_sent_ms: 99.0,
        is_response: true
    })));

    // Next keepalive only after the interval.
    st.tick(50);
    assert!(decode_all(st.net.take_sent(&ui)).is_empty());
    st.tick(1000);
    assert_eq!(
        decode_all(st.net.take_sent(&ui)),
        vec![Message::Ping(PingPayload {
            counter: 1,
            time_sent_ms: 1000.0,
            is_response: false
        })]
    );
}

// -----------------------------------------------------------------------
// 27. Time-sync handshake completes on acknowledgement
// -----------------------------------------------------------------------
#[test]
fn test_time_sync_handshake() {
    let (mut st, robot) = Station::with_running_robot();
    assert!(!st.engine.peer_info(PeerKind::Robot, 7).unwrap().synced);

    let ack = Message::SyncTimeAck(SyncTimeAckPayload { peer_id: 7 });
    st.net.push_frame(&robot, &ack.encode().unwrap());
    st.net.push_frame(&robot, &ack.encode().unwrap());
    st.tick(60);

    assert!(st.engine.peer_info(PeerKind::Robot, 7).unwrap().synced);
    assert_eq!(
        st.events(),
        vec![EngineEvent::HandshakeComplete { peer_id: 7 }]
    );
}

// -----------------------------------------------------------------------
// 28. Advertising UI devices are announced once per appearance
// -----------------------------------------------------------------------
#[test]
fn test_ui_announcements_once_per_appearance() {
    let mut st = Station::new(EngineConfig {
        local_ui_peer_id: Some(1),
        min_ui_devices: 2,
        ..Default::default()
    });
    let local = TransportAddress::new("10.0.0.9", 6000);
    let tablet = TransportAddress::new("10.0.0.10", 6000);
    st.advertise(PeerKind::Ui, 1, &local);
    st.advertise(PeerKind::Ui, 2, &tablet);
    st.tick(0);
    st.advertise(PeerKind::Ui, 2, &tablet);
    st.tick(30);

    let available = |events: &[EngineEvent]| {
        events
            .iter()
            .filter(|e| matches!(e, EngineEvent::PeerAvailable { .. }))
            .count()
    };
    assert_eq!(available(&st.events()), 1);
    let told = decode_all(st.net.take_sent(&local));
    assert_eq!(
        told.iter()
            .filter(|m| **m
                == Message::PeerAvailable(PeerAvailablePayload {
                    peer_id: 2,
                    kind: PeerKind::Ui
                }))
            .count(),
        1
    );

    // Gone stale, then back: announced again.
    st.tick(2030);
    st.advertise(PeerKind::Ui, 2, &tablet);
    st.tick(2060);
    assert_eq!(available(&st.events()), 1);
    assert_eq!(st.engine.state(), EngineState::WaitingForPeers(PeerKind::Ui));
}

// -----------------------------------------------------------------------
// 29. Presence re-announcement on the discovery socket
// -----------------------------------------------------------------------
#[test]
fn test_presence_announcement_interval() {
    let net = LoopbackNet::new();
    let target = TransportAddress::new("10.0.0.255", 5100);
    let config = ChannelConfig {
        listen_port: Some(5600),
        local_peer_id: 42,
        announce_to: Some(target.clone()),
        announce_interval_updates: 3,
        ..ChannelConfig::new("robots", "127.0.0.1", 5100)
    };
    let mut channel = robot_channel(&net, config);
    let t0 = Instant::now();
    for _ in 0..7 {
        channel.update(t0).unwrap();
    }

    let sent = net.sent_datagrams();
    assert_eq!(sent.len(), 3);
    let (to, bytes) = &sent[0];
    assert_eq!(to, &target);
    assert_eq!(
        AdvertisementDatagram::decode(bytes).unwrap(),
        AdvertisementDatagram {
            port: 5600,
            ip: "127.0.0.1".into(),
            peer_id: 42
        }
    );
    assert_eq!(channel.stats().announcements, 3);
}

// -----------------------------------------------------------------------
// 30. Engine init fails cleanly when a port is taken
// -----------------------------------------------------------------------
#[test]
fn test_init_bind_failure() {
    let net = LoopbackNet::new();
    net.occupy(&ui_discovery());
    let mut engine = EngineOrchestrator::new(
        EngineRole::host(),
        Arc::new(net.clone()),
        standard_dispatch().unwrap(),
    );
    assert!(matches!(
        engine.init(EngineConfig::default()),
        Err(crate::engine::EngineError::Transport(_))
    ));
    assert!(!engine.is_initialized());

    // Robot-only roles never touch the UI port.
    let mut client = EngineOrchestrator::new(
        EngineRole::client(),
        Arc::new(net),
        standard_dispatch().unwrap(),
    );
    client.init(EngineConfig::default()).unwrap();
    client.start().unwrap();
    assert_eq!(client.state(), EngineState::WaitingForPeers(PeerKind::Robot));
}

// -----------------------------------------------------------------------
// 31. Shutdown closes everything and allows a fresh init
// -----------------------------------------------------------------------
#[test]
fn test_shutdown_then_init_again() {
    let (mut st, robot) = Station::with_running_robot();
    st.engine.shutdown();
    assert_eq!(st.engine.state(), EngineState::Stopped);
    assert!(!st.engine.is_initialized());
    assert!(!st.net.is_connected(&robot));
    assert!(st.events().contains(&EngineEvent::PeerDisconnected {
        kind: PeerKind::Robot,
        peer_id: 7,
        reason: DisconnectReason::Shutdown
    }));
    assert!(st.engine.update(st.at(100)).is_err());

    st.engine.init(EngineConfig::default()).unwrap();
    st.engine.start().unwrap();
    assert!(matches!(
        st.engine.start(),
        Ok(())
    ));
}

// -----------------------------------------------------------------------
// 32. A connect that cannot complete times out without stalling ticks
// -----------------------------------------------------------------------
#[test]
fn test_pending_connect_times_out() {
    let mut st = Station::robots_only();
    let robot = TransportAddress::new("10.0.0.5", 5551);
    st.advertise(PeerKind::Robot, 7, &robot);
    st.net.hold_connect(&robot);
    st.tick(0);

    assert!(st.engine.connect_to_peer(PeerKind::Robot, 7));
    let channel = st.engine.channel(PeerKind::Robot).unwrap();
    assert_eq!(channel.connection_state(7), Some(ConnectionState::Connecting));
    assert!(st.engine.list_active_peers(PeerKind::Robot).is_empty());
    // A second request while in flight is not a new attempt.
    assert!(st.engine.connect_to_peer(PeerKind::Robot, 7));

    st.tick(30);
    st.tick(4990);
    assert!(!st
        .events()
        .iter()
        .any(|e| matches!(e, EngineEvent::PeerConnected { .. })));
    assert_eq!(
        st.engine.state(),
        EngineState::WaitingForPeers(PeerKind::Robot)
    );

    st.tick(5000);
    assert!(st.events().contains(&EngineEvent::PeerConnected {
        kind: PeerKind::Robot,
        peer_id: 7,
        success: false
    }));
    let channel = st.engine.channel(PeerKind::Robot).unwrap();
    assert_eq!(channel.connection_state(7), None);
    assert_eq!(channel.stats().connect_failures, 1);
    assert!(!st.net.is_connected(&robot));
    assert!(st.net.take_sent(&robot).is_empty());
}

// -----------------------------------------------------------------------
// 33. A connect completed by a later tick starts the handshake then
// -----------------------------------------------------------------------
#[test]
fn test_pending_connect_completes_on_later_tick() {
    let mut st = Station::robots_only();
    let robot = TransportAddress::new("10.0.0.5", 5551);
    st.advertise(PeerKind::Robot, 7, &robot);
    st.net.hold_connect(&robot);
    st.tick(0);
    assert!(st.engine.connect_to_peer(PeerKind::Robot, 7));

    st.tick(30);
    assert!(st.net.take_sent(&robot).is_empty());
    assert!(st.engine.peer_info(PeerKind::Robot, 7).is_none());

    st.net.release_connect(&robot);
    st.tick(60);
    assert_eq!(st.engine.list_active_peers(PeerKind::Robot), vec![7]);
    assert_eq!(st.engine.state(), EngineState::Running);
    assert_eq!(
        st.engine.peer_info(PeerKind::Robot, 7).unwrap().connected_at,
        st.at(60)
    );
    assert!(st.events().contains(&EngineEvent::PeerConnected {
        kind: PeerKind::Robot,
        peer_id: 7,
        success: true
    }));
    let sent = decode_all(st.net.take_sent(&robot));
    assert!(matches!(
        sent.as_slice(),
        [Message::SyncTime(SyncTimePayload { peer_id: 7, .. })]
    ));
}

// -----------------------------------------------------------------------
// 34. Disconnecting a peer whose connect is in flight reports failure
// -----------------------------------------------------------------------
#[test]
fn test_disconnect_abandons_pending_connect() {
    let mut st = Station::robots_only();
    let robot = TransportAddress::new("10.0.0.5", 5551);
    st.advertise(PeerKind::Robot, 7, &robot);
    st.net.hold_connect(&robot);
    st.tick(0);
    assert!(st.engine.connect_to_peer(PeerKind::Robot, 7));

    assert!(st.engine.disconnect_from_peer(PeerKind::Robot, 7));
    st.tick(30);
    let events = st.events();
    assert!(events.contains(&EngineEvent::PeerConnected {
        kind: PeerKind::Robot,
        peer_id: 7,
        success: false
    }));
    assert!(!events
        .iter()
        .any(|e| matches!(e, EngineEvent::PeerDisconnected { .. })));
    assert!(!st.net.is_connected(&robot));
}

// -----------------------------------------------------------------------
// 35. Unsent bytes wait for the peer; a peer that never drains is evicted
// -----------------------------------------------------------------------
#[test]
fn test_send_backlog_flushed_then_capped() {
    let net = LoopbackNet::new();
    let mut channel = robot_channel(
        &net,
        ChannelConfig {
            max_send_backlog_bytes: 64,
            ..ChannelConfig::new("robots", "127.0.0.1", 5100)
        },
    );
    let robot = TransportAddress::new("10.0.0.5", 5551);
    net.add_peer(&robot);
    channel.force_register(7, robot.clone(), LinkKind::Stream).unwrap();
    let t0 = Instant::now();

    net.stall(&robot, true);
    for i in 0..3u8 {
        channel.send(7, &[i; 14]).unwrap();
    }
    channel.update(t0).unwrap();
    assert!(net.take_sent(&robot).is_empty());
    let info = channel.connection_info(7).unwrap();
    assert_eq!(info.state, ConnectionState::Active);
    assert_eq!(info.send_backlog, 3 * 17);

    net.stall(&robot, false);
    channel.update(t0 + Duration::from_millis(33)).unwrap();
    assert_eq!(
        net.take_sent(&robot),
        vec![vec![0u8; 14], vec![1u8; 14], vec![2u8; 14]]
    );
    assert_eq!(channel.connection_info(7).unwrap().send_backlog, 0);

    net.stall(&robot, true);
    for _ in 0..5 {
        channel.send(7, &[9; 14]).unwrap();
    }
    channel.update(t0 + Duration::from_millis(66)).unwrap();
    assert_eq!(channel.connection_state(7), Some(ConnectionState::Evicted));
    channel.update(t0 + Duration::from_millis(99)).unwrap();
    assert_eq!(
        channel.drain_events(),
        vec![ChannelEvent::Disconnected {
            peer_id: 7,
            reason: DisconnectReason::TransportError
        }]
    );
}

// -----------------------------------------------------------------------
// 36. Unhandled traffic still counts as a sign of life
// -----------------------------------------------------------------------
#[test]
fn test_unhandled_traffic_keeps_robot_alive() {
    let (mut st, robot) = Station::with_running_robot();
    let unhandled = Message::PeerAvailable(PeerAvailablePayload {
        peer_id: 7,
        kind: PeerKind::Robot,
    });
    for ms in [2000, 4000, 6000] {
        st.net.push_frame(&robot, &unhandled.encode().unwrap());
        st.tick(ms);
    }
    assert_eq!(st.engine.list_active_peers(PeerKind::Robot), vec![7]);
    assert_eq!(st.engine.handler_stats(PeerKind::Robot).unwrap().unhandled, 3);
    assert_eq!(
        st.engine.peer_info(PeerKind::Robot, 7).unwrap().last_message,
        st.at(6000)
    );
    assert_eq!(st.engine.stats().silence_evictions, 0);

    st.tick(9001);
    assert!(st.engine.list_active_peers(PeerKind::Robot).is_empty());
    assert_eq!(st.engine.stats().silence_evictions, 1);
}

// -----------------------------------------------------------------------
// 37. An advertisement gone stale since the last sweep is not accepted
// -----------------------------------------------------------------------
#[test]
fn test_stale_advertisement_refused_before_sweep() {
    let net = LoopbackNet::new();
    let mut channel = robot_channel(&net, ChannelConfig::new("robots", "127.0.0.1", 5100));
    let robot = TransportAddress::new("10.0.0.5", 5551);
    net.add_peer(&robot);
    net.inject_datagram(&robot_discovery(), &robot, &advert(7, &robot));
    let t0 = Instant::now();
    channel.update(t0).unwrap();

    assert!(!channel.accept_advertising_at(7, t0 + Duration::from_millis(2000)));
    assert!(channel.active_peer_ids().is_empty());
    assert!(!net.is_connected(&robot));

    assert!(channel.accept_advertising_at(7, t0 + Duration::from_millis(1999)));
    assert_eq!(channel.active_peer_ids(), vec![7]);
}

// -----------------------------------------------------------------------
// 38. Engine connect commands judge staleness at the current tick
// -----------------------------------------------------------------------
#[test]
fn test_engine_refuses_stale_advertisement() {
    let mut st = Station::robots_only();
    let robot = TransportAddress::new("10.0.0.5", 5551);
    st.advertise(PeerKind::Robot, 7, &robot);
    st.tick(0);
    st.events();

    // Applied at the start of the tick, before the channel sweeps.
    assert!(st.engine.handle().connect(PeerKind::Robot, 7));
    st.tick(2500);
    assert!(st.events().contains(&EngineEvent::PeerConnected {
        kind: PeerKind::Robot,
        peer_id: 7,
        success: false
    }));
    assert!(st.engine.list_active_peers(PeerKind::Robot).is_empty());
    assert!(!st.net.is_connected(&robot));
}

