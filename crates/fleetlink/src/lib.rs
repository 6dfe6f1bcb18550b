// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Robot fleet networking core.
//!
//! A station discovers robots and UI devices through periodic advertisement
//! datagrams, promotes selected peers to reliable per-peer links, exchanges
//! tagged binary messages with them and drives a small lifecycle state
//! machine from a fixed-period tick.
//!
//! # Architecture
//!
//! ```text
//!  Robot / UI peer                     Station (this crate)
//!        |                                   |
//!        |--- advertisement (UDP) ---------->| AdvertisementRegistry
//!        |                                   |   accept_advertising(id)
//!        |<========= stream link ==========>| ConnectionChannel
//!        |    [BE EF len][tag fields...]     |   -> MessageHandler
//!        |                                   |     -> DispatchTable
//!        |                                   | EngineOrchestrator
//!        |                                   |   Stopped
//!        |                                   |   -> WaitingForUIDevices
//!        |                                   |   -> WaitingForRobots
//!        |                                   |   -> Running
//! ```
//!
//! # Key Features
//!
//! - **Non-blocking**: all I/O happens in `ConnectionChannel::update`, one
//!   poll-and-drain pass per tick
//! - **Resynchronizing framing**: corrupt stream bytes cost one frame, never
//!   the connection
//! - **Closed message catalog**: [`Message`] is a sum type with exact
//!   `size`/`encode`/`decode`
//! - **Observable**: connects, disconnects and state changes are published as
//!   [`EngineEvent`]s on bounded channels
//!
//! # Links
//!
//! | Link | Framing | Max message |
//! |------|---------|-------------|
//! | [`LinkKind::Stream`] (TCP) | `0xBE 0xEF len` | 255 bytes |
//! | [`LinkKind::Datagram`] (UDP) | none | 2048 bytes |

pub mod channel;
pub mod config;
pub mod discovery;
pub mod dispatch;
pub mod engine;
pub mod framing;
pub mod handler;
pub mod mailbox;
pub mod protocol;
pub mod transport;
pub mod types;

// Re-exports for convenience.
pub use channel::{
    ChannelConfig, ChannelError, ChannelEvent, ChannelStats, ConnectionChannel, ConnectionInfo,
    ConnectionState, RawPacket,
};
pub use config::{ConfigError, EngineConfig};
pub use discovery::{
    AdvertisementDatagram, AdvertisementRecord, AdvertisementRegistry, DiscoveryDatagram,
    RegistrationDatagram,
};
pub use dispatch::{DispatchEntry, DispatchError, DispatchTable, Priority, SizeCheck};
pub use engine::{
    builtin_dispatch, forward_message, standard_dispatch, EngineContext, EngineError,
    EngineEvent, EngineOrchestrator, EngineRole, EngineStats, PeerRecord,
};
pub use framing::{encode_frame, FrameDecoder, FrameError};
pub use handler::{HandlerConfig, HandlerStats, MessageHandler, SendError};
pub use mailbox::{EngineCommand, EngineHandle, Mailbox};
pub use protocol::{
    // Error
    CodecError,
    // Message
    Message,
    // Payload types
    EngineStateChangedPayload, GenericCommandPayload, ImageChunkPayload, PeerAvailablePayload,
    PeerConnectedPayload, PeerDisconnectedPayload, PingPayload, StateUpdatePayload,
    SyncTimeAckPayload, SyncTimePayload,
};
pub use transport::{Connector, LinkKind, NetConnector, TransportAddress, TransportError};
pub use types::{DisconnectReason, EngineState, PeerId, PeerKind};

#[cfg(test)]
mod tests;
