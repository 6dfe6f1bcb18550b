// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Value types shared by every layer of the comms core.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical peer identifier, assigned externally and unique within one registry.
pub type PeerId = u8;

/// Which population a peer belongs to. Robots and UI devices live in
/// separate registries, so the same [`PeerId`] may exist once per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum PeerKind {
    Robot = 0,
    Ui = 1,
}

impl PeerKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Robot),
            1 => Some(Self::Ui),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for PeerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Robot => write!(f, "robot"),
            Self::Ui => write!(f, "ui"),
        }
    }
}

/// Why a peer left the active set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DisconnectReason {
    /// No inbound message for longer than the configured timeout.
    Timeout = 0,
    /// Read or write failure on the peer's link.
    TransportError = 1,
    /// Disconnect requested through the control surface.
    Requested = 2,
    /// The engine was shut down or re-initialized.
    Shutdown = 3,
}

impl DisconnectReason {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Timeout),
            1 => Some(Self::TransportError),
            2 => Some(Self::Requested),
            3 => Some(Self::Shutdown),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::TransportError => write!(f, "transport error"),
            Self::Requested => write!(f, "requested"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Engine lifecycle state.
///
/// `WaitingForPeers(PeerKind::Ui)` is the "waiting for UI devices" phase and
/// `WaitingForPeers(PeerKind::Robot)` the "waiting for robots" phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EngineState {
    #[default]
    Stopped,
    WaitingForPeers(PeerKind),
    Running,
}

impl EngineState {
    /// Wire code used by `EngineStateChanged` messages.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Stopped => 0,
            Self::WaitingForPeers(PeerKind::Ui) => 1,
            Self::WaitingForPeers(PeerKind::Robot) => 2,
            Self::Running => 3,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Stopped),
            1 => Some(Self::WaitingForPeers(PeerKind::Ui)),
            2 => Some(Self::WaitingForPeers(PeerKind::Robot)),
            3 => Some(Self::Running),
            _ => None,
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "Stopped"),
            Self::WaitingForPeers(PeerKind::Ui) => write!(f, "WaitingForUIDevices"),
            Self::WaitingForPeers(PeerKind::Robot) => write!(f, "WaitingForRobots"),
            Self::Running => write!(f, "Running"),
        }
    }
}
