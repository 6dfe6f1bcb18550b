// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Advertisement registry and discovery datagram codecs.
//!
//! Peers that have not yet been connected broadcast an
//! [`AdvertisementDatagram`] on the discovery port. Each one refreshes an
//! [`AdvertisementRecord`]; records that go quiet for the staleness
//! threshold are swept once per tick.
//!
//! ```text
//! Advertisement (21 bytes)            Registration (23 bytes)
//! +-----------+----------+---------+  +---------+-----------+------+--------+----------+
//! | port: u16 | ip: [18] | id: u8  |  | id: u8  | port: u16 | link | enable | ip: [18] |
//! +-----------+----------+---------+  +---------+-----------+------+--------+----------+
//! ```
//!
//! IP text is NUL-terminated inside its fixed field, so at most 17
//! characters fit.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::protocol::CodecError;
use crate::transport::{LinkKind, TransportAddress};
use crate::types::PeerId;

/// Size of the fixed IP text field.
pub const IP_FIELD_LEN: usize = 18;

/// Encoded size of an [`AdvertisementDatagram`].
pub const ADVERTISEMENT_SIZE: usize = 2 + IP_FIELD_LEN + 1;

/// Encoded size of a [`RegistrationDatagram`].
pub const REGISTRATION_SIZE: usize = 1 + 2 + 1 + 1 + IP_FIELD_LEN;

/// Size of a presence keepalive datagram.
pub const KEEPALIVE_SIZE: usize = 1;

// ---------------------------------------------------------------------------
// Datagrams
// ---------------------------------------------------------------------------

/// "I am reachable at ip:port" broadcast by an advertising peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisementDatagram {
    pub port: u16,
    pub ip: String,
    pub peer_id: PeerId,
}

impl AdvertisementDatagram {
    pub fn address(&self) -> TransportAddress {
        TransportAddress::new(self.ip.clone(), self.port)
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut buf = Vec::with_capacity(ADVERTISEMENT_SIZE);
        buf.extend_from_slice(&self.port.to_le_bytes());
        write_ip(&mut buf, &self.ip)?;
        buf.push(self.peer_id);
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        check_len(buf, ADVERTISEMENT_SIZE)?;
        Ok(Self {
            port: u16::from_le_bytes([buf[0], buf[1]]),
            ip: read_ip(&buf[2..2 + IP_FIELD_LEN])?,
            peer_id: buf[2 + IP_FIELD_LEN],
        })
    }
}

/// Host-side force registration of a peer that cannot advertise itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationDatagram {
    pub peer_id: PeerId,
    pub port: u16,
    pub link: LinkKind,
    /// `true` registers the peer, `false` withdraws a registration.
    pub enable: bool,
    pub ip: String,
}

impl RegistrationDatagram {
    pub fn address(&self) -> TransportAddress {
        TransportAddress::new(self.ip.clone(), self.port)
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut buf = Vec::with_capacity(REGISTRATION_SIZE);
        buf.push(self.peer_id);
        buf.extend_from_slice(&self.port.to_le_bytes());
        buf.push(self.link.as_u8());
        buf.push(u8::from(self.enable));
        write_ip(&mut buf, &self.ip)?;
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        check_len(buf, REGISTRATION_SIZE)?;
        let link = LinkKind::from_u8(buf[3]).ok_or(CodecError::InvalidField {
            field: "link",
            value: buf[3],
        })?;
        let enable = match buf[4] {
            0 => false,
            1 => true,
            value => {
                return Err(CodecError::InvalidField {
                    field: "enable",
                    value,
                })
            }
        };
        Ok(Self {
            peer_id: buf[0],
            port: u16::from_le_bytes([buf[1], buf[2]]),
            link,
            enable,
            ip: read_ip(&buf[5..5 + IP_FIELD_LEN])?,
        })
    }
}

/// A datagram received on the discovery port, classified by length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryDatagram {
    Advertisement(AdvertisementDatagram),
    Registration(RegistrationDatagram),
    Keepalive,
}

impl DiscoveryDatagram {
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        match buf.len() {
            KEEPALIVE_SIZE => Ok(Self::Keepalive),
            ADVERTISEMENT_SIZE => AdvertisementDatagram::decode(buf).map(Self::Advertisement),
            REGISTRATION_SIZE => RegistrationDatagram::decode(buf).map(Self::Registration),
            n => Err(CodecError::ShortBuffer {
                needed: ADVERTISEMENT_SIZE,
                available: n,
            }),
        }
    }
}

fn check_len(buf: &[u8], needed: usize) -> Result<(), CodecError> {
    if buf.len() < needed {
        return Err(CodecError::ShortBuffer {
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}

fn write_ip(buf: &mut Vec<u8>, ip: &str) -> Result<(), CodecError> {
    let bytes = ip.as_bytes();
    if bytes.len() >= IP_FIELD_LEN || bytes.contains(&0) {
        return Err(CodecError::FieldTooLong {
            field: "ip",
            len: bytes.len(),
        });
    }
    buf.extend_from_slice(bytes);
    buf.resize(buf.len() + IP_FIELD_LEN - bytes.len(), 0);
    Ok(())
}

fn read_ip(field: &[u8]) -> Result<String, CodecError> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    std::str::from_utf8(&field[..end])
        .map(str::to_string)
        .map_err(|_| CodecError::InvalidUtf8("ip"))
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// A peer currently advertising availability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisementRecord {
    pub peer_id: PeerId,
    pub address: TransportAddress,
    pub link: LinkKind,
    pub last_seen: Instant,
    /// Force-registered records never go stale.
    pub pinned: bool,
}

impl AdvertisementRecord {
    /// Stale once `now - last_seen` reaches `threshold`.
    pub fn is_stale(&self, now: Instant, threshold: Duration) -> bool {
        !self.pinned && now.saturating_duration_since(self.last_seen) >= threshold
    }
}

/// Peers currently broadcasting availability, keyed by [`PeerId`].
#[derive(Debug)]
pub struct AdvertisementRegistry {
    records: BTreeMap<PeerId, AdvertisementRecord>,
    staleness: Duration,
}

impl AdvertisementRegistry {
    pub fn new(staleness: Duration) -> Self {
        Self {
            records: BTreeMap::new(),
            staleness,
        }
    }

    pub fn staleness(&self) -> Duration {
        self.staleness
    }

    /// Insert or refresh the record for `peer_id`.
    ///
    /// A refresh keeps the pinned flag of an existing record.
    pub fn observe(&mut self, peer_id: PeerId, address: TransportAddress, link: LinkKind, now: Instant) {
        match self.records.get_mut(&peer_id) {
            Some(rec) => {
                if rec.address != address {
                    log::debug!(
                        "Peer {} moved from {} to {}",
                        peer_id,
                        rec.address,
                        address
                    );
                }
                rec.address = address;
                rec.link = link;
                rec.last_seen = now;
            }
            None => {
                log::debug!("Peer {} advertising at {}", peer_id, address);
                self.records.insert(
                    peer_id,
                    AdvertisementRecord {
                        peer_id,
                        address,
                        link,
                        last_seen: now,
                        pinned: false,
                    },
                );
            }
        }
    }

    /// Insert a record that stays until removed.
    pub fn pin(&mut self, peer_id: PeerId, address: TransportAddress, link: LinkKind, now: Instant) {
        self.records.insert(
            peer_id,
            AdvertisementRecord {
                peer_id,
                address,
                link,
                last_seen: now,
                pinned: true,
            },
        );
    }

    /// Peers whose record is not stale at `now`, in ascending id order.
    pub fn list_active(&self, now: Instant) -> Vec<PeerId> {
        self.records
            .values()
            .filter(|rec| !rec.is_stale(now, self.staleness))
            .map(|rec| rec.peer_id)
            .collect()
    }

    /// Remove stale records; returns the ids removed.
    pub fn sweep(&mut self, now: Instant) -> Vec<PeerId> {
        let staleness = self.staleness;
        let expired: Vec<PeerId> = self
            .records
            .values()
            .filter(|rec| rec.is_stale(now, staleness))
            .map(|rec| rec.peer_id)
            .collect();
        for id in &expired {
            self.records.remove(id);
            log::debug!("Advertisement from peer {} went stale", id);
        }
        expired
    }

    pub fn remove(&mut self, peer_id: PeerId) -> Option<AdvertisementRecord> {
        self.records.remove(&peer_id)
    }

    pub fn get(&self, peer_id: PeerId) -> Option<&AdvertisementRecord> {
        self.records.get(&peer_id)
    }

    /// All records, stale or not, in ascending id order.
    pub fn records(&self) -> impl Iterator<Item = &AdvertisementRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}
