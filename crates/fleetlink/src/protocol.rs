// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Tagged-union wire format.
//
// Layout: [tag: u8][fields in declaration order]. Primitives are
// little-endian; byte arrays and strings carry a u16 LE length prefix.
// All decoding is safe: malformed input returns Err, never panics.

use thiserror::Error;

use crate::types::{DisconnectReason, EngineState, PeerId, PeerKind};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Encode/decode failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Tag byte is not in the catalog. Nothing was consumed.
    #[error("unknown message tag: 0x{0:02x}")]
    UnknownTag(u8),

    /// Buffer ends before the message does.
    #[error("buffer too short: need {needed} bytes, have {available}")]
    ShortBuffer { needed: usize, available: usize },

    /// String field is not valid UTF-8.
    #[error("invalid UTF-8 in field `{0}`")]
    InvalidUtf8(&'static str),

    /// Enumerated or boolean field holds a value outside its range.
    #[error("invalid value {value} for field `{field}`")]
    InvalidField { field: &'static str, value: u8 },

    /// Variable-length field longer than its u16 length prefix allows.
    #[error("field `{field}` too long: {len} bytes")]
    FieldTooLong { field: &'static str, len: usize },

    /// Encoded message exceeds the caller's size limit.
    #[error("message too large: {size} bytes exceeds limit {limit}")]
    TooLarge { size: usize, limit: usize },
}

// ---------------------------------------------------------------------------
// Tags
// ---------------------------------------------------------------------------

pub const TAG_PING: u8 = 0x01;
pub const TAG_PEER_AVAILABLE: u8 = 0x02;
pub const TAG_PEER_CONNECTED: u8 = 0x03;
pub const TAG_PEER_DISCONNECTED: u8 = 0x04;
pub const TAG_STATE_UPDATE: u8 = 0x05;
pub const TAG_IMAGE_CHUNK: u8 = 0x06;
pub const TAG_GENERIC_COMMAND: u8 = 0x07;
pub const TAG_ENGINE_STATE_CHANGED: u8 = 0x08;
pub const TAG_SYNC_TIME: u8 = 0x09;
pub const TAG_SYNC_TIME_ACK: u8 = 0x0A;

/// Every tag in the catalog, in tag order.
pub const ALL_TAGS: [u8; 10] = [
    TAG_PING,
    TAG_PEER_AVAILABLE,
    TAG_PEER_CONNECTED,
    TAG_PEER_DISCONNECTED,
    TAG_STATE_UPDATE,
    TAG_IMAGE_CHUNK,
    TAG_GENERIC_COMMAND,
    TAG_ENGINE_STATE_CHANGED,
    TAG_SYNC_TIME,
    TAG_SYNC_TIME_ACK,
];

/// Size of the tag byte.
pub const TAG_SIZE: usize = 1;

/// Size of a variable-length field's prefix.
pub const LENGTH_PREFIX_SIZE: usize = 2;

/// Expected encoded size (tag included) for `tag`.
///
/// `Some(0)` marks variable-length messages; `None` an unknown tag.
pub fn fixed_size(tag: u8) -> Option<usize> {
    let body = match tag {
        TAG_PING => 4 + 8 + 1,
        TAG_PEER_AVAILABLE => 1 + 1,
        TAG_PEER_CONNECTED => 1 + 1 + 1,
        TAG_PEER_DISCONNECTED => 1 + 1 + 1,
        TAG_STATE_UPDATE => 1 + 4 + 4 + 4 + 4 + 2 + 4,
        TAG_IMAGE_CHUNK | TAG_GENERIC_COMMAND => return Some(0),
        TAG_ENGINE_STATE_CHANGED => 1 + 1,
        TAG_SYNC_TIME => 1 + 4,
        TAG_SYNC_TIME_ACK => 1,
        _ => return None,
    };
    Some(TAG_SIZE + body)
}

/// Human-readable tag name for logs.
pub fn tag_name(tag: u8) -> &'static str {
    match tag {
        TAG_PING => "Ping",
        TAG_PEER_AVAILABLE => "PeerAvailable",
        TAG_PEER_CONNECTED => "PeerConnected",
        TAG_PEER_DISCONNECTED => "PeerDisconnected",
        TAG_STATE_UPDATE => "StateUpdate",
        TAG_IMAGE_CHUNK => "ImageChunk",
        TAG_GENERIC_COMMAND => "GenericCommand",
        TAG_ENGINE_STATE_CHANGED => "EngineStateChanged",
        TAG_SYNC_TIME => "SyncTime",
        TAG_SYNC_TIME_ACK => "SyncTimeAck",
        _ => "Unknown",
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Keepalive request; responses echo the request with `is_response` set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PingPayload {
    pub counter: u32,
    pub time_sent_ms: f64,
    pub is_response: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAvailablePayload {
    pub peer_id: PeerId,
    pub kind: PeerKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerConnectedPayload {
    pub peer_id: PeerId,
    pub kind: PeerKind,
    pub success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerDisconnectedPayload {
    pub peer_id: PeerId,
    pub kind: PeerKind,
    pub reason: DisconnectReason,
}

/// Periodic robot state report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StateUpdatePayload {
    pub peer_id: PeerId,
    pub timestamp_ms: u32,
    pub pose_x: f32,
    pub pose_y: f32,
    pub heading_rad: f32,
    pub battery_mv: u16,
    pub status_flags: u32,
}

/// One slice of a camera image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageChunkPayload {
    pub image_id: u32,
    pub chunk_index: u8,
    pub chunk_count: u8,
    pub data: Vec<u8>,
}

/// Named command with opaque arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericCommandPayload {
    pub name: String,
    pub args: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStateChangedPayload {
    pub old: EngineState,
    pub new: EngineState,
}

/// Time-sync handshake sent to a robot when it is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncTimePayload {
    pub peer_id: PeerId,
    pub timestamp_ms: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncTimeAckPayload {
    pub peer_id: PeerId,
}

// ---------------------------------------------------------------------------
// Unified message enum
// ---------------------------------------------------------------------------

/// A wire message: the tag selects exactly one payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Ping(PingPayload),
    PeerAvailable(PeerAvailablePayload),
    PeerConnected(PeerConnectedPayload),
    PeerDisconnected(PeerDisconnectedPayload),
    StateUpdate(StateUpdatePayload),
    ImageChunk(ImageChunkPayload),
    GenericCommand(GenericCommandPayload),
    EngineStateChanged(EngineStateChangedPayload),
    SyncTime(SyncTimePayload),
    SyncTimeAck(SyncTimeAckPayload),
}

impl Message {
    pub fn tag(&self) -> u8 {
        match self {
            Self::Ping(_) => TAG_PING,
            Self::PeerAvailable(_) => TAG_PEER_AVAILABLE,
            Self::PeerConnected(_) => TAG_PEER_CONNECTED,
            Self::PeerDisconnected(_) => TAG_PEER_DISCONNECTED,
            Self::StateUpdate(_) => TAG_STATE_UPDATE,
            Self::ImageChunk(_) => TAG_IMAGE_CHUNK,
            Self::GenericCommand(_) => TAG_GENERIC_COMMAND,
            Self::EngineStateChanged(_) => TAG_ENGINE_STATE_CHANGED,
            Self::SyncTime(_) => TAG_SYNC_TIME,
            Self::SyncTimeAck(_) => TAG_SYNC_TIME_ACK,
        }
    }

    pub fn name(&self) -> &'static str {
        tag_name(self.tag())
    }

    /// Exact number of bytes [`encode`](Self::encode) will produce.
    pub fn size(&self) -> usize {
        match self {
            Self::ImageChunk(p) => TAG_SIZE + 4 + 1 + 1 + LENGTH_PREFIX_SIZE + p.data.len(),
            Self::GenericCommand(p) => {
                TAG_SIZE + LENGTH_PREFIX_SIZE + p.name.len() + LENGTH_PREFIX_SIZE + p.args.len()
            }
            other => fixed_size(other.tag()).unwrap_or(TAG_SIZE),
        }
    }

    /// Encode into a fresh buffer.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut buf = Vec::with_capacity(self.size());
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    /// Append the encoded message to `buf`; returns the bytes written.
    ///
    /// Fails only when a variable-length field exceeds its u16 prefix, in
    /// which case `buf` is left unchanged.
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<usize, CodecError> {
        let start = buf.len();
        buf.push(self.tag());
        match self {
            Self::Ping(p) => {
                buf.extend_from_slice(&p.counter.to_le_bytes());
                buf.extend_from_slice(&p.time_sent_ms.to_le_bytes());
                buf.push(u8::from(p.is_response));
            }
            Self::PeerAvailable(p) => {
                buf.push(p.peer_id);
                buf.push(p.kind.as_u8());
            }
            Self::PeerConnected(p) => {
                buf.push(p.peer_id);
                buf.push(p.kind.as_u8());
                buf.push(u8::from(p.success));
            }
            Self::PeerDisconnected(p) => {
                buf.push(p.peer_id);
                buf.push(p.kind.as_u8());
                buf.push(p.reason.as_u8());
            }
            Self::StateUpdate(p) => {
                buf.push(p.peer_id);
                buf.extend_from_slice(&p.timestamp_ms.to_le_bytes());
                buf.extend_from_slice(&p.pose_x.to_le_bytes());
                buf.extend_from_slice(&p.pose_y.to_le_bytes());
                buf.extend_from_slice(&p.heading_rad.to_le_bytes());
                buf.extend_from_slice(&p.battery_mv.to_le_bytes());
                buf.extend_from_slice(&p.status_flags.to_le_bytes());
            }
            Self::ImageChunk(p) => {
                buf.extend_from_slice(&p.image_id.to_le_bytes());
                buf.push(p.chunk_index);
                buf.push(p.chunk_count);
                if let Err(e) = write_bytes(buf, "data", &p.data) {
                    buf.truncate(start);
                    return Err(e);
                }
            }
            Self::GenericCommand(p) => {
                let res = write_bytes(buf, "name", p.name.as_bytes())
                    .and_then(|_| write_bytes(buf, "args", &p.args));
                if let Err(e) = res {
                    buf.truncate(start);
                    return Err(e);
                }
            }
            Self::EngineStateChanged(p) => {
                buf.push(p.old.as_u8());
                buf.push(p.new.as_u8());
            }
            Self::SyncTime(p) => {
                buf.push(p.peer_id);
                buf.extend_from_slice(&p.timestamp_ms.to_le_bytes());
            }
            Self::SyncTimeAck(p) => {
                buf.push(p.peer_id);
            }
        }
        let written = buf.len() - start;
        debug_assert_eq!(written, self.size());
        Ok(written)
    }

    /// Decode one message from the front of `buf`.
    ///
    /// Returns the message and the number of bytes it occupied. Trailing
    /// bytes are left for the caller.
    pub fn decode(buf: &[u8]) -> Result<(Message, usize), CodecError> {
        let mut r = Reader::new(buf);
        let tag = r.u8()?;
        let msg = match tag {
            TAG_PING => Self::Ping(PingPayload {
                counter: r.u32()?,
                time_sent_ms: r.f64()?,
                is_response: r.bool("is_response")?,
            }),
            TAG_PEER_AVAILABLE => Self::PeerAvailable(PeerAvailablePayload {
                peer_id: r.u8()?,
                kind: r.peer_kind()?,
            }),
            TAG_PEER_CONNECTED => Self::PeerConnected(PeerConnectedPayload {
                peer_id: r.u8()?,
                kind: r.peer_kind()?,
                success: r.bool("success")?,
            }),
            TAG_PEER_DISCONNECTED => Self::PeerDisconnected(PeerDisconnectedPayload {
                peer_id: r.u8()?,
                kind: r.peer_kind()?,
                reason: {
                    let v = r.u8()?;
                    DisconnectReason::from_u8(v)
                        .ok_or(CodecError::InvalidField { field: "reason", value: v })?
                },
            }),
            TAG_STATE_UPDATE => Self::StateUpdate(StateUpdatePayload {
                peer_id: r.u8()?,
                timestamp_ms: r.u32()?,
                pose_x: r.f32()?,
                pose_y: r.f32()?,
                heading_rad: r.f32()?,
                battery_mv: r.u16()?,
                status_flags: r.u32()?,
            }),
            TAG_IMAGE_CHUNK => Self::ImageChunk(ImageChunkPayload {
                image_id: r.u32()?,
                chunk_index: r.u8()?,
                chunk_count: r.u8()?,
                data: r.bytes()?.to_vec(),
            }),
            TAG_GENERIC_COMMAND => Self::GenericCommand(GenericCommandPayload {
                name: r.str("name")?.to_string(),
                args: r.bytes()?.to_vec(),
            }),
            TAG_ENGINE_STATE_CHANGED => Self::EngineStateChanged(EngineStateChangedPayload {
                old: r.engine_state("old")?,
                new: r.engine_state("new")?,
            }),
            TAG_SYNC_TIME => Self::SyncTime(SyncTimePayload {
                peer_id: r.u8()?,
                timestamp_ms: r.u32()?,
            }),
            TAG_SYNC_TIME_ACK => Self::SyncTimeAck(SyncTimeAckPayload { peer_id: r.u8()? }),
            other => return Err(CodecError::UnknownTag(other)),
        };
        Ok((msg, r.pos))
    }

    /// Decode into an existing message, reusing its allocations.
    ///
    /// Same tag: fields are assigned in place and owned buffers keep their
    /// capacity. Different tag: the old variant is dropped and replaced.
    /// On error `self` is left untouched.
    pub fn decode_into(&mut self, buf: &[u8]) -> Result<usize, CodecError> {
        let tag = *buf.first().ok_or(CodecError::ShortBuffer {
            needed: TAG_SIZE,
            available: 0,
        })?;
        match self {
            Self::ImageChunk(dst) if tag == TAG_IMAGE_CHUNK => {
                let mut r = Reader::at(buf, TAG_SIZE);
                let image_id = r.u32()?;
                let chunk_index = r.u8()?;
                let chunk_count = r.u8()?;
                let data = r.bytes()?;
                dst.image_id = image_id;
                dst.chunk_index = chunk_index;
                dst.chunk_count = chunk_count;
                dst.data.clear();
                dst.data.extend_from_slice(data);
                Ok(r.pos)
            }
            Self::GenericCommand(dst) if tag == TAG_GENERIC_COMMAND => {
                let mut r = Reader::at(buf, TAG_SIZE);
                let name = r.str("name")?;
                let args = r.bytes()?;
                dst.name.clear();
                dst.name.push_str(name);
                dst.args.clear();
                dst.args.extend_from_slice(args);
                Ok(r.pos)
            }
            _ => {
                let (msg, used) = Self::decode(buf)?;
                *self = msg;
                Ok(used)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn write_bytes(buf: &mut Vec<u8>, field: &'static str, data: &[u8]) -> Result<(), CodecError> {
    let len = u16::try_from(data.len()).map_err(|_| CodecError::FieldTooLong {
        field,
        len: data.len(),
    })?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(data);
    Ok(())
}

/// Bounds-checked little-endian cursor.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self::at(buf, 0)
    }

    fn at(buf: &'a [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let end = self.pos + n;
        if end > self.buf.len() {
            return Err(CodecError::ShortBuffer {
                needed: end,
                available: self.buf.len(),
            });
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn f32(&mut self) -> Result<f32, CodecError> {
        Ok(f32::from_le_bytes(self.array()?))
    }

    fn f64(&mut self) -> Result<f64, CodecError> {
        Ok(f64::from_le_bytes(self.array()?))
    }

    fn bool(&mut self, field: &'static str) -> Result<bool, CodecError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            value => Err(CodecError::InvalidField { field, value }),
        }
    }

    fn peer_kind(&mut self) -> Result<PeerKind, CodecError> {
        let v = self.u8()?;
        PeerKind::from_u8(v).ok_or(CodecError::InvalidField {
            field: "kind",
            value: v,
        })
    }

    fn engine_state(&mut self, field: &'static str) -> Result<EngineState, CodecError> {
        let v = self.u8()?;
        EngineState::from_u8(v).ok_or(CodecError::InvalidField { field, value: v })
    }

    fn bytes(&mut self) -> Result<&'a [u8], CodecError> {
        let len = usize::from(self.u16()?);
        self.take(len)
    }

    fn str(&mut self, field: &'static str) -> Result<&'a str, CodecError> {
        std::str::from_utf8(self.bytes()?).map_err(|_| CodecError::InvalidUtf8(field))
    }
}
