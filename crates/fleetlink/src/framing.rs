// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Marker-delimited framing for stream links.
//!
//! Stream transports have no message boundaries, so every encoded message
//! travels inside a frame:
//!
//! ```text
//! +------+------+---------+-------------------+
//! | 0xBE | 0xEF | len: u8 | payload (len B)   |
//! +------+------+---------+-------------------+
//! ```
//!
//! The decoder never assumes the marker sits at offset 0. Bytes before the
//! first marker are dropped (and counted) so the stream resynchronizes after
//! corruption; partial frames stay buffered until the rest arrives.
//!
//! # Example
//!
//! ```
//! use fleetlink::framing::{encode_frame, FrameDecoder};
//!
//! let frame = encode_frame(&[0x01, 0x02]).unwrap();
//! let mut decoder = FrameDecoder::new();
//! decoder.feed(&[0x00, 0x13]); // garbage
//! decoder.feed(&frame);
//! assert_eq!(decoder.next_frame(), Some(vec![0x01, 0x02]));
//! assert_eq!(decoder.bytes_discarded(), 2);
//! ```

use thiserror::Error;

/// Two-byte marker opening every frame.
pub const FRAME_MAGIC: [u8; 2] = [0xBE, 0xEF];

/// Marker plus the length byte.
pub const FRAME_HEADER_SIZE: usize = 3;

/// Largest payload a single frame can carry.
pub const MAX_FRAME_PAYLOAD: usize = u8::MAX as usize;

/// Framing errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("payload of {0} bytes does not fit in one frame (max {max})", max = MAX_FRAME_PAYLOAD)]
    PayloadTooLarge(usize),
}

/// Encode `payload` as one frame.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    encode_frame_into(payload, &mut frame)?;
    Ok(frame)
}

/// Append one frame carrying `payload` to `buf`.
pub fn encode_frame_into(payload: &[u8], buf: &mut Vec<u8>) -> Result<(), FrameError> {
    let len = u8::try_from(payload.len()).map_err(|_| FrameError::PayloadTooLarge(payload.len()))?;
    buf.extend_from_slice(&FRAME_MAGIC);
    buf.push(len);
    buf.extend_from_slice(payload);
    Ok(())
}

/// Incremental frame decoder with resynchronization.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    frames_decoded: u64,
    bytes_discarded: u64,
    resync_events: u64,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the stream.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes currently held (partial frame or unscanned input).
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Frames successfully extracted.
    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    /// Bytes dropped while looking for a marker.
    pub fn bytes_discarded(&self) -> u64 {
        self.bytes_discarded
    }

    /// Number of times input had to be dropped to find a marker.
    pub fn resync_events(&self) -> u64 {
        self.resync_events
    }

    /// Drop buffered bytes (after the link is replaced).
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Extract the next complete frame payload, if any.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        if self.buffer.is_empty() {
            return None;
        }

        match find_marker(&self.buffer) {
            Some(0) => {}
            Some(offset) => {
                log::warn!(
                    "Frame marker not found where expected, dropping {} preceding bytes",
                    offset
                );
                self.discard(offset);
            }
            None => {
                // Keep a trailing first marker byte: the second may be in the next read.
                let keep = usize::from(self.buffer.last() == Some(&FRAME_MAGIC[0]));
                let drop = self.buffer.len() - keep;
                if drop > 0 {
                    log::warn!("No frame marker in {} buffered bytes, discarding them", drop);
                    self.discard(drop);
                }
                return None;
            }
        }

        if self.buffer.len() < FRAME_HEADER_SIZE {
            return None;
        }
        let len = usize::from(self.buffer[2]);
        let end = FRAME_HEADER_SIZE + len;
        if self.buffer.len() < end {
            return None;
        }

        let payload = self.buffer[FRAME_HEADER_SIZE..end].to_vec();
        self.buffer.drain(..end);
        self.frames_decoded += 1;
        log::trace!("Decoded frame of {} bytes", len);
        Some(payload)
    }

    fn discard(&mut self, count: usize) {
        self.buffer.drain(..count);
        self.bytes_discarded += count as u64;
        self.resync_events += 1;
    }
}

fn find_marker(buf: &[u8]) -> Option<usize> {
    buf.windows(FRAME_MAGIC.len()).position(|w| w == FRAME_MAGIC)
}
