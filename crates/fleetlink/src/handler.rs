// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bytes <-> messages bridge for active peers.
//!
//! Inbound: raw packets popped from a [`ConnectionChannel`] are deframed
//! (stream links, one message per frame) or walked message by message
//! (datagram links, several messages back to back), decoded, size-checked
//! against the [`DispatchTable`] and handed to the registered handler.
//! A bad frame is dropped alone; a bad message in a datagram drops the rest
//! of that datagram, since its length cannot be trusted.
//!
//! Outbound: messages are size-checked against the link limit, encoded and
//! pushed through the channel.

use std::collections::HashMap;

use thiserror::Error;

use crate::channel::{ChannelError, ConnectionChannel};
use crate::dispatch::{DispatchTable, Priority, SizeCheck};
use crate::framing::{FrameDecoder, MAX_FRAME_PAYLOAD};
use crate::protocol::{tag_name, CodecError, Message, SyncTimeAckPayload};
use crate::transport::LinkKind;
use crate::types::PeerId;

/// Outgoing message failures.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("message of {size} bytes exceeds limit of {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error("encode failed: {0}")]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

#[derive(Debug, Clone, Copy)]
pub struct HandlerConfig {
    /// Drop messages whose length disagrees with the registered size.
    pub strict_size_check: bool,
    /// Largest encoded message accepted for sending.
    pub max_message_size: usize,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            strict_size_check: false,
            max_message_size: crate::channel::MAX_PACKET_SIZE,
        }
    }
}

/// Handler counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandlerStats {
    pub delivered: u64,
    pub unknown_tag: u64,
    pub decode_errors: u64,
    pub size_mismatches: u64,
    /// Dropped by the strict size check.
    pub rejected: u64,
    /// Decoded fine but no handler registered.
    pub unhandled: u64,
    pub sent: u64,
    pub resync_events: u64,
    pub bytes_discarded: u64,
}

pub struct MessageHandler {
    config: HandlerConfig,
    decoders: HashMap<PeerId, FrameDecoder>,
    scratch: Message,
    send_buf: Vec<u8>,
    stats: HandlerStats,
}

impl MessageHandler {
    pub fn new(config: HandlerConfig) -> Self {
        Self {
            config,
            decoders: HashMap::new(),
            scratch: Message::SyncTimeAck(SyncTimeAckPayload { peer_id: 0 }),
            send_buf: Vec::with_capacity(MAX_FRAME_PAYLOAD),
            stats: HandlerStats::default(),
        }
    }

    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    pub fn stats(&self) -> HandlerStats {
        self.stats
    }

    /// Drop deframing state for a peer that went away.
    pub fn forget_peer(&mut self, peer_id: PeerId) {
        self.decoders.remove(&peer_id);
    }

    /// Drain every buffered packet of `peer_id` and dispatch the messages
    /// they carry. Returns the number of messages delivered to handlers.
    pub fn process_inbound<C>(
        &mut self,
        channel: &mut ConnectionChannel,
        peer_id: PeerId,
        table: &DispatchTable<C>,
        ctx: &mut C,
    ) -> usize {
        let mut delivered = 0;
        while let Some(packet) = channel.pop_received(peer_id) {
            match packet.link {
                LinkKind::Datagram => {
                    delivered += self.deliver_datagram(&packet.payload, peer_id, table, ctx);
                }
                LinkKind::Stream => {
                    let mut decoder = self.decoders.remove(&peer_id).unwrap_or_default();
                    let (resyncs, discarded) = (decoder.resync_events(), decoder.bytes_discarded());
                    decoder.feed(&packet.payload);
                    while let Some(frame) = decoder.next_frame() {
                        delivered += self.deliver(&frame, peer_id, table, ctx);
                    }
                    self.stats.resync_events += decoder.resync_events() - resyncs;
                    self.stats.bytes_discarded += decoder.bytes_discarded() - discarded;
                    self.decoders.insert(peer_id, decoder);
                }
            }
        }
        delivered
    }

    /// One frame, one message: the size check covers the whole frame.
    fn deliver<C>(&mut self, frame: &[u8], peer_id: PeerId, table: &DispatchTable<C>, ctx: &mut C) -> usize {
        match self.decode_front(frame, peer_id) {
            Some(_) => self.dispatch(frame.len(), peer_id, table, ctx),
            None => 0,
        }
    }

    fn deliver_datagram<C>(
        &mut self,
        datagram: &[u8],
        peer_id: PeerId,
        table: &DispatchTable<C>,
        ctx: &mut C,
    ) -> usize {
        let mut delivered = 0;
        let mut offset = 0;
        while offset < datagram.len() {
            let Some(used) = self.decode_front(&datagram[offset..], peer_id).filter(|&n| n > 0) else {
                log::debug!(
                    "Dropping last {} of {} datagram bytes from peer {}",
                    datagram.len() - offset,
                    datagram.len(),
                    peer_id
                );
                break;
            };
            offset += used;
            delivered += self.dispatch(used, peer_id, table, ctx);
        }
        delivered
    }

    /// Decode the message at the front of `bytes` into the scratch slot.
    fn decode_front(&mut self, bytes: &[u8], peer_id: PeerId) -> Option<usize> {
        match self.scratch.decode_into(bytes) {
            Ok(used) => Some(used),
            Err(CodecError::UnknownTag(tag)) => {
                self.stats.unknown_tag += 1;
                log::warn!(
                    "Unknown message tag 0x{:02X} from peer {}, dropping {} bytes",
                    tag,
                    peer_id,
                    bytes.len()
                );
                None
            }
            Err(e) => {
                self.stats.decode_errors += 1;
                log::warn!("Failed to decode message from peer {}: {}", peer_id, e);
                None
            }
        }
    }

    /// Hand the decoded scratch message, `size` bytes on the wire, to its handler.
    fn dispatch<C>(&mut self, size: usize, peer_id: PeerId, table: &DispatchTable<C>, ctx: &mut C) -> usize {
        let tag = self.scratch.tag();
        let Some(entry) = table.lookup(tag) else {
            self.stats.unhandled += 1;
            log::debug!("No handler for {} from peer {}", tag_name(tag), peer_id);
            return 0;
        };

        if let SizeCheck::Mismatch { expected, actual } = table.check_size(tag, size) {
            self.stats.size_mismatches += 1;
            log::warn!(
                "Size mismatch for {} from peer {}: expected {} bytes, got {}",
                tag_name(tag),
                peer_id,
                expected,
                actual
            );
            if self.config.strict_size_check {
                self.stats.rejected += 1;
                return 0;
            }
        }

        log::trace!("Dispatching {} from peer {}", tag_name(tag), peer_id);
        (entry.handler)(ctx, peer_id, &self.scratch);
        self.stats.delivered += 1;
        1
    }

    /// Encode `msg` and send it to an active peer.
    ///
    /// `reliable` is advisory: every active peer has exactly one link.
    pub fn send_message<C>(
        &mut self,
        channel: &mut ConnectionChannel,
        peer_id: PeerId,
        msg: &Message,
        reliable: bool,
        table: &DispatchTable<C>,
    ) -> Result<(), SendError> {
        let link = channel
            .connection_info(peer_id)
            .map(|info| info.link)
            .ok_or(ChannelError::NotActive(peer_id))?;
        let limit = match link {
            LinkKind::Stream => self.config.max_message_size.min(MAX_FRAME_PAYLOAD),
            LinkKind::Datagram => self.config.max_message_size,
        };
        let size = msg.size();
        if size > limit {
            return Err(SendError::TooLarge { size, limit });
        }
        if !reliable && link == LinkKind::Stream {
            log::trace!("Peer {} has only a stream link, sending {} on it", peer_id, msg.name());
        }

        self.send_buf.clear();
        msg.encode_into(&mut self.send_buf)?;
        match table.priority(msg.tag()) {
            Priority::High => channel.send_immediate(peer_id, &self.send_buf)?,
            Priority::Normal | Priority::Low => channel.send(peer_id, &self.send_buf)?,
        }
        self.stats.sent += 1;
        Ok(())
    }
}
