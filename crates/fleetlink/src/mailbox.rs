// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bounded hand-off queue into the tick thread.
//!
//! Producers on other threads push; the tick thread drains once per tick.
//! Nothing blocks: a full mailbox hands the item back to the producer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;

use crate::types::{PeerId, PeerKind};

pub struct Mailbox<T> {
    queue: ArrayQueue<T>,
    dropped: AtomicU64,
}

impl<T> Mailbox<T> {
    /// `capacity` is clamped to at least 1.
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            dropped: AtomicU64::new(0),
        }
    }

    /// Push `item`, or give it back when the mailbox is full.
    pub fn push(&self, item: T) -> Result<(), T> {
        self.queue.push(item).map_err(|item| {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            item
        })
    }

    /// Take everything currently queued, oldest first.
    pub fn drain(&self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.queue.len());
        while let Some(item) = self.queue.pop() {
            out.push(item);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Pushes refused because the mailbox was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Requests applied by the engine at the start of its next tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineCommand {
    Connect(PeerKind, PeerId),
    Disconnect(PeerKind, PeerId),
    Start,
    Reinitialize,
}

/// Cloneable, thread-safe sender of [`EngineCommand`]s.
#[derive(Clone)]
pub struct EngineHandle {
    mailbox: Arc<Mailbox<EngineCommand>>,
}

impl EngineHandle {
    pub(crate) fn new(mailbox: Arc<Mailbox<EngineCommand>>) -> Self {
        Self { mailbox }
    }

    /// Queue a command; false when the mailbox is full.
    pub fn send(&self, cmd: EngineCommand) -> bool {
        match self.mailbox.push(cmd) {
            Ok(()) => true,
            Err(cmd) => {
                log::warn!("Engine mailbox full, dropping {:?}", cmd);
                false
            }
        }
    }

    pub fn connect(&self, kind: PeerKind, peer_id: PeerId) -> bool {
        self.send(EngineCommand::Connect(kind, peer_id))
    }

    pub fn disconnect(&self, kind: PeerKind, peer_id: PeerId) -> bool {
        self.send(EngineCommand::Disconnect(kind, peer_id))
    }

    pub fn start(&self) -> bool {
        self.send(EngineCommand::Start)
    }

    pub fn reinitialize(&self) -> bool {
        self.send(EngineCommand::Reinitialize)
    }

    pub fn pending(&self) -> usize {
        self.mailbox.len()
    }
}
