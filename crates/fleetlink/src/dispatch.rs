// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Static tag -> handler lookup.
//!
//! The table is assembled once through [`DispatchTableBuilder`] and is
//! immutable afterwards; it can be shared across threads behind an `Arc`
//! without locking.

use std::fmt;

use thiserror::Error;

use crate::protocol::{tag_name, Message};
use crate::types::PeerId;

/// Handler invoked for every delivered message of one tag.
pub type Handler<C> = Box<dyn Fn(&mut C, PeerId, &Message) + Send + Sync>;

/// Registration errors. These are startup misconfigurations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("tag 0x{0:02X} is already registered")]
    DuplicateTag(u8),
}

/// Outgoing priority. High-priority messages bypass the send budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Outcome of comparing a received length with the registered size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeCheck {
    /// Sizes agree, or the entry is variable length.
    Match,
    Mismatch { expected: usize, actual: usize },
    /// No entry for the tag.
    Unregistered,
}

pub struct DispatchEntry<C> {
    pub tag: u8,
    /// Encoded size including the tag; 0 for variable-length messages.
    pub expected_size: usize,
    pub priority: Priority,
    pub handler: Handler<C>,
}

impl<C> fmt::Debug for DispatchEntry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchEntry")
            .field("tag", &format_args!("0x{:02X} ({})", self.tag, tag_name(self.tag)))
            .field("expected_size", &self.expected_size)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// Builder collecting registrations.
pub struct DispatchTableBuilder<C> {
    slots: Vec<Option<DispatchEntry<C>>>,
}

impl<C> DispatchTableBuilder<C> {
    /// Register `handler` for `tag`. A second registration for the same tag
    /// fails.
    pub fn register<F>(
        mut self,
        tag: u8,
        expected_size: usize,
        priority: Priority,
        handler: F,
    ) -> Result<Self, DispatchError>
    where
        F: Fn(&mut C, PeerId, &Message) + Send + Sync + 'static,
    {
        let slot = &mut self.slots[usize::from(tag)];
        if slot.is_some() {
            return Err(DispatchError::DuplicateTag(tag));
        }
        *slot = Some(DispatchEntry {
            tag,
            expected_size,
            priority,
            handler: Box::new(handler),
        });
        Ok(self)
    }

    pub fn build(self) -> DispatchTable<C> {
        DispatchTable { slots: self.slots }
    }
}

/// Immutable dispatch table indexed by tag.
pub struct DispatchTable<C> {
    slots: Vec<Option<DispatchEntry<C>>>,
}

impl<C> DispatchTable<C> {
    pub fn builder() -> DispatchTableBuilder<C> {
        DispatchTableBuilder {
            slots: (0..=u8::MAX).map(|_| None).collect(),
        }
    }

    pub fn lookup(&self, tag: u8) -> Option<&DispatchEntry<C>> {
        self.slots[usize::from(tag)].as_ref()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered tags in ascending order.
    pub fn tags(&self) -> Vec<u8> {
        self.slots.iter().flatten().map(|e| e.tag).collect()
    }

    pub fn priority(&self, tag: u8) -> Priority {
        self.lookup(tag).map(|e| e.priority).unwrap_or_default()
    }

    pub fn check_size(&self, tag: u8, actual: usize) -> SizeCheck {
        match self.lookup(tag) {
            None => SizeCheck::Unregistered,
            Some(e) if e.expected_size == 0 || e.expected_size == actual => SizeCheck::Match,
            Some(e) => SizeCheck::Mismatch {
                expected: e.expected_size,
                actual,
            },
        }
    }
}

impl<C> fmt::Debug for DispatchTable<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.slots.iter().flatten()).finish()
    }
}
