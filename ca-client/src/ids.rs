//! Correlation id space shared by channels and notification I/O.
//!
//! Ids double as wire values: a channel id travels in search and claim
//! requests, an I/O id in the `available` field of read, write and event
//! requests. Replies are routed back by looking the id up in the registry.
//!
//! An id is `(generation << SLOT_BITS) | slot`. Slots come from a LIFO free
//! list; releasing a slot bumps its generation, so a reply or a by-id destroy
//! carrying a stale id never reaches an object that later reused the slot.
//! A slot whose generation is exhausted is retired instead of wrapping, so no
//! `(slot, generation)` pair is issued twice in the life of an id space.

use std::fmt;

use crate::error::{CaError, CaResult};

/// Bits of an id used for the slot index.
pub const SLOT_BITS: u32 = 20;

const SLOT_MASK: u32 = (1 << SLOT_BITS) - 1;
const GENERATION_MASK: u32 = (1 << (32 - SLOT_BITS)) - 1;

/// Highest usable slot. The all-ones slot is never issued so that no id can
/// equal `0xFFFF_FFFF`, the correlation value of a plain write.
const MAX_SLOTS: usize = SLOT_MASK as usize;

/// Locally assigned channel identifier (the client channel id on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub(crate) u32);

impl ChannelId {
    /// Wire representation.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Identifier of an outstanding notification I/O object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IoId(pub(crate) u32);

impl IoId {
    /// Wire representation.
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Rebuild an id from a value found in a reply header.
    pub fn from_wire(value: u32) -> Self {
        Self(value)
    }
}

impl fmt::Display for IoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    generation: u32,
    live: bool,
}

/// Free-list backed allocator of generation-tagged ids.
#[derive(Debug, Default)]
pub struct IdSpace {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
    retired: usize,
}

impl IdSpace {
    /// Create an empty id space.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out an id that is not referenced by any live object.
    ///
    /// # Errors
    ///
    /// Returns `AllocationFailure` once every slot is live.
    pub fn allocate(&mut self) -> CaResult<u32> {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                if self.slots.len() >= MAX_SLOTS {
                    return Err(CaError::AllocationFailure);
                }
                self.slots.try_reserve(1).map_err(|_| CaError::AllocationFailure)?;
                self.slots.push(Slot {
                    generation: 0,
                    live: false,
                });
                (self.slots.len() - 1) as u32
            }
        };

        let entry = &mut self.slots[slot as usize];
        entry.live = true;
        self.live += 1;
        Ok((entry.generation << SLOT_BITS) | slot)
    }

    /// Return an id to the free list.
    ///
    /// Releasing an id that is not live (already released, or from an older
    /// generation) is a no-op and returns `false`.
    pub fn release(&mut self, id: u32) -> bool {
        if !self.is_live(id) {
            return false;
        }
        let slot = id & SLOT_MASK;
        let entry = &mut self.slots[slot as usize];
        entry.live = false;
        self.live -= 1;
        if entry.generation == GENERATION_MASK {
            self.retired += 1;
            tracing::debug!(slot, "id slot retired");
        } else {
            entry.generation += 1;
            self.free.push(slot);
        }
        true
    }

    /// Number of slots retired after exhausting their generations.
    pub fn retired_count(&self) -> usize {
        self.retired
    }

    /// Whether `id` currently names a live object.
    pub fn is_live(&self, id: u32) -> bool {
        let slot = (id & SLOT_MASK) as usize;
        let generation = id >> SLOT_BITS;
        self.slots
            .get(slot)
            .map(|entry| entry.live && entry.generation == generation)
            .unwrap_or(false)
    }

    /// Number of live ids.
    pub fn live_count(&self) -> usize {
        self.live
    }
}
