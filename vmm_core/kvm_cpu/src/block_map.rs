// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Translation between guest offsets and host pointers for the translating
//! engine's code blocks.
//!
//! The host publishes the whole block set at once. Each publication is an
//! immutable *generation*: a block array plus two most-recently-used lists
//! over it, one walked for guest lookups and one for host lookups. Swapping in
//! a new generation is a single pointer update, so a concurrent lookup sees
//! either the old set or the new one, and the old generation is freed when
//! its last reader lets go of it.

use crate::Error;
use parking_lot::Mutex;
use parking_lot::RwLock;
use std::sync::Arc;

/// `size` bytes of guest offsets from `start` are backed by host memory at
/// `host_pointer`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HostBlock {
    pub start: u64,
    pub size: u64,
    pub host_pointer: *mut u8,
}

// SAFETY: a block only describes memory; it never dereferences the pointer.
unsafe impl Send for HostBlock {}
// SAFETY: see above.
unsafe impl Sync for HostBlock {}

impl HostBlock {
    fn guest_offset(&self, offset: u64) -> Option<usize> {
        offset
            .checked_sub(self.start)
            .filter(|&delta| delta < self.size)
            .map(|delta| delta as usize)
    }

    fn host_offset(&self, pointer: *const u8) -> Option<u64> {
        (pointer as usize)
            .checked_sub(self.host_pointer as usize)
            .map(|delta| delta as u64)
            .filter(|&delta| delta < self.size)
    }
}

/// A doubly-linked list threaded through indices of the block array.
#[derive(Debug)]
struct MruList {
    head: Option<usize>,
    prev: Vec<Option<usize>>,
    next: Vec<Option<usize>>,
}

impl MruList {
    fn new(len: usize) -> Self {
        Self {
            head: (len > 0).then_some(0),
            prev: (0..len).map(|i| i.checked_sub(1)).collect(),
            next: (0..len).map(|i| Some(i + 1).filter(|&n| n < len)).collect(),
        }
    }

    /// Moves `index` to the head of the list.
    fn promote(&mut self, index: usize) {
        if self.head == Some(index) {
            return;
        }
        let (prev, next) = (self.prev[index], self.next[index]);
        if let Some(prev) = prev {
            self.next[prev] = next;
        }
        if let Some(next) = next {
            self.prev[next] = prev;
        }
        self.prev[index] = None;
        self.next[index] = self.head;
        if let Some(head) = self.head {
            self.prev[head] = Some(index);
        }
        self.head = Some(index);
    }

    fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(self.head, |&i| self.next[i])
    }

    /// Finds the first entry accepted by `f` and promotes it.
    fn find_map<T>(&mut self, mut f: impl FnMut(usize) -> Option<T>) -> Option<T> {
        let (index, value) = self.iter().find_map(|i| f(i).map(|v| (i, v)))?;
        self.promote(index);
        Some(value)
    }
}

#[derive(Debug)]
struct Generation {
    blocks: Box<[HostBlock]>,
    by_guest: Mutex<MruList>,
    by_host: Mutex<MruList>,
}

impl Generation {
    fn new(blocks: &[HostBlock]) -> Self {
        Self {
            blocks: blocks.into(),
            by_guest: Mutex::new(MruList::new(blocks.len())),
            by_host: Mutex::new(MruList::new(blocks.len())),
        }
    }

    fn guest_to_host(&self, offset: u64) -> Option<*mut u8> {
        self.by_guest.lock().find_map(|i| {
            let block = &self.blocks[i];
            block
                .guest_offset(offset)
                .map(|delta| block.host_pointer.wrapping_add(delta))
        })
    }

    fn host_to_guest(&self, pointer: *const u8) -> Option<u64> {
        self.by_host.lock().find_map(|i| {
            let block = &self.blocks[i];
            block.host_offset(pointer).map(|delta| block.start + delta)
        })
    }
}

/// The published block set, shared between the host and the executing
/// thread.
#[derive(Debug, Default)]
pub struct HostBlockMap {
    current: RwLock<Option<Arc<Generation>>>,
}

impl HostBlockMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn current(&self) -> Option<Arc<Generation>> {
        self.current.read().clone()
    }

    /// Publishes `blocks` as the new block set. Both lookup orders start out
    /// as the order of `blocks`.
    pub fn replace_mapping(&self, blocks: &[HostBlock]) {
        let generation = Arc::new(Generation::new(blocks));
        let previous = std::mem::replace(&mut *self.current.write(), Some(generation));
        tracing::trace!(
            blocks = blocks.len(),
            replaced = previous.is_some(),
            "published host blocks"
        );
    }

    /// Drops the published block set.
    pub fn clear(&self) {
        *self.current.write() = None;
    }

    /// Translates a guest offset to a host pointer.
    ///
    /// When no block covers `offset`, `fault_in` is asked to publish one and
    /// the lookup is retried. If it returns without publishing anything new
    /// the lookup fails instead of asking again.
    pub fn guest_to_host(
        &self,
        offset: u64,
        mut fault_in: impl FnMut(&Self, u64) -> Result<(), Error>,
    ) -> Result<*mut u8, Error> {
        loop {
            let generation = self.current();
            if let Some(pointer) = generation.as_ref().and_then(|g| g.guest_to_host(offset)) {
                return Ok(pointer);
            }
            fault_in(self, offset)?;
            let unchanged = match (&generation, &self.current()) {
                (Some(before), Some(after)) => Arc::ptr_eq(before, after),
                (None, None) => true,
                _ => false,
            };
            if unchanged {
                return Err(Error::UnmappedOffset(offset));
            }
        }
    }

    /// Translates a host pointer back to its guest offset.
    pub fn host_to_guest(&self, pointer: *const u8) -> Result<u64, Error> {
        self.current()
            .and_then(|g| g.host_to_guest(pointer))
            .ok_or(Error::PointerNotAllocated(pointer as usize))
    }

    /// Block starts in guest lookup order, most recently used first.
    pub fn guest_order(&self) -> Vec<u64> {
        self.current()
            .map(|g| g.by_guest.lock().iter().map(|i| g.blocks[i].start).collect())
            .unwrap_or_default()
    }

    /// Block starts in host lookup order, most recently used first.
    pub fn host_order(&self) -> Vec<u64> {
        self.current()
            .map(|g| g.by_host.lock().iter().map(|i| g.blocks[i].start).collect())
            .unwrap_or_default()
    }
}
