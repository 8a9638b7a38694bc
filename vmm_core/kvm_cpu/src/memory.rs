// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Guest physical memory slots backed by host memory.

use crate::Error;
use crate::facility::Facility;

/// A guest physical range backed by host memory.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    pub slot: u32,
    pub guest_address: u64,
    pub size: u64,
    host_pointer: *mut u8,
}

// SAFETY: the region is just a description of a mapping; the host memory it
// points at is only dereferenced by the owner of the table.
unsafe impl Send for MemoryRegion {}
// SAFETY: see above.
unsafe impl Sync for MemoryRegion {}

impl MemoryRegion {
    pub fn host_pointer(&self) -> *mut u8 {
        self.host_pointer
    }

    fn contains(&self, address: u64) -> bool {
        address
            .checked_sub(self.guest_address)
            .is_some_and(|offset| offset < self.size)
    }

    fn contains_host(&self, pointer: *const u8) -> bool {
        (pointer as usize)
            .checked_sub(self.host_pointer as usize)
            .is_some_and(|offset| (offset as u64) < self.size)
    }
}

/// The memory slots of one VM, in the order they were first mapped.
///
/// Lookups return the first region containing the address, so overlapping
/// regions resolve to the earliest mapped one.
#[derive(Debug, Default)]
pub struct MemoryRegionTable {
    regions: Vec<MemoryRegion>,
}

impl MemoryRegionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `slot` to `size` bytes at `guest_address`, backed by
    /// `host_pointer`. An existing mapping of `slot` is replaced.
    ///
    /// # Safety
    ///
    /// `host_pointer..host_pointer+size` must be valid for reads and writes
    /// until the slot is unmapped or the table is cleared.
    pub unsafe fn map(
        &mut self,
        facility: &mut impl Facility,
        slot: u32,
        guest_address: u64,
        size: u64,
        host_pointer: *mut u8,
    ) -> Result<(), Error> {
        // SAFETY: the caller guarantees the host range.
        unsafe { facility.set_user_memory_region(slot, guest_address, size, host_pointer)? };

        let region = MemoryRegion {
            slot,
            guest_address,
            size,
            host_pointer,
        };
        match self.regions.iter_mut().find(|r| r.slot == slot) {
            Some(existing) => *existing = region,
            None => self.regions.push(region),
        }
        tracing::debug!(slot, guest_address, size, "mapped memory slot");
        Ok(())
    }

    /// Unmaps `slot`. Unmapping a slot that is not mapped only logs.
    pub fn unmap(&mut self, facility: &mut impl Facility, slot: u32) -> Result<(), Error> {
        let Some(index) = self.regions.iter().position(|r| r.slot == slot) else {
            tracing::warn!(slot, "unmapping a memory slot that is not mapped");
            return Ok(());
        };
        let region = self.regions[index];
        // SAFETY: a zero-sized region deletes the slot and keeps no reference
        // to host memory.
        unsafe {
            facility.set_user_memory_region(slot, region.guest_address, 0, region.host_pointer)?
        };
        self.regions.remove(index);
        tracing::debug!(slot, "unmapped memory slot");
        Ok(())
    }

    /// Translates a guest physical address to a host pointer and the number
    /// of bytes left in the region from there.
    pub fn translate(&self, address: u64) -> Option<(*mut u8, u64)> {
        let region = self.find(address)?;
        let offset = address - region.guest_address;
        Some((
            region.host_pointer.wrapping_add(offset as usize),
            region.size - offset,
        ))
    }

    pub fn find(&self, address: u64) -> Option<&MemoryRegion> {
        self.regions.iter().find(|r| r.contains(address))
    }

    /// Whether `pointer` is inside the host memory of a live region.
    pub fn is_host_mapped(&self, pointer: *const u8) -> bool {
        self.regions.iter().any(|r| r.contains_host(pointer))
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    /// Forgets all regions. The slots themselves go away with the VM.
    pub fn clear(&mut self) {
        self.regions.clear();
    }
}
