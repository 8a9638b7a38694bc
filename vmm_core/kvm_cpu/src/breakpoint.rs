// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Software breakpoints patched into guest memory.

use crate::Error;
use crate::facility::Facility;
use crate::memory::MemoryRegionTable;

/// `int3`.
pub const TRAP_OPCODE: u8 = 0xcc;

#[derive(Debug)]
struct Breakpoint {
    address: u64,
    original: u8,
    host: *mut u8,
}

/// Breakpoints by guest virtual address, in insertion order.
#[derive(Debug, Default)]
pub struct Breakpoints {
    entries: Vec<Breakpoint>,
}

// SAFETY: the host pointers are only dereferenced through `&mut self`, and
// point into memory the region table guarantees is mapped.
unsafe impl Send for Breakpoints {}

impl Breakpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, address: u64) -> bool {
        self.entries.iter().any(|bp| bp.address == address)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sets a breakpoint at guest virtual `address`.
    ///
    /// Addresses that do not resolve to mapped guest memory are skipped with
    /// a warning.
    pub fn add(
        &mut self,
        facility: &mut impl Facility,
        memory: &MemoryRegionTable,
        address: u64,
    ) -> Result<(), Error> {
        if self.contains(address) {
            return Ok(());
        }
        let Some(gpa) = facility.translate_gva(address)? else {
            tracing::warn!(address, "breakpoint address is not mapped by the guest");
            return Ok(());
        };
        let Some((host, _)) = memory.translate(gpa) else {
            tracing::warn!(address, gpa, "breakpoint address is not backed by a memory slot");
            return Ok(());
        };

        // Another address may alias the same host byte, which already holds
        // the trap opcode.
        let original = match self.entries.iter().find(|bp| bp.host == host) {
            Some(alias) => alias.original,
            None => {
                // SAFETY: the region table guarantees `host` is inside a live
                // host mapping.
                let original = unsafe { host.read_volatile() };
                // SAFETY: as above.
                unsafe { host.write_volatile(TRAP_OPCODE) };
                original
            }
        };
        self.entries.push(Breakpoint {
            address,
            original,
            host,
        });
        tracing::debug!(address, gpa, original, "breakpoint set");
        Ok(())
    }

    /// Clears the breakpoint at `address`, restoring the original byte.
    pub fn remove(&mut self, memory: &MemoryRegionTable, address: u64) {
        let Some(index) = self.entries.iter().position(|bp| bp.address == address) else {
            tracing::warn!(address, "no breakpoint to remove");
            return;
        };
        let bp = self.entries.remove(index);
        if self.entries.iter().any(|other| other.host == bp.host) {
            tracing::debug!(address, "host byte still patched by an alias");
        } else {
            Self::restore(memory, &bp);
        }
        tracing::debug!(address, "breakpoint removed");
    }

    /// Restores and forgets every breakpoint.
    pub fn clear(&mut self, memory: &MemoryRegionTable) {
        for bp in self.entries.drain(..) {
            Self::restore(memory, &bp);
        }
    }

    fn restore(memory: &MemoryRegionTable, bp: &Breakpoint) {
        if !memory.is_host_mapped(bp.host) {
            tracing::warn!(
                address = bp.address,
                "breakpoint memory was unmapped, not restoring"
            );
            return;
        }
        // SAFETY: checked above that the byte is still inside a live mapping.
        unsafe { bp.host.write_volatile(bp.original) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ScriptedFacility;
    use test_with_tracing::test;

    struct Guest {
        facility: ScriptedFacility,
        memory: MemoryRegionTable,
        backing: Vec<u8>,
    }

    impl Guest {
        /// One slot covering guest physical [0x4000, 0x5000).
        fn new() -> Self {
            let mut guest = Guest {
                facility: ScriptedFacility::new([]),
                memory: MemoryRegionTable::new(),
                backing: vec![0x90; 0x1000],
            };
            // SAFETY: `backing` outlives `memory`, both owned by the guest,
            // and is never reallocated.
            unsafe {
                guest
                    .memory
                    .map(
                        &mut guest.facility,
                        0,
                        0x4000,
                        guest.backing.len() as u64,
                        guest.backing.as_mut_ptr(),
                    )
                    .unwrap()
            };
            guest
        }

        fn byte(&self, address: u64) -> u8 {
            self.backing[(address - 0x4000) as usize]
        }
    }

    #[test]
    fn add_patches_and_remove_restores() {
        let mut guest = Guest::new();
        guest.backing[0] = 0xab;
        let mut bps = Breakpoints::new();

        bps.add(&mut guest.facility, &guest.memory, 0x4000).unwrap();
        assert!(bps.contains(0x4000));
        assert_eq!(guest.byte(0x4000), TRAP_OPCODE);

        bps.remove(&guest.memory, 0x4000);
        assert!(!bps.contains(0x4000));
        assert_eq!(guest.byte(0x4000), 0xab);
    }

    #[test]
    fn adding_twice_keeps_first_original() {
        let mut guest = Guest::new();
        guest.backing[0x10] = 0x55;
        let mut bps = Breakpoints::new();

        bps.add(&mut guest.facility, &guest.memory, 0x4010).unwrap();
        bps.add(&mut guest.facility, &guest.memory, 0x4010).unwrap();
        assert_eq!(bps.len(), 1);

        bps.remove(&guest.memory, 0x4010);
        assert_eq!(guest.byte(0x4010), 0x55);
    }

    #[test]
    fn aliased_addresses_share_the_original_byte() {
        let mut guest = Guest::new();
        guest.backing[0] = 0xab;
        // SAFETY: `backing` outlives `memory` and is never reallocated.
        unsafe {
            guest
                .memory
                .map(
                    &mut guest.facility,
                    1,
                    0x8000,
                    guest.backing.len() as u64,
                    guest.backing.as_mut_ptr(),
                )
                .unwrap()
        };
        let mut bps = Breakpoints::new();

        bps.add(&mut guest.facility, &guest.memory, 0x4000).unwrap();
        bps.add(&mut guest.facility, &guest.memory, 0x8000).unwrap();
        assert_eq!(bps.len(), 2);

        bps.remove(&guest.memory, 0x4000);
        assert_eq!(guest.byte(0x4000), TRAP_OPCODE);
        bps.remove(&guest.memory, 0x8000);
        assert_eq!(guest.byte(0x4000), 0xab);

        bps.add(&mut guest.facility, &guest.memory, 0x4000).unwrap();
        bps.add(&mut guest.facility, &guest.memory, 0x8000).unwrap();
        bps.clear(&guest.memory);
        assert_eq!(guest.byte(0x4000), 0xab);
    }

    #[test]
    fn unresolvable_addresses_are_skipped() {
        let mut guest = Guest::new();
        guest.facility.untranslatable.insert(0x4020);
        let mut bps = Breakpoints::new();

        bps.add(&mut guest.facility, &guest.memory, 0x4020).unwrap();
        bps.add(&mut guest.facility, &guest.memory, 0x9000).unwrap();
        assert!(bps.is_empty());
        assert!(guest.backing.iter().all(|b| *b == 0x90));
    }

    #[test]
    fn removing_missing_breakpoint_is_harmless() {
        let guest = Guest::new();
        let mut bps = Breakpoints::new();
        bps.remove(&guest.memory, 0x4000);
        assert!(bps.is_empty());
    }

    #[test]
    fn clear_restores_everything() {
        let mut guest = Guest::new();
        for (i, b) in guest.backing.iter_mut().enumerate() {
            *b = i as u8;
        }
        let mut bps = Breakpoints::new();
        for address in [0x4001, 0x4102, 0x4ffe] {
            bps.add(&mut guest.facility, &guest.memory, address).unwrap();
        }
        assert_eq!(guest.byte(0x4102), TRAP_OPCODE);

        bps.clear(&guest.memory);
        assert!(bps.is_empty());
        assert!(
            guest
                .backing
                .iter()
                .enumerate()
                .all(|(i, b)| *b == i as u8)
        );
    }

    #[test]
    fn unmapped_memory_is_not_written_on_remove() {
        let mut guest = Guest::new();
        let mut bps = Breakpoints::new();
        bps.add(&mut guest.facility, &guest.memory, 0x4080).unwrap();

        guest.memory.unmap(&mut guest.facility, 0).unwrap();
        guest.backing[0x80] = 0x11;
        bps.remove(&guest.memory, 0x4080);
        assert_eq!(guest.byte(0x4080), 0x11);
    }
}
