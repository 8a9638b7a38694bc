// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Register access with a write-back cache for the special registers.
//!
//! General purpose registers, RIP and RFLAGS are always read from and written
//! through to the vCPU. Segment and control registers live in `kvm_sregs`,
//! which is expensive to fetch, so it is cached for the duration of one
//! stop of the processor and written back just before the next run.

use crate::Error;
use crate::facility::Facility;
use kvm::kvm_regs;
use kvm::kvm_segment;
use kvm::kvm_sregs;

/// Register numbering used by the host.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum Register {
    Rax = 0,
    Rbx = 1,
    Rcx = 2,
    Rdx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
    Rip = 16,
    Eflags = 17,
    Cs = 18,
    Ss = 19,
    Ds = 20,
    Es = 21,
    Fs = 22,
    Gs = 23,
    Cr0 = 32,
    Cr2 = 34,
    Cr3 = 35,
    Cr4 = 36,
    Cr8 = 40,
    Efer = 41,
}

impl Register {
    const ALL: [Register; 30] = [
        Register::Rax,
        Register::Rbx,
        Register::Rcx,
        Register::Rdx,
        Register::Rsp,
        Register::Rbp,
        Register::Rsi,
        Register::Rdi,
        Register::R8,
        Register::R9,
        Register::R10,
        Register::R11,
        Register::R12,
        Register::R13,
        Register::R14,
        Register::R15,
        Register::Rip,
        Register::Eflags,
        Register::Cs,
        Register::Ss,
        Register::Ds,
        Register::Es,
        Register::Fs,
        Register::Gs,
        Register::Cr0,
        Register::Cr2,
        Register::Cr3,
        Register::Cr4,
        Register::Cr8,
        Register::Efer,
    ];

    /// Looks up a host register id. The x87 stack (24..=31), CR1 and anything
    /// unlisted have no mapping.
    pub fn from_id(id: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|reg| *reg as u32 == id)
    }

    /// Whether the register lives in the cached `kvm_sregs`.
    pub fn is_special(self) -> bool {
        self as u32 >= Register::Cs as u32
    }

    fn gpr(self, regs: &mut kvm_regs) -> &mut u64 {
        match self {
            Register::Rax => &mut regs.rax,
            Register::Rbx => &mut regs.rbx,
            Register::Rcx => &mut regs.rcx,
            Register::Rdx => &mut regs.rdx,
            Register::Rsp => &mut regs.rsp,
            Register::Rbp => &mut regs.rbp,
            Register::Rsi => &mut regs.rsi,
            Register::Rdi => &mut regs.rdi,
            Register::R8 => &mut regs.r8,
            Register::R9 => &mut regs.r9,
            Register::R10 => &mut regs.r10,
            Register::R11 => &mut regs.r11,
            Register::R12 => &mut regs.r12,
            Register::R13 => &mut regs.r13,
            Register::R14 => &mut regs.r14,
            Register::R15 => &mut regs.r15,
            Register::Rip => &mut regs.rip,
            Register::Eflags => &mut regs.rflags,
            _ => unreachable!("{self:?} is a special register"),
        }
    }

    fn read_special(self, sregs: &kvm_sregs) -> u64 {
        match self {
            Register::Cs => sregs.cs.selector.into(),
            Register::Ss => sregs.ss.selector.into(),
            Register::Ds => sregs.ds.selector.into(),
            Register::Es => sregs.es.selector.into(),
            Register::Fs => sregs.fs.selector.into(),
            Register::Gs => sregs.gs.selector.into(),
            Register::Cr0 => sregs.cr0,
            Register::Cr2 => sregs.cr2,
            Register::Cr3 => sregs.cr3,
            Register::Cr4 => sregs.cr4,
            Register::Cr8 => sregs.cr8,
            Register::Efer => sregs.efer,
            _ => unreachable!("{self:?} is a general register"),
        }
    }

    fn write_special(self, sregs: &mut kvm_sregs, value: u64) {
        match self {
            Register::Cs => sregs.cs.selector = value as u16,
            Register::Ss => sregs.ss.selector = value as u16,
            Register::Ds => sregs.ds.selector = value as u16,
            Register::Es => sregs.es.selector = value as u16,
            Register::Fs => sregs.fs.selector = value as u16,
            Register::Gs => sregs.gs.selector = value as u16,
            Register::Cr0 => sregs.cr0 = value,
            Register::Cr2 => sregs.cr2 = value,
            Register::Cr3 => sregs.cr3 = value,
            Register::Cr4 => sregs.cr4 = value,
            Register::Cr8 => sregs.cr8 = value,
            Register::Efer => sregs.efer = value,
            _ => unreachable!("{self:?} is a general register"),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Segment {
    Cs,
    Ds,
    Es,
    Ss,
    Fs,
    Gs,
}

impl Segment {
    fn get(self, sregs: &mut kvm_sregs) -> &mut kvm_segment {
        match self {
            Segment::Cs => &mut sregs.cs,
            Segment::Ds => &mut sregs.ds,
            Segment::Es => &mut sregs.es,
            Segment::Ss => &mut sregs.ss,
            Segment::Fs => &mut sregs.fs,
            Segment::Gs => &mut sregs.gs,
        }
    }
}

/// A segment descriptor as the host hands it over: the attribute bits are in
/// the layout of the high dword of a GDT entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SegmentDescriptor {
    pub base: u64,
    pub limit: u32,
    pub selector: u16,
    pub flags: u32,
}

fn field(flags: u32, offset: u32, width: u32) -> u8 {
    ((flags >> offset) & ((1 << width) - 1)) as u8
}

impl SegmentDescriptor {
    fn apply(&self, segment: &mut kvm_segment) {
        segment.base = self.base;
        segment.limit = self.limit;
        segment.selector = self.selector;
        segment.type_ = field(self.flags, 8, 4);
        segment.s = field(self.flags, 12, 1);
        segment.dpl = field(self.flags, 13, 2);
        segment.present = field(self.flags, 15, 1);
        segment.avl = field(self.flags, 20, 1);
        segment.l = field(self.flags, 21, 1);
        segment.db = field(self.flags, 22, 1);
        segment.g = field(self.flags, 23, 1);
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum CacheState {
    /// Nothing cached; the next access fetches.
    #[default]
    Absent,
    /// Cached and identical to the vCPU.
    Clean,
    /// Cached with modifications the vCPU has not seen.
    Dirty,
}

#[derive(Debug, Default)]
pub struct RegisterCache {
    state: CacheState,
    sregs: kvm_sregs,
}

impl RegisterCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> CacheState {
        self.state
    }

    fn special(&mut self, facility: &mut impl Facility) -> Result<&mut kvm_sregs, Error> {
        if self.state == CacheState::Absent {
            self.sregs = facility.get_sregs()?;
            self.state = CacheState::Clean;
        }
        Ok(&mut self.sregs)
    }

    pub fn read(&mut self, facility: &mut impl Facility, id: u32) -> Result<u64, Error> {
        let reg = Register::from_id(id).ok_or(Error::UndefinedRegisterRead(id))?;
        if reg.is_special() {
            Ok(reg.read_special(self.special(facility)?))
        } else {
            let mut regs = facility.get_regs()?;
            Ok(*reg.gpr(&mut regs))
        }
    }

    pub fn write(
        &mut self,
        facility: &mut impl Facility,
        id: u32,
        value: u64,
    ) -> Result<(), Error> {
        let reg = Register::from_id(id).ok_or(Error::UndefinedRegisterWrite(id))?;
        if reg.is_special() {
            reg.write_special(self.special(facility)?, value);
            self.state = CacheState::Dirty;
        } else {
            let mut regs = facility.get_regs()?;
            *reg.gpr(&mut regs) = value;
            facility.set_regs(&regs)?;
        }
        Ok(())
    }

    pub fn set_segment(
        &mut self,
        facility: &mut impl Facility,
        segment: Segment,
        descriptor: SegmentDescriptor,
    ) -> Result<(), Error> {
        descriptor.apply(segment.get(self.special(facility)?));
        self.state = CacheState::Dirty;
        Ok(())
    }

    /// Writes back pending changes and forgets the cached copy, since the
    /// guest is about to run and may change it.
    pub fn flush(&mut self, facility: &mut impl Facility) -> Result<(), Error> {
        if self.state == CacheState::Dirty {
            facility.set_sregs(&self.sregs)?;
        }
        self.state = CacheState::Absent;
        Ok(())
    }
}
