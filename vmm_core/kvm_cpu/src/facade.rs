// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The entry points the host calls.

use crate::CpuConfig;
use crate::Error;
use crate::ExecutionResult;
use crate::InterruptHandle;
use crate::block_map::HostBlock;
use crate::block_map::HostBlockMap;
use crate::boundary;
use crate::facility::Facility;
use crate::facility::KvmFacility;
use crate::host::Host;
use crate::regs::Register;
use crate::regs::Segment;
use crate::regs::SegmentDescriptor;
use crate::vcpu::Vcpu;
use std::sync::Arc;
use std::time::Duration;

/// One virtual processor as the host sees it.
///
/// Each method runs inside a call boundary. A fatal error that reaches the
/// outermost boundary on the thread is reported to the host once, then
/// returned.
pub struct KvmCore<F: Facility = KvmFacility> {
    vcpu: Vcpu<F>,
    blocks: Arc<HostBlockMap>,
    host: Arc<dyn Host>,
}

impl KvmCore<KvmFacility> {
    /// Opens KVM and creates the processor.
    pub fn init(host: Arc<dyn Host>, config: CpuConfig) -> Result<Self, Error> {
        let outermost = boundary::depth() == 0;
        let result = boundary::guarded("init", || {
            let facility = KvmFacility::open(&config)?;
            Self::with_facility(facility, host.clone(), &config)
        });
        if let Err(err) = &result {
            if outermost {
                report(&*host, err, None);
            }
        }
        result
    }
}

fn report(host: &dyn Host, err: &Error, pc: Option<u64>) {
    if !err.is_fatal() || matches!(err, Error::Host(_)) {
        // The host raised it, so it already knows.
        return;
    }
    let message = error_chain(err);
    match pc {
        Some(pc) => host.report_runtime_abort(&message, pc),
        None => host.report_abort(&message),
    }
}

fn error_chain(err: &Error) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(err) = source {
        message.push_str(": ");
        message.push_str(&err.to_string());
        source = err.source();
    }
    message
}

impl<F: Facility> KvmCore<F> {
    /// Builds the core around an already created vCPU.
    pub fn with_facility(
        facility: F,
        host: Arc<dyn Host>,
        config: &CpuConfig,
    ) -> Result<Self, Error> {
        Ok(Self {
            vcpu: Vcpu::new(facility, host.clone(), config)?,
            blocks: Arc::new(HostBlockMap::new()),
            host,
        })
    }

    fn enter<T>(
        &mut self,
        entry: &'static str,
        f: impl FnOnce(&mut Vcpu<F>) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let outermost = boundary::depth() == 0;
        let result = boundary::guarded(entry, || f(&mut self.vcpu));
        if let Err(err) = &result {
            if matches!(err, Error::CallbackPanic(_)) {
                self.vcpu.reset_after_unwind();
            }
            if outermost {
                // Reading RIP is best effort; a failure here must not hide
                // the original error.
                let pc = if err.is_runtime() {
                    self.vcpu.read_register(Register::Rip as u32).ok()
                } else {
                    None
                };
                report(&*self.host, err, pc);
            }
        }
        result
    }

    fn enter_shared<T>(
        &self,
        entry: &'static str,
        f: impl FnOnce(&Self) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let outermost = boundary::depth() == 0;
        let result = boundary::guarded(entry, || f(self));
        if let Err(err) = &result {
            if outermost {
                report(&*self.host, err, None);
            }
        }
        result
    }

    /// Tears the processor down: breakpoints are restored, regions forgotten
    /// and the vCPU closed. Dropping the core does the same.
    pub fn dispose(self) {
        if let Err(err) = self.enter_shared("dispose", |core| core.interrupt_handle().interrupt()) {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                "failed to interrupt execution while disposing"
            );
        }
        drop(self);
    }

    /// Runs the guest for up to `quantum_us` microseconds.
    pub fn execute(&mut self, quantum_us: u64) -> Result<ExecutionResult, Error> {
        self.enter("execute", |vcpu| {
            vcpu.execute(Duration::from_micros(quantum_us))
        })
    }

    pub fn execute_single_step(&mut self) -> Result<ExecutionResult, Error> {
        self.enter("execute_single_step", |vcpu| vcpu.execute_single_step())
    }

    /// Stops a running [`Self::execute`]; from another thread, use
    /// [`Self::interrupt_handle`].
    pub fn interrupt(&self) -> Result<(), Error> {
        self.enter_shared("interrupt", |core| core.interrupt_handle().interrupt())
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.vcpu.interrupt_handle()
    }

    /// Backs guest physical `[address, address + size)` with host memory.
    ///
    /// # Safety
    ///
    /// `pointer..pointer+size` must stay valid for reads and writes until the
    /// slot is unmapped or the core is dropped.
    pub unsafe fn map_range(
        &mut self,
        slot: u32,
        address: u64,
        size: u64,
        pointer: *mut u8,
    ) -> Result<(), Error> {
        self.enter("map_range", |vcpu| {
            // SAFETY: guaranteed by the caller.
            unsafe { vcpu.map_range(slot, address, size, pointer) }
        })
    }

    pub fn unmap_range(&mut self, slot: u32) -> Result<(), Error> {
        self.enter("unmap_range", |vcpu| vcpu.unmap_range(slot))
    }

    /// Returns the host pointer for guest physical `address` and the bytes
    /// left in its region, or `None` if nothing is mapped there.
    pub fn translate_physical_to_host(
        &self,
        address: u64,
    ) -> Result<Option<(*mut u8, u64)>, Error> {
        self.enter_shared("translate_physical_to_host", |core| {
            Ok(core.vcpu.translate_physical_to_host(address))
        })
    }

    pub fn get_register_value(&mut self, id: u32) -> Result<u64, Error> {
        self.enter("get_register_value", |vcpu| vcpu.read_register(id))
    }

    pub fn set_register_value(&mut self, id: u32, value: u64) -> Result<(), Error> {
        self.enter("set_register_value", |vcpu| vcpu.write_register(id, value))
    }

    fn set_descriptor(
        &mut self,
        entry: &'static str,
        segment: Segment,
        base: u64,
        limit: u32,
        selector: u16,
        flags: u32,
    ) -> Result<(), Error> {
        self.enter(entry, |vcpu| {
            vcpu.set_segment(
                segment,
                SegmentDescriptor {
                    base,
                    limit,
                    selector,
                    flags,
                },
            )
        })
    }

    pub fn set_cs_descriptor(
        &mut self,
        base: u64,
        limit: u32,
        selector: u16,
        flags: u32,
    ) -> Result<(), Error> {
        self.set_descriptor("set_cs_descriptor", Segment::Cs, base, limit, selector, flags)
    }

    pub fn set_ds_descriptor(
        &mut self,
        base: u64,
        limit: u32,
        selector: u16,
        flags: u32,
    ) -> Result<(), Error> {
        self.set_descriptor("set_ds_descriptor", Segment::Ds, base, limit, selector, flags)
    }

    pub fn set_es_descriptor(
        &mut self,
        base: u64,
        limit: u32,
        selector: u16,
        flags: u32,
    ) -> Result<(), Error> {
        self.set_descriptor("set_es_descriptor", Segment::Es, base, limit, selector, flags)
    }

    pub fn set_ss_descriptor(
        &mut self,
        base: u64,
        limit: u32,
        selector: u16,
        flags: u32,
    ) -> Result<(), Error> {
        self.set_descriptor("set_ss_descriptor", Segment::Ss, base, limit, selector, flags)
    }

    pub fn set_fs_descriptor(
        &mut self,
        base: u64,
        limit: u32,
        selector: u16,
        flags: u32,
    ) -> Result<(), Error> {
        self.set_descriptor("set_fs_descriptor", Segment::Fs, base, limit, selector, flags)
    }

    pub fn set_gs_descriptor(
        &mut self,
        base: u64,
        limit: u32,
        selector: u16,
        flags: u32,
    ) -> Result<(), Error> {
        self.set_descriptor("set_gs_descriptor", Segment::Gs, base, limit, selector, flags)
    }

    pub fn add_breakpoint(&mut self, address: u64) -> Result<(), Error> {
        self.enter("add_breakpoint", |vcpu| vcpu.add_breakpoint(address))
    }

    pub fn remove_breakpoint(&mut self, address: u64) -> Result<(), Error> {
        self.enter("remove_breakpoint", |vcpu| {
            vcpu.remove_breakpoint(address);
            Ok(())
        })
    }

    pub fn set_irq(&mut self, level: bool, irq: u32) -> Result<(), Error> {
        self.enter("set_irq", |vcpu| vcpu.set_irq(level, irq))
    }

    /// Wall-clock duration of the last [`Self::execute`].
    pub fn execution_time(&self) -> Duration {
        self.vcpu.execution_time()
    }

    /// The block map, for threads that translate without holding the core.
    pub fn block_map(&self) -> &Arc<HostBlockMap> {
        &self.blocks
    }

    pub fn set_host_blocks(&self, blocks: &[HostBlock]) -> Result<(), Error> {
        self.enter_shared("set_host_blocks", |core| {
            core.blocks.replace_mapping(blocks);
            Ok(())
        })
    }

    pub fn free_host_blocks(&self) -> Result<(), Error> {
        self.enter_shared("free_host_blocks", |core| {
            core.blocks.clear();
            Ok(())
        })
    }

    /// Translates a guest offset to a host pointer, asking the host to fault
    /// the block in if it is not published yet.
    pub fn guest_offset_to_host_ptr(&self, offset: u64) -> Result<*mut u8, Error> {
        self.enter_shared("guest_offset_to_host_ptr", |core| {
            core.blocks.guest_to_host(offset, |map, offset| {
                boundary::guarded("touch_host_block", || {
                    core.host.touch_host_block(map, offset)?;
                    Ok(())
                })
            })
        })
    }

    pub fn host_ptr_to_guest_offset(&self, pointer: *const u8) -> Result<u64, Error> {
        self.enter_shared("host_ptr_to_guest_offset", |core| {
            core.blocks.host_to_guest(pointer)
        })
    }

    #[cfg(test)]
    pub(crate) fn vcpu(&self) -> &Vcpu<F> {
        &self.vcpu
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breakpoint::TRAP_OPCODE;
    use crate::testutil::HostEvent;
    use crate::testutil::RecordingHost;
    use crate::testutil::ScriptedExit;
    use crate::testutil::ScriptedFacility;
    use test_with_tracing::test;

    fn core_with(
        facility: ScriptedFacility,
        host: RecordingHost,
    ) -> (KvmCore<ScriptedFacility>, Arc<RecordingHost>) {
        let host = Arc::new(host);
        let core = KvmCore::with_facility(facility, host.clone(), &CpuConfig::default()).unwrap();
        (core, host)
    }

    fn core(
        exits: impl IntoIterator<Item = ScriptedExit>,
    ) -> (KvmCore<ScriptedFacility>, Arc<RecordingHost>) {
        core_with(ScriptedFacility::new(exits), RecordingHost::default())
    }

    fn aborts(host: &RecordingHost) -> Vec<HostEvent> {
        host.events()
            .into_iter()
            .filter(|e| matches!(e, HostEvent::Abort(_) | HostEvent::RuntimeAbort(..)))
            .collect()
    }

    #[test]
    fn runtime_errors_are_reported_with_pc() {
        let mut facility = ScriptedFacility::new([ScriptedExit::FailEntry(0x80000021)]);
        facility.regs.rip = 0xfff0;
        let (mut core, host) = core_with(facility, RecordingHost::default());

        let result = core.execute(1000);
        assert!(matches!(result, Err(Error::FailEntry(0x80000021))));
        assert_eq!(ExecutionResult::code_of(&result), u64::MAX);
        assert_eq!(
            aborts(&host),
            [HostEvent::RuntimeAbort(
                "KVM_EXIT_FAIL_ENTRY, hardware entry failure reason 0x80000021".into(),
                0xfff0
            )]
        );
        assert_eq!(boundary::depth(), 0);
    }

    #[test]
    fn other_errors_are_reported_without_pc() {
        let (mut core, host) = core([]);
        assert!(core.get_register_value(33).is_err());
        assert_eq!(
            aborts(&host),
            [HostEvent::Abort("read from undefined register 33".into())]
        );
    }

    #[test]
    fn recoverable_errors_are_not_reported() {
        let (mut core, host) = core([]);
        assert!(matches!(core.set_irq(false, 30), Err(Error::IrqOutOfRange(30))));
        core.set_irq(false, 4).unwrap();
        assert!(aborts(&host).is_empty());
    }

    #[test]
    fn host_aborts_are_not_reported_back() {
        let host = RecordingHost {
            failing_port: Some(0x64),
            ..Default::default()
        };
        let (mut core, host) = core_with(
            ScriptedFacility::new([ScriptedExit::IoIn {
                port: 0x64,
                size: 1,
                count: 1,
            }]),
            host,
        );
        assert!(matches!(core.execute(1000), Err(Error::Host(_))));
        assert!(aborts(&host).is_empty());
    }

    #[test]
    fn panicking_callback_unwinds_to_the_entry_point() {
        let host = RecordingHost {
            panicking_port: Some(0x60),
            ..Default::default()
        };
        let (mut core, host) = core_with(
            ScriptedFacility::new([ScriptedExit::IoIn {
                port: 0x60,
                size: 1,
                count: 1,
            }]),
            host,
        );
        let err = core.execute(1000).unwrap_err();
        assert!(matches!(err, Error::CallbackPanic(ref m) if m == "port 0x60 exploded"));
        assert_eq!(boundary::depth(), 0);
        assert!(!core.interrupt_handle().is_executing());
        assert_eq!(core.vcpu().state(), crate::vcpu::RunState::Idle);
        assert_eq!(
            aborts(&host),
            [HostEvent::Abort("host callback panicked: port 0x60 exploded".into())]
        );

        // The core is still usable afterwards.
        assert_eq!(core.execute(100).unwrap(), ExecutionResult::Ok);
    }

    #[test]
    fn memory_and_breakpoints() {
        let mut backing = vec![0xab; 0x1000];
        let (mut core, _host) = core([ScriptedExit::Debug { pc: 0x4000 }]);
        // SAFETY: `backing` outlives `core`.
        unsafe {
            core.map_range(0, 0x4000, 0x1000, backing.as_mut_ptr())
                .unwrap()
        };
        assert_eq!(
            core.translate_physical_to_host(0x4500).unwrap(),
            Some((backing.as_mut_ptr().wrapping_add(0x500), 0xb00))
        );

        core.add_breakpoint(0x4000).unwrap();
        assert_eq!(backing[0], TRAP_OPCODE);
        assert_eq!(
            core.execute(1_000_000).unwrap(),
            ExecutionResult::StoppedAtBreakpoint
        );
        core.remove_breakpoint(0x4000).unwrap();
        assert_eq!(backing[0], 0xab);

        core.unmap_range(0).unwrap();
        core.unmap_range(0).unwrap();
        assert_eq!(core.translate_physical_to_host(0x4500).unwrap(), None);
    }

    #[test]
    fn dispose_restores_breakpoints() {
        let mut backing = vec![0x90; 0x100];
        let (mut core, _host) = core([]);
        // SAFETY: `backing` outlives `core`.
        unsafe {
            core.map_range(2, 0x8000, 0x100, backing.as_mut_ptr())
                .unwrap()
        };
        core.add_breakpoint(0x8010).unwrap();
        assert_eq!(backing[0x10], TRAP_OPCODE);
        core.dispose();
        assert!(backing.iter().all(|b| *b == 0x90));
    }

    #[test]
    fn registers_and_descriptors() {
        let (mut core, _host) = core([]);
        core.set_register_value(Register::Rax as u32, 0x1234).unwrap();
        assert_eq!(core.get_register_value(Register::Rax as u32).unwrap(), 0x1234);

        core.set_ds_descriptor(0x10_0000, 0xffff, 0x18, 0x00cf_9300).unwrap();
        assert_eq!(core.get_register_value(Register::Ds as u32).unwrap(), 0x18);
        core.execute(100).unwrap();

        let ds = core.vcpu().facility().sregs.ds;
        assert_eq!((ds.base, ds.limit, ds.selector), (0x10_0000, 0xffff, 0x18));
        assert_eq!((ds.type_, ds.present, ds.db, ds.g), (3, 1, 1, 1));
    }

    #[test]
    fn host_blocks_fault_in_through_the_host() {
        let mut backing = vec![0u8; 0x200];
        let blocks = [
            HostBlock {
                start: 0x1_0000,
                size: 0x100,
                host_pointer: backing.as_mut_ptr(),
            },
            HostBlock {
                start: 0x2_0000,
                size: 0x100,
                host_pointer: backing[0x100..].as_mut_ptr(),
            },
        ];
        let host = RecordingHost::default();
        *host.touch_blocks.lock() = Some(blocks.to_vec());
        let (core, host) = core_with(ScriptedFacility::new([]), host);

        let pointer = core.guest_offset_to_host_ptr(0x2_0010).unwrap();
        assert_eq!(pointer, blocks[1].host_pointer.wrapping_add(0x10));
        assert_eq!(core.host_ptr_to_guest_offset(pointer).unwrap(), 0x2_0010);
        assert_eq!(host.accesses(), [HostEvent::Touch(0x2_0010)]);

        // Published blocks need no further touches.
        core.guest_offset_to_host_ptr(0x1_00ff).unwrap();
        assert_eq!(host.accesses().len(), 1);

        core.free_host_blocks().unwrap();
        assert!(matches!(
            core.guest_offset_to_host_ptr(0x1_0000),
            Err(Error::UnmappedOffset(0x1_0000))
        ));
        assert!(matches!(
            core.host_ptr_to_guest_offset(pointer),
            Err(Error::PointerNotAllocated(_))
        ));
        assert_eq!(aborts(&host).len(), 2);
    }

    #[test]
    fn host_blocks_published_directly() {
        let mut backing = vec![0u8; 0x40];
        let (core, host) = core([]);
        core.set_host_blocks(&[HostBlock {
            start: 0x40,
            size: 0x40,
            host_pointer: backing.as_mut_ptr(),
        }])
        .unwrap();
        assert_eq!(core.guest_offset_to_host_ptr(0x7f).unwrap(), backing[0x3f..].as_mut_ptr());
        assert!(host.accesses().is_empty());
        assert_eq!(core.block_map().guest_order(), [0x40]);
    }

    #[test]
    fn interrupt_while_idle() {
        let (core, host) = core([]);
        core.interrupt().unwrap();
        assert!(host.events().is_empty());
    }
}
