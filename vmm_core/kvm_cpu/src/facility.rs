// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The virtualization facility as seen by the execution controller.

use crate::CpuConfig;
use crate::Error;
use kvm::Exit;
use kvm::kvm_regs;
use kvm::kvm_sregs;
use std::time::Duration;

/// Guest debug configuration of the vCPU.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DebugMode {
    /// Software breakpoints (`int3`) exit to the core. This is the normal
    /// configuration.
    Capture,
    /// Every instruction exits to the core; breakpoints are not captured.
    SingleStep,
}

impl DebugMode {
    /// The `KVM_GUESTDBG_*` control bits for this mode.
    pub fn control(self) -> u32 {
        match self {
            DebugMode::Capture => kvm::KVM_GUESTDBG_ENABLE | kvm::KVM_GUESTDBG_USE_SW_BP,
            DebugMode::SingleStep => kvm::KVM_GUESTDBG_ENABLE | kvm::KVM_GUESTDBG_SINGLESTEP,
        }
    }
}

/// One vCPU of one VM, plus the preemption timer of the thread running it.
pub trait Facility {
    fn get_regs(&mut self) -> Result<kvm_regs, kvm::Error>;
    fn set_regs(&mut self, regs: &kvm_regs) -> Result<(), kvm::Error>;
    fn get_sregs(&mut self) -> Result<kvm_sregs, kvm::Error>;
    fn set_sregs(&mut self, sregs: &kvm_sregs) -> Result<(), kvm::Error>;

    /// Translates a guest virtual address through the guest's page tables,
    /// returning `None` if it is not mapped.
    fn translate_gva(&mut self, gva: u64) -> Result<Option<u64>, kvm::Error>;

    fn set_guest_debug(&mut self, mode: DebugMode) -> Result<(), kvm::Error>;

    /// Installs, moves or (with `size == 0`) deletes memory slot `slot`.
    ///
    /// # Safety
    ///
    /// `host..host+size` must stay allocated until the slot is deleted or
    /// the facility is dropped.
    unsafe fn set_user_memory_region(
        &mut self,
        slot: u32,
        guest_address: u64,
        size: u64,
        host: *mut u8,
    ) -> Result<(), kvm::Error>;

    fn set_irq_line(&mut self, irq: u32, level: bool) -> Result<(), kvm::Error>;

    /// Arms the one-shot preemption timer for the calling thread.
    fn arm_timer(&mut self, quantum: Duration) -> Result<(), kvm::Error>;
    fn disarm_timer(&mut self);

    /// Runs the vCPU until its next exit.
    fn run(&mut self) -> Result<Exit<'_>, kvm::Error>;
}

/// The real thing: `/dev/kvm`.
#[derive(Debug)]
pub struct KvmFacility {
    // Field order is drop order: the vCPU goes before its VM.
    timer: Option<kvm::PreemptionTimer>,
    processor: kvm::Processor,
    partition: kvm::Partition,
    _kvm: kvm::Kvm,
}

impl KvmFacility {
    /// Opens KVM and builds a VM with an in-kernel irqchip and PIT and a
    /// single vCPU that reports the host's full supported CPUID set.
    pub fn open(config: &CpuConfig) -> Result<Self, Error> {
        let kvm = kvm::Kvm::new(&config.device_path).map_err(Error::Unavailable)?;
        let version = kvm.api_version()?;
        if version != kvm::SUPPORTED_API_VERSION {
            return Err(Error::UnsupportedApiVersion {
                found: version,
                expected: kvm::SUPPORTED_API_VERSION,
            });
        }

        let partition = kvm.new_vm()?;
        partition.set_identity_map_addr(config.identity_map_addr)?;
        // The TSS must live below 4GB.
        partition.set_tss_addr(config.tss_addr() as u32)?;
        partition.create_irqchip()?;
        partition.create_pit2()?;

        let processor = partition.add_vp(0)?;
        processor.set_cpuid(&kvm.supported_cpuid()?)?;

        tracing::debug!(
            path = %config.device_path.display(),
            identity_map = config.identity_map_addr,
            "kvm processor created"
        );

        Ok(Self {
            timer: None,
            processor,
            partition,
            _kvm: kvm,
        })
    }
}

impl Facility for KvmFacility {
    fn get_regs(&mut self) -> Result<kvm_regs, kvm::Error> {
        self.processor.get_regs()
    }

    fn set_regs(&mut self, regs: &kvm_regs) -> Result<(), kvm::Error> {
        self.processor.set_regs(regs)
    }

    fn get_sregs(&mut self) -> Result<kvm_sregs, kvm::Error> {
        self.processor.get_sregs()
    }

    fn set_sregs(&mut self, sregs: &kvm_sregs) -> Result<(), kvm::Error> {
        self.processor.set_sregs(sregs)
    }

    fn translate_gva(&mut self, gva: u64) -> Result<Option<u64>, kvm::Error> {
        let translation = self.processor.translate_gva(gva)?;
        Ok((translation.valid != 0).then_some(translation.physical_address))
    }

    fn set_guest_debug(&mut self, mode: DebugMode) -> Result<(), kvm::Error> {
        self.processor.set_guest_debug(mode.control())
    }

    unsafe fn set_user_memory_region(
        &mut self,
        slot: u32,
        guest_address: u64,
        size: u64,
        host: *mut u8,
    ) -> Result<(), kvm::Error> {
        // SAFETY: guaranteed by the caller.
        unsafe {
            self.partition
                .set_user_memory_region(slot, host, size, guest_address)
        }
    }

    fn set_irq_line(&mut self, irq: u32, level: bool) -> Result<(), kvm::Error> {
        self.partition.irq_line(irq, level)
    }

    fn arm_timer(&mut self, quantum: Duration) -> Result<(), kvm::Error> {
        // Drop any previous timer first so two are never pending at once.
        self.timer = None;
        self.timer = Some(kvm::PreemptionTimer::arm(quantum)?);
        Ok(())
    }

    fn disarm_timer(&mut self) {
        self.timer = None;
    }

    fn run(&mut self) -> Result<Exit<'_>, kvm::Error> {
        self.processor.run()
    }
}
