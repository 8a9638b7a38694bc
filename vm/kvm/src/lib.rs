// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Safe-ish wrappers around the KVM ioctl surface used by the execution core.

#![expect(missing_docs)]
#![cfg(target_os = "linux")]
// UNSAFETY: Calling KVM APIs and IOCTLs and dealing with the raw pointers
// necessary for doing so.
#![expect(unsafe_code)]

mod pthread;
mod timer;

pub use kvm_bindings::*;
pub use pthread::Pthread;
pub use timer::PreemptionTimer;

use nix::sys::signal::SigSet;
use nix::sys::signal::Signal;
use std::fs::File;
use std::io;
use std::os::unix::prelude::*;
use std::path::Path;
use std::sync::OnceLock;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use thiserror::Error;

mod ioctl {
    use kvm_bindings::*;
    use nix::ioctl_read;
    use nix::ioctl_readwrite;
    use nix::ioctl_write_int_bad;
    use nix::ioctl_write_ptr;
    use nix::request_code_none;
    const KVMIO: u8 = 0xae;
    ioctl_write_int_bad!(kvm_get_api_version, request_code_none!(KVMIO, 0x00));
    ioctl_write_int_bad!(kvm_create_vm, request_code_none!(KVMIO, 0x1));
    ioctl_write_int_bad!(kvm_get_vcpu_mmap_size, request_code_none!(KVMIO, 0x04));
    ioctl_readwrite!(kvm_get_supported_cpuid, KVMIO, 0x05, kvm_cpuid2);
    ioctl_write_int_bad!(kvm_create_vcpu, request_code_none!(KVMIO, 0x41));
    ioctl_write_ptr!(
        kvm_set_user_memory_region,
        KVMIO,
        0x46,
        kvm_userspace_memory_region
    );
    ioctl_write_int_bad!(kvm_set_tss_addr, request_code_none!(KVMIO, 0x47));
    ioctl_write_ptr!(kvm_set_identity_map_addr, KVMIO, 0x48, u64);
    ioctl_write_int_bad!(kvm_create_irqchip, request_code_none!(KVMIO, 0x60));
    ioctl_write_ptr!(kvm_irq_line, KVMIO, 0x61, kvm_irq_level);
    ioctl_write_ptr!(kvm_create_pit2, KVMIO, 0x77, kvm_pit_config);
    ioctl_write_int_bad!(kvm_run, request_code_none!(KVMIO, 0x80));
    ioctl_read!(kvm_get_regs, KVMIO, 0x81, kvm_regs);
    ioctl_write_ptr!(kvm_set_regs, KVMIO, 0x82, kvm_regs);
    ioctl_read!(kvm_get_sregs, KVMIO, 0x83, kvm_sregs);
    ioctl_write_ptr!(kvm_set_sregs, KVMIO, 0x84, kvm_sregs);
    ioctl_readwrite!(kvm_translation, KVMIO, 0x85, kvm_translation);
    ioctl_write_ptr!(kvm_set_cpuid2, KVMIO, 0x90, kvm_cpuid2);
    ioctl_write_ptr!(kvm_set_guest_debug, KVMIO, 0x9b, kvm_guest_debug);
}

/// The only KVM API version the execution core understands.
pub const SUPPORTED_API_VERSION: i32 = 12;

/// Signal used both by the quantum timer and by cross-thread kicks.
pub const PREEMPTION_SIGNAL: Signal = Signal::SIGALRM;

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to open {0}")]
    OpenKvm(String, #[source] io::Error),
    #[error("GetApiVersion")]
    GetApiVersion(#[source] nix::Error),
    #[error("SetMemoryRegion")]
    SetMemoryRegion(#[source] nix::Error),
    #[error("CreateVm")]
    CreateVm(#[source] nix::Error),
    #[error("SetIdentityMapAddr")]
    SetIdentityMapAddr(#[source] nix::Error),
    #[error("SetTssAddr")]
    SetTssAddr(#[source] nix::Error),
    #[error("CreateIrqchip")]
    CreateIrqchip(#[source] nix::Error),
    #[error("CreatePit2")]
    CreatePit2(#[source] nix::Error),
    #[error("CreateVCpu")]
    CreateVCpu(#[source] nix::Error),
    #[error("GetRegs")]
    GetRegs(#[source] nix::Error),
    #[error("GetSRegs")]
    GetSRegs(#[source] nix::Error),
    #[error("SetRegs")]
    SetRegs(#[source] nix::Error),
    #[error("SetSRegs")]
    SetSRegs(#[source] nix::Error),
    #[error("Run")]
    Run(#[source] nix::Error),
    #[error("GetVCpuMmapSize")]
    GetVCpuMmapSize(#[source] nix::Error),
    #[error("MmapVCpu")]
    MmapVCpu(#[source] io::Error),
    #[error("GetSupportedCpuid")]
    GetSupportedCpuid(#[source] nix::Error),
    #[error("SetCpuid")]
    SetCpuid(#[source] nix::Error),
    #[error("IrqLine")]
    IrqLine(#[source] nix::Error),
    #[error("TranslateGva")]
    TranslateGva(#[source] nix::Error),
    #[error("SetGuestDebug")]
    SetGuestDebug(#[source] nix::Error),
    #[error("failed to arm the preemption timer")]
    ArmTimer(#[source] nix::Error),
    #[error("unknown exit {0:#x}")]
    UnknownExit(u32),
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Send+Sync wrapper around the mapped kvm_run pointer.
#[derive(Debug)]
struct RunData {
    ptr: *mut kvm_run,
    len: usize,
}

// SAFETY: this type contains a pointer to mapped data. By itself this is
// Send+Sync since it's just a raw pointer value with no methods, but in context
// it must be carefully accessed only by one thread at a time. This is mediated
// by `Processor`, which requires `&mut self` for every access.
unsafe impl Send for RunData {}
// SAFETY: see above comment
unsafe impl Sync for RunData {}

/// An open file to `/dev/kvm`.
#[derive(Debug)]
pub struct Kvm(File);

impl Kvm {
    /// Opens the KVM device at `path`, usually `/dev/kvm`.
    pub fn new(path: &Path) -> Result<Self> {
        let kvm = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| Error::OpenKvm(path.display().to_string(), err))?;

        Ok(Self(kvm))
    }

    pub fn api_version(&self) -> Result<i32> {
        // SAFETY: Calling IOCTL as documented, with no special requirements.
        unsafe { ioctl::kvm_get_api_version(self.as_fd().as_raw_fd(), 0) }
            .map_err(Error::GetApiVersion)
    }

    /// Returns the CPUID values that are supported by the hypervisor.
    pub fn supported_cpuid(&self) -> Result<Vec<kvm_cpuid_entry2>> {
        let mut supported_cpuid = Cpuid {
            cpuid: kvm_cpuid2 {
                nent: MAX_CPUID_ENTRIES as u32,
                ..Default::default()
            },
            entries: [Default::default(); MAX_CPUID_ENTRIES],
        };

        // SAFETY: We have allocated an array for the ioctl to write to and correctly specified its size in nent.
        unsafe {
            ioctl::kvm_get_supported_cpuid(self.as_fd().as_raw_fd(), &mut supported_cpuid.cpuid)
                .map_err(Error::GetSupportedCpuid)?;
        }

        Ok(supported_cpuid.entries[..supported_cpuid.cpuid.nent as usize].to_vec())
    }

    pub fn new_vm(&self) -> Result<Partition> {
        // SAFETY: Calling IOCTL as documented, with no special requirements.
        let vm = unsafe {
            let fd = ioctl::kvm_create_vm(self.as_fd().as_raw_fd(), 0).map_err(Error::CreateVm)?;
            File::from_raw_fd(fd)
        };

        // SAFETY: Calling IOCTL as documented, with no special requirements.
        let mmap_size = unsafe {
            ioctl::kvm_get_vcpu_mmap_size(self.as_fd().as_raw_fd(), 0)
                .map_err(Error::GetVCpuMmapSize)? as usize
        };

        Ok(Partition { vm, mmap_size })
    }
}

impl AsFd for Kvm {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

const MAX_CPUID_ENTRIES: usize = 256;

#[repr(C)]
struct Cpuid {
    cpuid: kvm_cpuid2,
    entries: [kvm_cpuid_entry2; MAX_CPUID_ENTRIES],
}

/// A KVM virtual machine.
#[derive(Debug)]
pub struct Partition {
    vm: File,
    mmap_size: usize,
}

impl Partition {
    /// Places the three-page identity map used by VMX real mode at `addr`.
    pub fn set_identity_map_addr(&self, addr: u64) -> Result<()> {
        // SAFETY: Calling IOCTL as documented, with no special requirements.
        unsafe {
            ioctl::kvm_set_identity_map_addr(self.vm.as_raw_fd(), &addr)
                .map_err(Error::SetIdentityMapAddr)?;
        }
        Ok(())
    }

    pub fn set_tss_addr(&self, addr: u32) -> Result<()> {
        // The kernel takes the address as an unsigned int passed by value.
        // SAFETY: Calling IOCTL as documented, with no special requirements.
        unsafe {
            ioctl::kvm_set_tss_addr(self.vm.as_raw_fd(), addr as i32)
                .map_err(Error::SetTssAddr)?;
        }
        Ok(())
    }

    pub fn create_irqchip(&self) -> Result<()> {
        // SAFETY: Calling IOCTL as documented, with no special requirements.
        unsafe {
            ioctl::kvm_create_irqchip(self.vm.as_raw_fd(), 0).map_err(Error::CreateIrqchip)?;
        }
        Ok(())
    }

    /// Creates the in-kernel PIT with a dummy speaker port.
    pub fn create_pit2(&self) -> Result<()> {
        let config = kvm_pit_config {
            flags: KVM_PIT_SPEAKER_DUMMY,
            ..Default::default()
        };
        // SAFETY: Calling IOCTL as documented, with no special requirements.
        unsafe {
            ioctl::kvm_create_pit2(self.vm.as_raw_fd(), &config).map_err(Error::CreatePit2)?;
        }
        Ok(())
    }

    /// Installs, moves or (with `size == 0`) deletes the memory slot `slot`.
    ///
    /// # Safety
    ///
    /// `data..data+size` must be and remain an allocated VA range until the
    /// partition is destroyed or the slot is deleted.
    pub unsafe fn set_user_memory_region(
        &self,
        slot: u32,
        data: *mut u8,
        size: u64,
        addr: u64,
    ) -> Result<()> {
        let region = kvm_userspace_memory_region {
            slot,
            flags: 0,
            guest_phys_addr: addr,
            memory_size: size,
            userspace_addr: data as usize as u64,
        };
        // SAFETY: the caller guarantees the lifetime of the host range.
        unsafe {
            ioctl::kvm_set_user_memory_region(self.vm.as_raw_fd(), &region)
                .map_err(Error::SetMemoryRegion)?;
        }
        Ok(())
    }

    pub fn irq_line(&self, gsi: u32, level: bool) -> Result<()> {
        // SAFETY: Calling IOCTL as documented, with no special requirements.
        unsafe {
            ioctl::kvm_irq_line(
                self.vm.as_raw_fd(),
                &kvm_irq_level {
                    __bindgen_anon_1: kvm_irq_level__bindgen_ty_1 { irq: gsi },
                    level: level.into(),
                },
            )
            .map_err(Error::IrqLine)?;
        }
        Ok(())
    }

    pub fn add_vp(&self, vcpu_idx: u32) -> Result<Processor> {
        // SAFETY: Calling IOCTL as documented, with no special requirements.
        let vcpu = unsafe {
            let fd = ioctl::kvm_create_vcpu(self.vm.as_raw_fd(), vcpu_idx as i32)
                .map_err(Error::CreateVCpu)?;
            File::from_raw_fd(fd)
        };

        // SAFETY: Calling mmap with a null pointer is valid, and vcpu is guaranteed to have a valid fd.
        let ptr = unsafe {
            let ptr = libc::mmap(
                std::ptr::null_mut(),
                self.mmap_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                vcpu.as_raw_fd(),
                0,
            );
            if ptr == libc::MAP_FAILED {
                return Err(Error::MmapVCpu(io::Error::last_os_error()));
            }
            ptr
        };

        Ok(Processor {
            vcpu,
            run_data: RunData {
                ptr: ptr.cast(),
                len: self.mmap_size,
            },
        })
    }
}

/// A virtual processor together with its mapped `kvm_run` page.
#[derive(Debug)]
pub struct Processor {
    vcpu: File,
    run_data: RunData,
}

impl Drop for Processor {
    fn drop(&mut self) {
        // SAFETY: the mapping was created in `Partition::add_vp` with this
        // length and nothing else references it once the processor is gone.
        let ret = unsafe { libc::munmap(self.run_data.ptr.cast(), self.run_data.len) };
        if ret != 0 {
            tracing::error!(
                error = &io::Error::last_os_error() as &dyn std::error::Error,
                "failed to unmap kvm_run"
            );
        }
    }
}

impl Processor {
    pub fn set_cpuid(&self, entries: &[kvm_cpuid_entry2]) -> Result<()> {
        assert!(entries.len() <= MAX_CPUID_ENTRIES);

        let mut cpuid: Cpuid = Cpuid {
            cpuid: Default::default(),
            entries: [Default::default(); MAX_CPUID_ENTRIES],
        };
        for (i, e) in entries.iter().enumerate() {
            cpuid.entries[i] = *e;
            cpuid.cpuid.nent += 1;
        }

        // SAFETY: Our Cpuid type puts the entries array immediately after the header in memory, as required.
        unsafe {
            ioctl::kvm_set_cpuid2(self.vcpu.as_raw_fd(), &cpuid.cpuid).map_err(Error::SetCpuid)?;
        }
        Ok(())
    }

    pub fn get_regs(&self) -> Result<kvm_regs> {
        let mut regs = Default::default();
        // SAFETY: Calling IOCTL as documented, with no special requirements.
        unsafe {
            ioctl::kvm_get_regs(self.vcpu.as_raw_fd(), &mut regs).map_err(Error::GetRegs)?;
        }
        Ok(regs)
    }

    pub fn set_regs(&self, regs: &kvm_regs) -> Result<()> {
        // SAFETY: Calling IOCTL as documented, with no special requirements.
        unsafe {
            ioctl::kvm_set_regs(self.vcpu.as_raw_fd(), regs).map_err(Error::SetRegs)?;
        }
        Ok(())
    }

    pub fn get_sregs(&self) -> Result<kvm_sregs> {
        let mut sregs = Default::default();
        // SAFETY: Calling IOCTL as documented, with no special requirements.
        unsafe {
            ioctl::kvm_get_sregs(self.vcpu.as_raw_fd(), &mut sregs).map_err(Error::GetSRegs)?;
        }
        Ok(sregs)
    }

    pub fn set_sregs(&self, sregs: &kvm_sregs) -> Result<()> {
        // SAFETY: Calling IOCTL as documented, with no special requirements.
        unsafe {
            ioctl::kvm_set_sregs(self.vcpu.as_raw_fd(), sregs).map_err(Error::SetSRegs)?;
        }
        Ok(())
    }

    /// Translates a guest virtual address through the current guest page
    /// tables.
    pub fn translate_gva(&self, gva: u64) -> Result<kvm_translation> {
        let mut translation = kvm_translation {
            linear_address: gva,
            ..Default::default()
        };

        // SAFETY: Calling IOCTL as documented, with no special requirements.
        unsafe {
            ioctl::kvm_translation(self.vcpu.as_raw_fd(), &mut translation)
                .map_err(Error::TranslateGva)?;
        }

        Ok(translation)
    }

    /// Sets the guest debugging `control` bits (`KVM_GUESTDBG_*`).
    ///
    /// Hardware breakpoints are not used, so the debug registers are zeroed.
    pub fn set_guest_debug(&self, control: u32) -> Result<()> {
        let debug = kvm_guest_debug {
            control,
            pad: 0,
            arch: kvm_guest_debug_arch { debugreg: [0; 8] },
        };

        // SAFETY: Calling IOCTL as documented, with no special requirements.
        unsafe {
            ioctl::kvm_set_guest_debug(self.vcpu.as_raw_fd(), &debug)
                .map_err(Error::SetGuestDebug)?;
        }
        Ok(())
    }

    fn run_data(&mut self) -> &mut kvm_run {
        // SAFETY: there are no other references to this data right
        // now since `&mut self` is held, and the VP is not running (so the
        // kernel is not mutating the structure either).
        unsafe { &mut *self.run_data.ptr }
    }

    fn run_data_slice(&mut self) -> &mut [u8] {
        // SAFETY: see `run_data`.
        unsafe { std::slice::from_raw_parts_mut(self.run_data.ptr.cast::<u8>(), self.run_data.len) }
    }

    /// Issues an IOCTL to run the VP.
    fn run_vp_once(&mut self) -> Result<bool> {
        CURRENT_KVM_RUN.with(|r| {
            // Clear immediate_exit before giving up exclusive ownership of the
            // kvm_run structure.
            self.run_data().immediate_exit = 0;

            let ptr = self.run_data.ptr;
            // Swap the kvm_run structure pointer in so the signal handler can set
            // immediate_exit if the signal arrives just before the kvm_run ioctl.
            match r.swap(ptr as usize, Ordering::Relaxed) {
                NO_KVM_RUN => {}
                CANCEL_KVM_RUN => {
                    // A preemption signal arrived before the swap. Set
                    // immediate_exit so that the IOCTL returns before actually
                    // running the VP.
                    //
                    // SAFETY: the signal thread that might access the structure
                    // will also use `set_immediate_exit`.
                    unsafe { set_immediate_exit(ptr) };
                }
                state => unreachable!("unexpected state {:#x}", state),
            }

            // SAFETY: Calling IOCTL as documented, with no special requirements.
            let result = unsafe { ioctl::kvm_run(self.vcpu.as_raw_fd(), 0) };
            r.store(NO_KVM_RUN, Ordering::Relaxed);
            match result {
                Ok(_) => Ok(true),
                Err(nix::errno::Errno::EINTR | nix::errno::Errno::EAGAIN) => Ok(false),
                Err(err) => Err(Error::Run(err)),
            }
        })
    }

    /// Runs the VP until the next exit or until the thread is interrupted by
    /// [`PREEMPTION_SIGNAL`].
    pub fn run(&mut self) -> Result<Exit<'_>> {
        if !self.run_vp_once()? {
            return Ok(Exit::Interrupted);
        }

        let exit = match self.run_data().exit_reason {
            KVM_EXIT_DEBUG => {
                // SAFETY: this is the active union field.
                let debug = unsafe { &self.run_data().__bindgen_anon_1.debug };
                Exit::Debug {
                    exception: debug.arch.exception,
                    pc: debug.arch.pc,
                    dr6: debug.arch.dr6,
                    dr7: debug.arch.dr7,
                }
            }
            KVM_EXIT_IO => {
                // SAFETY: this is the active union field.
                let io = unsafe { self.run_data().__bindgen_anon_1.io };

                let offset = io.data_offset as usize;
                let data = &mut self.run_data_slice()
                    [offset..offset + io.size as usize * io.count as usize];
                if io.direction == KVM_EXIT_IO_IN as u8 {
                    Exit::IoIn {
                        port: io.port,
                        size: io.size,
                        data,
                    }
                } else {
                    Exit::IoOut {
                        port: io.port,
                        size: io.size,
                        data,
                    }
                }
            }
            KVM_EXIT_MMIO => {
                // SAFETY: this is the active union field.
                let mmio = unsafe { &mut self.run_data().__bindgen_anon_1.mmio };
                let len = (mmio.len as usize).min(mmio.data.len());
                if mmio.is_write != 0 {
                    Exit::MmioWrite {
                        address: mmio.phys_addr,
                        len: mmio.len,
                        data: &mmio.data[..len],
                    }
                } else {
                    mmio.data = [0; 8];
                    Exit::MmioRead {
                        address: mmio.phys_addr,
                        len: mmio.len,
                        data: &mut mmio.data[..len],
                    }
                }
            }
            KVM_EXIT_SHUTDOWN => Exit::Shutdown,
            KVM_EXIT_FAIL_ENTRY => {
                // SAFETY: this is the active union field.
                let fail_entry = unsafe { &self.run_data().__bindgen_anon_1.fail_entry };
                Exit::FailEntry {
                    hardware_entry_failure_reason: fail_entry.hardware_entry_failure_reason,
                }
            }
            KVM_EXIT_INTERNAL_ERROR => {
                // SAFETY: this is the active union field.
                let internal = unsafe { &self.run_data().__bindgen_anon_1.internal };
                let ndata = (internal.ndata as usize).min(internal.data.len());
                Exit::InternalError {
                    error: internal.suberror,
                    data: &internal.data[..ndata],
                }
            }
            exit_reason => return Err(Error::UnknownExit(exit_reason)),
        };
        Ok(exit)
    }
}

#[derive(Debug)]
pub enum Exit<'a> {
    /// The run call returned early because of [`PREEMPTION_SIGNAL`].
    Interrupted,
    IoIn {
        port: u16,
        size: u8,
        data: &'a mut [u8],
    },
    IoOut {
        port: u16,
        size: u8,
        data: &'a [u8],
    },
    /// `len` is the access width reported by KVM; `data` is clamped to the
    /// eight bytes of the exit buffer.
    MmioRead {
        address: u64,
        len: u32,
        data: &'a mut [u8],
    },
    MmioWrite {
        address: u64,
        len: u32,
        data: &'a [u8],
    },
    Debug {
        exception: u32,
        pc: u64,
        dr6: u64,
        dr7: u64,
    },
    Shutdown,
    FailEntry {
        hardware_entry_failure_reason: u64,
    },
    InternalError {
        error: u32,
        data: &'a [u64],
    },
}

/// Sets up the handler for [`PREEMPTION_SIGNAL`] that causes
/// [`Processor::run`] to return.
///
/// Must succeed before arming a [`PreemptionTimer`] or kicking a thread, since
/// the default disposition of the signal terminates the process. Calling it
/// more than once is harmless. The signal is also unblocked on the calling
/// thread.
pub fn init() -> io::Result<()> {
    install_signal_handler()?;
    unblock_preemption_signal()
}

/// Unblocks [`PREEMPTION_SIGNAL`] on the calling thread.
///
/// Embedders often block signals on their threads. A blocked signal stays
/// pending and never breaks the thread out of `KVM_RUN`.
pub fn unblock_preemption_signal() -> io::Result<()> {
    let mut signals = SigSet::empty();
    signals.add(PREEMPTION_SIGNAL);
    signals.thread_unblock()?;
    Ok(())
}

fn install_signal_handler() -> io::Result<()> {
    static SIGNAL_HANDLER_INIT: OnceLock<Result<(), (io::ErrorKind, String)>> = OnceLock::new();
    SIGNAL_HANDLER_INIT
        .get_or_init(|| {
            let handler = || {
                CURRENT_KVM_RUN.with(|run| {
                    // This interrupts the other code that accesses CURRENT_KVM_RUN, so a
                    // compare_exchange is not necessary.
                    let rdata = run.load(Ordering::Relaxed);
                    match rdata {
                        NO_KVM_RUN => run.store(CANCEL_KVM_RUN, Ordering::Relaxed),
                        CANCEL_KVM_RUN => {}
                        _ => {
                            // SAFETY: other concurrent accesses to the structure are via
                            // `set_immediate_exit` or via atomic accesses in the kernel.
                            unsafe { set_immediate_exit(rdata as *mut kvm_run) };
                        }
                    }
                })
            };
            // Ensure the thread local is initialized.
            CURRENT_KVM_RUN.with(|value| {
                std::hint::black_box(value);
            });
            // SAFETY: The signal handler does not perform any actions that are forbidden
            // for signal handlers to perform, as it only performs thread-local and atomic
            // reads and writes. We are guaranteed to not interrupt thread local initialization
            // as we have ensured it is initialized above.
            unsafe { signal_hook::low_level::register(PREEMPTION_SIGNAL as i32, handler) }
                .map(drop)
                .map_err(|err| (err.kind(), err.to_string()))
        })
        .clone()
        .map_err(|(kind, message)| io::Error::new(kind, message))
}

const NO_KVM_RUN: usize = 0;
const CANCEL_KVM_RUN: usize = 1;

thread_local! {
    static CURRENT_KVM_RUN: AtomicUsize = const { AtomicUsize::new(NO_KVM_RUN) };
}

/// Sets `rdata.immediate_exit` to 1 without constructing a mutable reference.
///
/// This can be used when the kvm_run is aliased by the kernel or by other
/// threads that might call this function.
unsafe fn set_immediate_exit(rdata: *mut kvm_run) {
    // SAFETY: rdata may be aliased by the kernel right now, so it's
    // not safe to construct a mutable reference to it. Use an
    // atomic store to carefully write without requiring a mutable
    // reference.
    unsafe {
        (*(std::ptr::addr_of!((*rdata).immediate_exit).cast::<AtomicU8>()))
            .store(1, Ordering::Relaxed);
    }
}
