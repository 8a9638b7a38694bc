// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The execution controller: runs the vCPU in quanta and dispatches its exits.

use crate::AccessPolicy;
use crate::CpuConfig;
use crate::Error;
use crate::breakpoint::Breakpoints;
use crate::facility::DebugMode;
use crate::facility::Facility;
use crate::host::Host;
use crate::memory::MemoryRegionTable;
use crate::regs::RegisterCache;
use crate::regs::Segment;
use crate::regs::SegmentDescriptor;
use kvm::Exit;
use kvm::Pthread;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

/// Shortest quantum the timer can be armed with.
pub const MIN_QUANTUM: Duration = Duration::from_micros(1);

/// Highest interrupt line of the in-kernel IOAPIC.
pub const MAX_IRQ: u32 = 24;

/// How an execution ended, as the numeric codes the host expects.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u64)]
pub enum ExecutionResult {
    Ok = 0x10000,
    StoppedAtBreakpoint = 0x10002,
    SingleStepped = 0x10003,
    /// Reported in place of a fatal error.
    Aborted = u64::MAX,
}

impl ExecutionResult {
    pub fn code(self) -> u64 {
        self as u64
    }

    /// The code for the outcome of an execute call.
    pub fn code_of(result: &Result<Self, Error>) -> u64 {
        result.as_ref().map_or(Self::Aborted, |r| *r).code()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Executing,
    SingleStepping,
}

#[derive(Debug, Default)]
struct ExecutionControl {
    executing: AtomicBool,
    exit_requested: AtomicBool,
    thread: RwLock<Option<Pthread>>,
}

/// Marks an execution in progress on the current thread until dropped.
struct Executing(Arc<ExecutionControl>);

impl Executing {
    fn enter(control: &Arc<ExecutionControl>) -> Self {
        *control.thread.write() = Some(Pthread::current());
        control.executing.store(true, Ordering::SeqCst);
        Self(control.clone())
    }
}

impl Drop for Executing {
    fn drop(&mut self) {
        let control = &self.0;
        control.executing.store(false, Ordering::SeqCst);
        *control.thread.write() = None;
        control.exit_requested.store(false, Ordering::SeqCst);
    }
}

/// Stops an execution from any thread.
#[derive(Debug, Clone)]
pub struct InterruptHandle(Arc<ExecutionControl>);

impl InterruptHandle {
    /// Asks the current execution, if any, to return as soon as possible.
    ///
    /// The executing thread is kicked out of the vCPU with the preemption
    /// signal unless it is the calling thread.
    pub fn interrupt(&self) -> Result<(), Error> {
        let control = &self.0;
        if !control.executing.load(Ordering::SeqCst) {
            return Ok(());
        }
        control.exit_requested.store(true, Ordering::SeqCst);

        // Held across the kick: the executing thread clears its identity
        // under the write lock before it can return, so the handle stays
        // valid while it is signaled.
        let thread = control.thread.read();
        match *thread {
            Some(thread) if thread != Pthread::current() => thread
                .signal(kvm::PREEMPTION_SIGNAL)
                .map_err(Error::Kick),
            _ => Ok(()),
        }
    }

    pub fn is_executing(&self) -> bool {
        self.0.executing.load(Ordering::SeqCst)
    }
}

/// What to do after dispatching one exit.
#[derive(Debug)]
enum Step {
    Continue,
    Interrupted,
    Stop(ExecutionResult),
    /// Debug trap in single-step mode.
    Stepped,
    /// Debug trap at an address with no breakpoint.
    UnexpectedTrap(u64),
}

/// A single virtual processor.
pub struct Vcpu<F: Facility> {
    facility: F,
    host: Arc<dyn Host>,
    mmio_alignment: AccessPolicy,
    registers: RegisterCache,
    memory: MemoryRegionTable,
    breakpoints: Breakpoints,
    state: RunState,
    control: Arc<ExecutionControl>,
    execution_time: Duration,
}

impl<F: Facility> Vcpu<F> {
    /// Wraps a freshly created vCPU and arms breakpoint capture.
    pub fn new(mut facility: F, host: Arc<dyn Host>, config: &CpuConfig) -> Result<Self, Error> {
        kvm::init().map_err(Error::SignalHandler)?;
        facility.set_guest_debug(DebugMode::Capture)?;
        Ok(Self {
            facility,
            host,
            mmio_alignment: config.mmio_alignment,
            registers: RegisterCache::new(),
            memory: MemoryRegionTable::new(),
            breakpoints: Breakpoints::new(),
            state: RunState::Idle,
            control: Arc::new(ExecutionControl::default()),
            execution_time: Duration::ZERO,
        })
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle(self.control.clone())
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Wall-clock duration of the last [`Self::execute`].
    pub fn execution_time(&self) -> Duration {
        self.execution_time
    }

    pub fn facility(&self) -> &F {
        &self.facility
    }

    pub fn memory(&self) -> &MemoryRegionTable {
        &self.memory
    }

    pub fn breakpoints(&self) -> &Breakpoints {
        &self.breakpoints
    }

    pub fn registers(&self) -> &RegisterCache {
        &self.registers
    }

    /// Runs the guest for about `quantum` of wall-clock time.
    ///
    /// Returns early at a breakpoint, on [`InterruptHandle::interrupt`], or
    /// with an error when an exit cannot be handled.
    pub fn execute(&mut self, quantum: Duration) -> Result<ExecutionResult, Error> {
        kvm::unblock_preemption_signal().map_err(Error::SignalHandler)?;
        let _executing = Executing::enter(&self.control);
        let start = Instant::now();
        self.state = RunState::Executing;
        let result = self.run_quantum(quantum);
        self.facility.disarm_timer();
        self.state = RunState::Idle;
        self.execution_time = start.elapsed();
        tracing::trace!(
            ?result,
            elapsed_us = self.execution_time.as_micros() as u64,
            "execution finished"
        );
        result
    }

    fn run_quantum(&mut self, quantum: Duration) -> Result<ExecutionResult, Error> {
        self.registers.flush(&mut self.facility)?;
        let quantum = quantum.max(MIN_QUANTUM);
        let deadline = Instant::now() + quantum;
        self.facility.arm_timer(quantum)?;

        loop {
            if self.control.exit_requested.swap(false, Ordering::SeqCst)
                || Instant::now() >= deadline
            {
                return Ok(ExecutionResult::Ok);
            }
            match self.run_once(false)? {
                Step::Continue | Step::Interrupted => {}
                Step::Stop(result) => return Ok(result),
                // Only a stray step trap from the hardware; nothing to resume.
                Step::Stepped => return Ok(ExecutionResult::Ok),
                Step::UnexpectedTrap(pc) => {
                    if let Some(result) = self.recover_from_trap(pc)? {
                        return Ok(result);
                    }
                }
            }
        }
    }

    /// Executes exactly one guest instruction.
    pub fn execute_single_step(&mut self) -> Result<ExecutionResult, Error> {
        kvm::unblock_preemption_signal().map_err(Error::SignalHandler)?;
        let _executing = Executing::enter(&self.control);
        self.registers.flush(&mut self.facility)?;
        let step = self.step_once();
        self.state = RunState::Idle;
        Ok(match step? {
            Step::Stepped => ExecutionResult::SingleStepped,
            Step::Stop(result) => result,
            Step::Continue | Step::Interrupted | Step::UnexpectedTrap(_) => ExecutionResult::Ok,
        })
    }

    /// Runs once in single-step mode and restores breakpoint capture,
    /// whatever the outcome.
    ///
    /// A run cut short by a signal has not stepped yet and is retried, unless
    /// an exit was requested.
    fn step_once(&mut self) -> Result<Step, Error> {
        self.facility.set_guest_debug(DebugMode::SingleStep)?;
        self.state = RunState::SingleStepping;
        let step = loop {
            match self.run_once(true) {
                Ok(Step::Interrupted) if !self.control.exit_requested.load(Ordering::SeqCst) => {}
                step => break step,
            }
        };
        let restored = self.facility.set_guest_debug(DebugMode::Capture);
        let step = step?;
        restored?;
        Ok(step)
    }

    /// Steps over an `int3` that is not one of ours (the guest's own, or one
    /// removed while the vCPU was stopped on it) and carries on.
    ///
    /// Returns the result that ends the execution, if the step produced one.
    fn recover_from_trap(&mut self, pc: u64) -> Result<Option<ExecutionResult>, Error> {
        tracing::debug!(pc, "unexpected debug trap, stepping over it");
        let step = self.step_once();
        self.state = RunState::Executing;
        Ok(match step? {
            Step::Stop(result) => Some(result),
            Step::Continue | Step::Interrupted | Step::Stepped | Step::UnexpectedTrap(_) => None,
        })
    }

    fn run_once(&mut self, single_step: bool) -> Result<Step, Error> {
        let exit = self.facility.run()?;
        tracing::trace!(?exit, "exit");
        dispatch(
            exit,
            &*self.host,
            &self.breakpoints,
            self.mmio_alignment,
            single_step,
        )
    }

    /// Puts the controller back into a runnable state after a panic unwound
    /// out of an execution.
    pub(crate) fn reset_after_unwind(&mut self) {
        self.facility.disarm_timer();
        if self.state == RunState::SingleStepping {
            if let Err(err) = self.facility.set_guest_debug(DebugMode::Capture) {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "failed to restore breakpoint capture"
                );
            }
        }
        self.state = RunState::Idle;
    }

    pub fn read_register(&mut self, id: u32) -> Result<u64, Error> {
        self.registers.read(&mut self.facility, id)
    }

    pub fn write_register(&mut self, id: u32, value: u64) -> Result<(), Error> {
        self.registers.write(&mut self.facility, id, value)
    }

    pub fn set_segment(
        &mut self,
        segment: Segment,
        descriptor: SegmentDescriptor,
    ) -> Result<(), Error> {
        self.registers
            .set_segment(&mut self.facility, segment, descriptor)
    }

    /// # Safety
    ///
    /// See [`MemoryRegionTable::map`].
    pub unsafe fn map_range(
        &mut self,
        slot: u32,
        guest_address: u64,
        size: u64,
        host_pointer: *mut u8,
    ) -> Result<(), Error> {
        // SAFETY: guaranteed by the caller.
        unsafe {
            self.memory
                .map(&mut self.facility, slot, guest_address, size, host_pointer)
        }
    }

    pub fn unmap_range(&mut self, slot: u32) -> Result<(), Error> {
        self.memory.unmap(&mut self.facility, slot)
    }

    pub fn translate_physical_to_host(&self, address: u64) -> Option<(*mut u8, u64)> {
        self.memory.translate(address)
    }

    pub fn add_breakpoint(&mut self, address: u64) -> Result<(), Error> {
        self.breakpoints
            .add(&mut self.facility, &self.memory, address)
    }

    pub fn remove_breakpoint(&mut self, address: u64) {
        self.breakpoints.remove(&self.memory, address)
    }

    /// Drives IOAPIC input `irq`.
    pub fn set_irq(&mut self, level: bool, irq: u32) -> Result<(), Error> {
        if irq > MAX_IRQ {
            return Err(Error::IrqOutOfRange(irq));
        }
        self.facility.set_irq_line(irq, level)?;
        Ok(())
    }
}

impl<F: Facility> Drop for Vcpu<F> {
    fn drop(&mut self) {
        self.breakpoints.clear(&self.memory);
        self.memory.clear();
        tracing::debug!("vcpu torn down");
    }
}

fn dispatch(
    exit: Exit<'_>,
    host: &dyn Host,
    breakpoints: &Breakpoints,
    mmio_alignment: AccessPolicy,
    single_step: bool,
) -> Result<Step, Error> {
    match exit {
        Exit::Interrupted => return Ok(Step::Interrupted),
        Exit::IoIn { port, size, data } => {
            check_io_width(port, size)?;
            for chunk in data.chunks_exact_mut(size.into()) {
                read_port(host, port, chunk)?;
            }
        }
        Exit::IoOut { port, size, data } => {
            check_io_width(port, size)?;
            for chunk in data.chunks_exact(size.into()) {
                write_port(host, port, chunk)?;
            }
        }
        Exit::MmioRead { address, len, data } => {
            check_mmio(address, len, mmio_alignment)?;
            read_bus(host, address, data)?;
        }
        Exit::MmioWrite { address, len, data } => {
            check_mmio(address, len, mmio_alignment)?;
            write_bus(host, address, data)?;
        }
        Exit::Debug { pc, .. } => {
            return Ok(if breakpoints.contains(pc) {
                Step::Stop(ExecutionResult::StoppedAtBreakpoint)
            } else if single_step {
                Step::Stepped
            } else {
                Step::UnexpectedTrap(pc)
            });
        }
        Exit::Shutdown => return Err(Error::Shutdown),
        Exit::FailEntry {
            hardware_entry_failure_reason,
        } => {
            tracing::error!(hardware_entry_failure_reason, "VP entry failed");
            return Err(Error::FailEntry(hardware_entry_failure_reason));
        }
        Exit::InternalError { error, data } => {
            tracing::error!(error, ?data, "KVM internal error");
            return Err(Error::InternalError(error));
        }
    }
    Ok(Step::Continue)
}

fn check_io_width(port: u16, size: u8) -> Result<(), Error> {
    match size {
        1 | 2 | 4 => Ok(()),
        _ => Err(Error::InvalidIoWidth { port, size }),
    }
}

fn check_mmio(address: u64, len: u32, policy: AccessPolicy) -> Result<(), Error> {
    if !matches!(len, 1 | 2 | 4 | 8) {
        return Err(Error::InvalidMmioWidth { address, len });
    }
    if address % u64::from(len) != 0 {
        match policy {
            AccessPolicy::Fault => return Err(Error::MisalignedMmio { address, len }),
            AccessPolicy::Warn => tracing::warn!(address, len, "misaligned mmio access"),
            AccessPolicy::Ignore => {}
        }
    }
    Ok(())
}

fn read_port(host: &dyn Host, port: u16, chunk: &mut [u8]) -> Result<(), Error> {
    match chunk.len() {
        1 => chunk[0] = host.read_port_byte(port)?,
        2 => chunk.copy_from_slice(&host.read_port_word(port)?.to_le_bytes()),
        _ => chunk.copy_from_slice(&host.read_port_dword(port)?.to_le_bytes()),
    }
    Ok(())
}

fn write_port(host: &dyn Host, port: u16, chunk: &[u8]) -> Result<(), Error> {
    let value = le_value(chunk);
    match chunk.len() {
        1 => host.write_port_byte(port, value as u8)?,
        2 => host.write_port_word(port, value as u16)?,
        _ => host.write_port_dword(port, value as u32)?,
    }
    Ok(())
}

fn read_bus(host: &dyn Host, address: u64, data: &mut [u8]) -> Result<(), Error> {
    let value = match data.len() {
        1 => host.read_bus_byte(address)?.into(),
        2 => host.read_bus_word(address)?.into(),
        4 => host.read_bus_dword(address)?.into(),
        _ => host.read_bus_qword(address)?,
    };
    let len = data.len();
    data.copy_from_slice(&value.to_le_bytes()[..len]);
    Ok(())
}

fn write_bus(host: &dyn Host, address: u64, data: &[u8]) -> Result<(), Error> {
    let value = le_value(data);
    match data.len() {
        1 => host.write_bus_byte(address, value as u8)?,
        2 => host.write_bus_word(address, value as u16)?,
        4 => host.write_bus_dword(address, value as u32)?,
        _ => host.write_bus_qword(address, value)?,
    }
    Ok(())
}

fn le_value(bytes: &[u8]) -> u64 {
    let mut value = [0; 8];
    value[..bytes.len()].copy_from_slice(bytes);
    u64::from_le_bytes(value)
}
