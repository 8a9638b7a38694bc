// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Scripted facility and recording host for unit tests.

use crate::block_map::HostBlock;
use crate::block_map::HostBlockMap;
use crate::facility::DebugMode;
use crate::facility::Facility;
use crate::host::Host;
use crate::host::HostAbort;
use crate::host::LogLevel;
use kvm::Exit;
use kvm::kvm_regs;
use kvm::kvm_sregs;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::time::Duration;

/// An exit the scripted facility will produce on its next run.
#[derive(Debug, Clone)]
pub enum ScriptedExit {
    Interrupted,
    IoIn { port: u16, size: u8, count: usize },
    IoOut { port: u16, size: u8, data: Vec<u8> },
    MmioRead { address: u64, len: u32 },
    MmioWrite { address: u64, len: u32, data: Vec<u8> },
    Debug { pc: u64 },
    Shutdown,
    FailEntry(u64),
    InternalError(u32),
    Unknown(u32),
}

/// A facility call, as observed by the scripted facility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    GetRegs,
    SetRegs,
    GetSregs,
    SetSregs,
    Translate(u64),
    GuestDebug(DebugMode),
    MemoryRegion { slot: u32, guest_address: u64, size: u64 },
    IrqLine { irq: u32, level: bool },
    ArmTimer(Duration),
    DisarmTimer,
    Run,
}

/// A facility that replays a fixed list of exits.
///
/// Once the script is exhausted every run reports [`Exit::Interrupted`], as a
/// real vCPU would once its timer fires. Guest virtual addresses translate to
/// themselves unless listed in `untranslatable`.
pub struct ScriptedFacility {
    pub regs: kvm_regs,
    pub sregs: kvm_sregs,
    pub exits: VecDeque<ScriptedExit>,
    pub calls: Vec<Call>,
    pub untranslatable: HashSet<u64>,
    pub reject_memory_regions: bool,
    /// Invoked at the start of every run, before the next exit is produced.
    pub on_run: Option<Box<dyn FnMut() + Send>>,
    /// Data read back by the core on the last IN or MMIO read exit.
    pub io_buffer: Vec<u8>,
    pub mmio_buffer: [u8; 8],
}

impl ScriptedFacility {
    pub fn new(exits: impl IntoIterator<Item = ScriptedExit>) -> Self {
        Self {
            regs: kvm_regs::default(),
            sregs: kvm_sregs::default(),
            exits: exits.into_iter().collect(),
            calls: Vec::new(),
            untranslatable: HashSet::new(),
            reject_memory_regions: false,
            on_run: None,
            io_buffer: Vec::new(),
            mmio_buffer: [0; 8],
        }
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls.iter().filter(|c| *c == call).count()
    }

    pub fn debug_modes(&self) -> Vec<DebugMode> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                Call::GuestDebug(mode) => Some(*mode),
                _ => None,
            })
            .collect()
    }
}

impl Facility for ScriptedFacility {
    fn get_regs(&mut self) -> Result<kvm_regs, kvm::Error> {
        self.calls.push(Call::GetRegs);
        Ok(self.regs)
    }

    fn set_regs(&mut self, regs: &kvm_regs) -> Result<(), kvm::Error> {
        self.calls.push(Call::SetRegs);
        self.regs = *regs;
        Ok(())
    }

    fn get_sregs(&mut self) -> Result<kvm_sregs, kvm::Error> {
        self.calls.push(Call::GetSregs);
        Ok(self.sregs)
    }

    fn set_sregs(&mut self, sregs: &kvm_sregs) -> Result<(), kvm::Error> {
        self.calls.push(Call::SetSregs);
        self.sregs = *sregs;
        Ok(())
    }

    fn translate_gva(&mut self, gva: u64) -> Result<Option<u64>, kvm::Error> {
        self.calls.push(Call::Translate(gva));
        Ok((!self.untranslatable.contains(&gva)).then_some(gva))
    }

    fn set_guest_debug(&mut self, mode: DebugMode) -> Result<(), kvm::Error> {
        self.calls.push(Call::GuestDebug(mode));
        Ok(())
    }

    unsafe fn set_user_memory_region(
        &mut self,
        slot: u32,
        guest_address: u64,
        size: u64,
        _host: *mut u8,
    ) -> Result<(), kvm::Error> {
        self.calls.push(Call::MemoryRegion {
            slot,
            guest_address,
            size,
        });
        if self.reject_memory_regions {
            return Err(kvm::Error::SetMemoryRegion(nix::errno::Errno::EEXIST));
        }
        Ok(())
    }

    fn set_irq_line(&mut self, irq: u32, level: bool) -> Result<(), kvm::Error> {
        self.calls.push(Call::IrqLine { irq, level });
        Ok(())
    }

    fn arm_timer(&mut self, quantum: Duration) -> Result<(), kvm::Error> {
        self.calls.push(Call::ArmTimer(quantum));
        Ok(())
    }

    fn disarm_timer(&mut self) {
        self.calls.push(Call::DisarmTimer);
    }

    fn run(&mut self) -> Result<Exit<'_>, kvm::Error> {
        self.calls.push(Call::Run);
        if let Some(on_run) = &mut self.on_run {
            on_run();
        }
        let exit = match self.exits.pop_front() {
            None | Some(ScriptedExit::Interrupted) => Exit::Interrupted,
            Some(ScriptedExit::IoIn { port, size, count }) => {
                self.io_buffer = vec![0; size as usize * count];
                Exit::IoIn {
                    port,
                    size,
                    data: &mut self.io_buffer[..],
                }
            }
            Some(ScriptedExit::IoOut { port, size, data }) => {
                self.io_buffer = data;
                Exit::IoOut {
                    port,
                    size,
                    data: &self.io_buffer[..],
                }
            }
            Some(ScriptedExit::MmioRead { address, len }) => {
                self.mmio_buffer = [0; 8];
                let n = (len as usize).min(8);
                Exit::MmioRead {
                    address,
                    len,
                    data: &mut self.mmio_buffer[..n],
                }
            }
            Some(ScriptedExit::MmioWrite { address, len, data }) => {
                let n = data.len().min(8);
                self.mmio_buffer = [0; 8];
                self.mmio_buffer[..n].copy_from_slice(&data[..n]);
                Exit::MmioWrite {
                    address,
                    len,
                    data: &self.mmio_buffer[..n],
                }
            }
            Some(ScriptedExit::Debug { pc }) => Exit::Debug {
                exception: 1,
                pc,
                dr6: 0,
                dr7: 0,
            },
            Some(ScriptedExit::Shutdown) => Exit::Shutdown,
            Some(ScriptedExit::FailEntry(reason)) => Exit::FailEntry {
                hardware_entry_failure_reason: reason,
            },
            Some(ScriptedExit::InternalError(error)) => Exit::InternalError { error, data: &[] },
            Some(ScriptedExit::Unknown(reason)) => return Err(kvm::Error::UnknownExit(reason)),
        };
        Ok(exit)
    }
}

/// Something the core asked the host to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Log(LogLevel, String),
    Abort(String),
    RuntimeAbort(String, u64),
    PortRead { port: u16, width: u8 },
    PortWrite { port: u16, width: u8, value: u32 },
    BusRead { address: u64, width: u8 },
    BusWrite { address: u64, width: u8, value: u64 },
    Touch(u64),
}

/// A host that records every callback.
///
/// Port reads return the low bits of `read_value`; bus reads return it
/// whole. Accesses to `failing_port` return a host abort and accesses to
/// `panicking_port` panic. A touch publishes the blocks in `touch_blocks`, if
/// any.
pub struct RecordingHost {
    pub events: Mutex<Vec<HostEvent>>,
    pub read_value: u64,
    pub failing_port: Option<u16>,
    pub panicking_port: Option<u16>,
    pub touch_blocks: Mutex<Option<Vec<HostBlock>>>,
}

impl Default for RecordingHost {
    fn default() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            read_value: 0x1122_3344_5566_7788,
            failing_port: None,
            panicking_port: None,
            touch_blocks: Mutex::new(None),
        }
    }
}

impl RecordingHost {
    pub fn events(&self) -> Vec<HostEvent> {
        self.events.lock().clone()
    }

    /// Events other than log messages.
    pub fn accesses(&self) -> Vec<HostEvent> {
        self.events
            .lock()
            .iter()
            .filter(|event| !matches!(event, HostEvent::Log(..)))
            .cloned()
            .collect()
    }

    fn port_read(&self, port: u16, width: u8) -> Result<u64, HostAbort> {
        self.events.lock().push(HostEvent::PortRead { port, width });
        if self.panicking_port == Some(port) {
            panic!("port {port:#x} exploded");
        }
        if self.failing_port == Some(port) {
            return Err(HostAbort::new(format!("port {port:#x} failed")));
        }
        Ok(self.read_value)
    }

    fn port_write(&self, port: u16, width: u8, value: u32) -> Result<(), HostAbort> {
        self.events
            .lock()
            .push(HostEvent::PortWrite { port, width, value });
        if self.failing_port == Some(port) {
            return Err(HostAbort::new(format!("port {port:#x} failed")));
        }
        Ok(())
    }

    fn bus_read(&self, address: u64, width: u8) -> Result<u64, HostAbort> {
        self.events.lock().push(HostEvent::BusRead { address, width });
        Ok(self.read_value)
    }

    fn bus_write(&self, address: u64, width: u8, value: u64) -> Result<(), HostAbort> {
        self.events.lock().push(HostEvent::BusWrite {
            address,
            width,
            value,
        });
        Ok(())
    }
}

impl Host for RecordingHost {
    fn log(&self, level: LogLevel, message: &str) {
        self.events
            .lock()
            .push(HostEvent::Log(level, message.to_owned()));
    }

    fn report_abort(&self, message: &str) {
        self.events.lock().push(HostEvent::Abort(message.to_owned()));
    }

    fn report_runtime_abort(&self, message: &str, pc: u64) {
        self.events
            .lock()
            .push(HostEvent::RuntimeAbort(message.to_owned(), pc));
    }

    fn read_port_byte(&self, port: u16) -> Result<u8, HostAbort> {
        self.port_read(port, 1).map(|v| v as u8)
    }

    fn read_port_word(&self, port: u16) -> Result<u16, HostAbort> {
        self.port_read(port, 2).map(|v| v as u16)
    }

    fn read_port_dword(&self, port: u16) -> Result<u32, HostAbort> {
        self.port_read(port, 4).map(|v| v as u32)
    }

    fn write_port_byte(&self, port: u16, value: u8) -> Result<(), HostAbort> {
        self.port_write(port, 1, value.into())
    }

    fn write_port_word(&self, port: u16, value: u16) -> Result<(), HostAbort> {
        self.port_write(port, 2, value.into())
    }

    fn write_port_dword(&self, port: u16, value: u32) -> Result<(), HostAbort> {
        self.port_write(port, 4, value)
    }

    fn read_bus_byte(&self, address: u64) -> Result<u8, HostAbort> {
        self.bus_read(address, 1).map(|v| v as u8)
    }

    fn read_bus_word(&self, address: u64) -> Result<u16, HostAbort> {
        self.bus_read(address, 2).map(|v| v as u16)
    }

    fn read_bus_dword(&self, address: u64) -> Result<u32, HostAbort> {
        self.bus_read(address, 4).map(|v| v as u32)
    }

    fn read_bus_qword(&self, address: u64) -> Result<u64, HostAbort> {
        self.bus_read(address, 8)
    }

    fn write_bus_byte(&self, address: u64, value: u8) -> Result<(), HostAbort> {
        self.bus_write(address, 1, value.into())
    }

    fn write_bus_word(&self, address: u64, value: u16) -> Result<(), HostAbort> {
        self.bus_write(address, 2, value.into())
    }

    fn write_bus_dword(&self, address: u64, value: u32) -> Result<(), HostAbort> {
        self.bus_write(address, 4, value.into())
    }

    fn write_bus_qword(&self, address: u64, value: u64) -> Result<(), HostAbort> {
        self.bus_write(address, 8, value)
    }

    fn touch_host_block(&self, map: &HostBlockMap, offset: u64) -> Result<(), HostAbort> {
        self.events.lock().push(HostEvent::Touch(offset));
        match self.touch_blocks.lock().take() {
            Some(blocks) => {
                map.replace_mapping(&blocks);
                Ok(())
            }
            None => Ok(()),
        }
    }
}
