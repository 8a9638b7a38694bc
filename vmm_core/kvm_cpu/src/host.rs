// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The callbacks the execution core makes into its host.

use crate::block_map::HostBlockMap;
use thiserror::Error;

/// Host log levels, numbered as the host numbers them.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i32)]
pub enum LogLevel {
    Noisy = -1,
    Debug = 0,
    Info = 1,
    Warning = 2,
    Error = 3,
}

impl From<tracing::Level> for LogLevel {
    fn from(level: tracing::Level) -> Self {
        match level {
            tracing::Level::TRACE => LogLevel::Noisy,
            tracing::Level::DEBUG => LogLevel::Debug,
            tracing::Level::INFO => LogLevel::Info,
            tracing::Level::WARN => LogLevel::Warning,
            tracing::Level::ERROR => LogLevel::Error,
        }
    }
}

/// A host callback gave up on the current operation.
///
/// This is the host's way of unwinding out of a callback: the core propagates
/// it to the outermost entry point without touching any more guest state.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct HostAbort {
    pub message: String,
}

impl HostAbort {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Services the host provides to the execution core.
///
/// Port and bus callbacks run on the executing thread while the vCPU is
/// stopped at an exit. They may call back into [`crate::KvmCore`] entry points
/// that do not need the processor, and they may return [`HostAbort`] to end
/// the current execution.
pub trait Host: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);

    /// Reports an error that ended an entry point.
    fn report_abort(&self, message: &str);

    /// Reports an error raised while running guest code at `pc`.
    fn report_runtime_abort(&self, message: &str, pc: u64);

    fn read_port_byte(&self, port: u16) -> Result<u8, HostAbort>;
    fn read_port_word(&self, port: u16) -> Result<u16, HostAbort>;
    fn read_port_dword(&self, port: u16) -> Result<u32, HostAbort>;
    fn write_port_byte(&self, port: u16, value: u8) -> Result<(), HostAbort>;
    fn write_port_word(&self, port: u16, value: u16) -> Result<(), HostAbort>;
    fn write_port_dword(&self, port: u16, value: u32) -> Result<(), HostAbort>;

    fn read_bus_byte(&self, address: u64) -> Result<u8, HostAbort>;
    fn read_bus_word(&self, address: u64) -> Result<u16, HostAbort>;
    fn read_bus_dword(&self, address: u64) -> Result<u32, HostAbort>;
    fn read_bus_qword(&self, address: u64) -> Result<u64, HostAbort>;
    fn write_bus_byte(&self, address: u64, value: u8) -> Result<(), HostAbort>;
    fn write_bus_word(&self, address: u64, value: u16) -> Result<(), HostAbort>;
    fn write_bus_dword(&self, address: u64, value: u32) -> Result<(), HostAbort>;
    fn write_bus_qword(&self, address: u64, value: u64) -> Result<(), HostAbort>;

    /// Asks the host to publish a mapping covering the guest `offset`, usually
    /// by calling [`HostBlockMap::replace_mapping`] on `map`.
    ///
    /// Hosts that never fault blocks in can keep the default, which refuses.
    fn touch_host_block(&self, map: &HostBlockMap, offset: u64) -> Result<(), HostAbort> {
        let _ = map;
        Err(HostAbort::new(format!(
            "no host block for guest offset {offset:#x}"
        )))
    }
}

/// A [`Host`] assembled from plain function pointers, for hosts that hand the
/// core a callback table rather than an object.
#[derive(Debug, Copy, Clone)]
pub struct HostCallbacks {
    pub log: fn(LogLevel, &str),
    pub report_abort: fn(&str),
    pub report_runtime_abort: fn(&str, u64),
    pub read_port_byte: fn(u16) -> Result<u8, HostAbort>,
    pub read_port_word: fn(u16) -> Result<u16, HostAbort>,
    pub read_port_dword: fn(u16) -> Result<u32, HostAbort>,
    pub write_port_byte: fn(u16, u8) -> Result<(), HostAbort>,
    pub write_port_word: fn(u16, u16) -> Result<(), HostAbort>,
    pub write_port_dword: fn(u16, u32) -> Result<(), HostAbort>,
    pub read_bus_byte: fn(u64) -> Result<u8, HostAbort>,
    pub read_bus_word: fn(u64) -> Result<u16, HostAbort>,
    pub read_bus_dword: fn(u64) -> Result<u32, HostAbort>,
    pub read_bus_qword: fn(u64) -> Result<u64, HostAbort>,
    pub write_bus_byte: fn(u64, u8) -> Result<(), HostAbort>,
    pub write_bus_word: fn(u64, u16) -> Result<(), HostAbort>,
    pub write_bus_dword: fn(u64, u32) -> Result<(), HostAbort>,
    pub write_bus_qword: fn(u64, u64) -> Result<(), HostAbort>,
    pub touch_host_block: Option<fn(&HostBlockMap, u64) -> Result<(), HostAbort>>,
}

impl Host for HostCallbacks {
    fn log(&self, level: LogLevel, message: &str) {
        (self.log)(level, message)
    }

    fn report_abort(&self, message: &str) {
        (self.report_abort)(message)
    }

    fn report_runtime_abort(&self, message: &str, pc: u64) {
        (self.report_runtime_abort)(message, pc)
    }

    fn read_port_byte(&self, port: u16) -> Result<u8, HostAbort> {
        (self.read_port_byte)(port)
    }

    fn read_port_word(&self, port: u16) -> Result<u16, HostAbort> {
        (self.read_port_word)(port)
    }

    fn read_port_dword(&self, port: u16) -> Result<u32, HostAbort> {
        (self.read_port_dword)(port)
    }

    fn write_port_byte(&self, port: u16, value: u8) -> Result<(), HostAbort> {
        (self.write_port_byte)(port, value)
    }

    fn write_port_word(&self, port: u16, value: u16) -> Result<(), HostAbort> {
        (self.write_port_word)(port, value)
    }

    fn write_port_dword(&self, port: u16, value: u32) -> Result<(), HostAbort> {
        (self.write_port_dword)(port, value)
    }

    fn read_bus_byte(&self, address: u64) -> Result<u8, HostAbort> {
        (self.read_bus_byte)(address)
    }

    fn read_bus_word(&self, address: u64) -> Result<u16, HostAbort> {
        (self.read_bus_word)(address)
    }

    fn read_bus_dword(&self, address: u64) -> Result<u32, HostAbort> {
        (self.read_bus_dword)(address)
    }

    fn read_bus_qword(&self, address: u64) -> Result<u64, HostAbort> {
        (self.read_bus_qword)(address)
    }

    fn write_bus_byte(&self, address: u64, value: u8) -> Result<(), HostAbort> {
        (self.write_bus_byte)(address, value)
    }

    fn write_bus_word(&self, address: u64, value: u16) -> Result<(), HostAbort> {
        (self.write_bus_word)(address, value)
    }

    fn write_bus_dword(&self, address: u64, value: u32) -> Result<(), HostAbort> {
        (self.write_bus_dword)(address, value)
    }

    fn write_bus_qword(&self, address: u64, value: u64) -> Result<(), HostAbort> {
        (self.write_bus_qword)(address, value)
    }

    fn touch_host_block(&self, map: &HostBlockMap, offset: u64) -> Result<(), HostAbort> {
        match self.touch_host_block {
            Some(touch) => touch(map, offset),
            None => Err(HostAbort::new(format!(
                "no host block for guest offset {offset:#x}"
            ))),
        }
    }
}
