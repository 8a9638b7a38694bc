// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::host::HostAbort;
use std::io;
use thiserror::Error;

/// Errors surfaced by the execution core.
///
/// Everything except [`Error::IrqOutOfRange`] is fatal for the current entry
/// point: it is reported to the host once at the outermost call boundary.
#[derive(Debug, Error)]
pub enum Error {
    #[error("KVM is not available")]
    Unavailable(#[source] kvm::Error),
    #[error("unsupported KVM API version {found}, expected {expected}")]
    UnsupportedApiVersion { found: i32, expected: i32 },
    #[error("failed to set up the preemption signal")]
    SignalHandler(#[source] io::Error),
    #[error("kvm error")]
    Kvm(#[from] kvm::Error),
    #[error("read from undefined register {0}")]
    UndefinedRegisterRead(u32),
    #[error("write to undefined register {0}")]
    UndefinedRegisterWrite(u32),
    #[error("unsupported {size}-byte port access at {port:#x}")]
    InvalidIoWidth { port: u16, size: u8 },
    #[error("unsupported {len}-byte mmio access at {address:#x}")]
    InvalidMmioWidth { address: u64, len: u32 },
    #[error("misaligned {len}-byte mmio access at {address:#x}")]
    MisalignedMmio { address: u64, len: u32 },
    #[error("KVM_EXIT_FAIL_ENTRY, hardware entry failure reason {0:#x}")]
    FailEntry(u64),
    #[error("KVM_EXIT_INTERNAL_ERROR, suberror {0:#x}")]
    InternalError(u32),
    #[error("KVM_EXIT_SHUTDOWN")]
    Shutdown,
    #[error("pointer {0:#x} was not allocated by us")]
    PointerNotAllocated(usize),
    #[error("guest offset {0:#x} is not backed by any host block")]
    UnmappedOffset(u64),
    #[error("irq {0} is out of range")]
    IrqOutOfRange(u32),
    #[error("failed to kick the executing thread")]
    Kick(#[source] io::Error),
    #[error("host aborted")]
    Host(#[from] HostAbort),
    #[error("host callback panicked: {0}")]
    CallbackPanic(String),
}

impl Error {
    /// Returns false for the one error the host is expected to handle and
    /// carry on from.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::IrqOutOfRange(_))
    }

    /// Whether the error was raised by the guest's execution, in which case
    /// the guest program counter is worth reporting alongside it.
    pub fn is_runtime(&self) -> bool {
        matches!(
            self,
            Error::InvalidIoWidth { .. }
                | Error::InvalidMmioWidth { .. }
                | Error::MisalignedMmio { .. }
                | Error::FailEntry(_)
                | Error::InternalError(_)
                | Error::Shutdown
                | Error::Kvm(kvm::Error::UnknownExit(_) | kvm::Error::Run(_))
        )
    }
}
