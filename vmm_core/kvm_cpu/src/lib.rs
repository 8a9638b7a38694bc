// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Virtual-CPU execution core over Linux KVM.
//!
//! [`KvmCore`] runs guest code on a single KVM vCPU in bounded quanta,
//! dispatches port and MMIO exits to a [`Host`], keeps software breakpoints
//! patched into guest memory, and maintains the host/guest address map used
//! by the translating engine. Every entry point of [`KvmCore`] runs inside a
//! per-thread call boundary so a failing or panicking host callback unwinds to
//! the nearest entry point instead of tearing through native state.

#![cfg(target_os = "linux")]
#![expect(missing_docs)]
// UNSAFETY: Patching breakpoints into host-mapped guest memory, handing raw
// host pointers to KVM and implementing the host-backed allocator.
#![expect(unsafe_code)]

pub mod alloc;
pub mod block_map;
pub mod boundary;
pub mod breakpoint;
pub mod config;
mod error;
mod facade;
pub mod facility;
pub mod host;
pub mod log;
pub mod memory;
pub mod regs;
pub mod vcpu;

#[cfg(test)]
mod testutil;

pub use config::AccessPolicy;
pub use config::CpuConfig;
pub use error::Error;
pub use facade::KvmCore;
pub use host::Host;
pub use host::HostAbort;
pub use vcpu::ExecutionResult;
pub use vcpu::InterruptHandle;
