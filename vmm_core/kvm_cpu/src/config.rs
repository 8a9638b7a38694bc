// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Processor configuration.

use std::path::PathBuf;

/// Where KVM places the three-page identity map needed for real mode on VMX:
/// just below the BIOS.
pub const DEFAULT_IDENTITY_MAP_ADDR: u64 = 0xfffb_c000;

/// Offset of the TSS pages from the identity map.
pub const TSS_OFFSET: u64 = 0x1000;

/// What to do with an MMIO access whose address is not a multiple of its
/// width.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum AccessPolicy {
    /// Fail the execution.
    #[default]
    Fault,
    /// Log a warning and forward the access.
    Warn,
    /// Forward the access silently.
    Ignore,
}

#[derive(Debug, Clone)]
pub struct CpuConfig {
    pub identity_map_addr: u64,
    pub mmio_alignment: AccessPolicy,
    /// The KVM device node.
    pub device_path: PathBuf,
}

impl CpuConfig {
    pub fn tss_addr(&self) -> u64 {
        self.identity_map_addr + TSS_OFFSET
    }
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            identity_map_addr: DEFAULT_IDENTITY_MAP_ADDR,
            mmio_alignment: AccessPolicy::default(),
            device_path: "/dev/kvm".into(),
        }
    }
}
