//! CPU module for ARM64
//!
//! This module provides:
//! - The vCPU register save area
//! - Data-abort syndrome decoding and abort injection
//! - Physical CPU identification

pub mod trap;

pub use trap::{AccessSize, FaultInfo, InjectedAbort};

/// Number of general-purpose registers (X0-X30)
pub const NUM_GPRS: usize = 31;

/// Register number encoding XZR in load/store syndromes
pub const XZR: u8 = 31;

/// SPSR value for entering a guest at EL1h with DAIF masked
pub const SPSR_EL1H_DAIF_MASKED: u64 = 0x3c5;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "aarch64")] {
        /// Current physical CPU index (MPIDR_EL1.Aff0)
        #[inline]
        pub fn current_cpu_id() -> usize {
            use aarch64_cpu::registers::MPIDR_EL1;
            use tock_registers::interfaces::Readable;

            (MPIDR_EL1.get() & 0xff) as usize
        }
    } else {
        /// Current physical CPU index, always 0 off target
        #[inline]
        pub fn current_cpu_id() -> usize {
            0
        }
    }
}

/// Saved architectural state of a vCPU
///
/// Only valid while the owning vCPU is not executing; see
/// [`VcpuLocked::regs`](crate::core::vmm::vcpu::VcpuLocked::regs).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchRegs {
    /// General-purpose registers X0-X30
    pub x: [u64; NUM_GPRS],
    /// Guest program counter (ELR_EL2)
    pub pc: u64,
    /// Saved program status (SPSR_EL2)
    pub spsr: u64,
    /// Synchronous abort to deliver on the next entry
    pub pending_abort: Option<InjectedAbort>,
}

impl ArchRegs {
    /// Create a zeroed register file
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset to a clean EL1 entry state
    pub fn reset(&mut self, entry: u64, arg: u64) {
        *self = Self::default();
        self.pc = entry;
        self.x[0] = arg;
        self.spsr = SPSR_EL1H_DAIF_MASKED;
    }

    /// Read a general-purpose register, XZR reads as 0
    #[inline]
    pub fn gpr(&self, index: u8) -> u64 {
        self.x.get(index as usize).copied().unwrap_or(0)
    }

    /// Write a general-purpose register, writes to XZR are discarded
    #[inline]
    pub fn set_gpr(&mut self, index: u8, value: u64) {
        if let Some(reg) = self.x.get_mut(index as usize) {
            *reg = value;
        }
    }

    /// Skip the trapped 32-bit instruction
    #[inline]
    pub fn advance_pc(&mut self) {
        self.pc = self.pc.wrapping_add(4);
    }

    /// Queue a synchronous abort for the guest
    pub fn inject_abort(&mut self, abort: InjectedAbort) {
        if let Some(prev) = self.pending_abort.replace(abort) {
            log::warn!("replacing pending abort esr={:#x}", prev.esr);
        }
    }

    /// Take the pending abort, if any
    pub fn take_pending_abort(&mut self) -> Option<InjectedAbort> {
        self.pending_abort.take()
    }
}
