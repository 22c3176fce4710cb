//! ARM64 (AArch64) Architecture Support
//!
//! This module provides the ARM64 pieces the partitioning core needs:
//! - vCPU register save area and data-abort syndrome decoding
//! - GICv2 distributor driver
//! - vGIC distributor emulation
//!
//! ## References
//! - [ARM Architecture Reference Manual ARMv8-A](https://developer.arm.com/documentation/ddi0487/latest)
//! - [ARM Generic Interrupt Controller Architecture Specification](https://developer.arm.com/documentation/ihi0048/latest)

pub mod cpu;
pub mod interrupt;

#[cfg(test)]
mod tests;

// Re-export key types and functions
pub use cpu::{current_cpu_id, ArchRegs};
pub use interrupt::{GicDistributor, RegisterBlock, VgicDevice, VgicPool};

/// ARM64 architecture version
pub const ARCH_VERSION: &str = "arm64";
