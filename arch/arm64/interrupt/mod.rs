//! Interrupt handling for ARM64
//!
//! GICv2 distributor driver and the vGIC distributor emulation built on
//! top of it.

/// GIC distributor driver
pub mod gic;

/// VGIC (Virtual GIC) distributor emulation
pub mod vgic;

// Re-export commonly used types
pub use gic::{gicd, DistributorGuard, GicDistributor, GicdCtlr, IrqFlags, MmioRegion, RegisterBlock};
pub use vgic::{classify, decode_irq, IrqWindow, RegisterGroup, RegisterLayout, VgicDevice, VgicPool, VgicVdev};
