//! Architecture support

use core::fmt;

cfg_if::cfg_if! {
    if #[cfg(feature = "arch_arm64")] {
        pub mod arm64;
        pub use arm64::*;
    } else {
        compile_error!("the arch_arm64 feature is required");
    }
}

/// Architecture error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Interrupt id outside the range accepted by the operation
    InvalidIrq(u32),
    /// Register access width not supported by the operation
    UnsupportedAccessSize(u8),
    /// Access not naturally aligned to its width
    UnalignedAccess(u64),
    /// No free vGIC slot
    PoolExhausted,
    /// vGIC slot index not allocated
    InvalidSlot(usize),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidIrq(irq) => write!(f, "invalid irq {}", irq),
            Error::UnsupportedAccessSize(size) => write!(f, "unsupported access size {}", size),
            Error::UnalignedAccess(offset) => write!(f, "unaligned access at {:#x}", offset),
            Error::PoolExhausted => write!(f, "vgic pool exhausted"),
            Error::InvalidSlot(slot) => write!(f, "invalid vgic slot {}", slot),
        }
    }
}
