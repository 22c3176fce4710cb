//! Partivisor - an ARM64 partitioning hypervisor core
//!
//! This library holds the parts of the hypervisor that partition physical
//! CPUs and interrupts among a primary VM and its secondary partitions:
//! the vCPU lock and run-state machine, the physical GIC distributor
//! driver, SPI ownership tracking, and the trap-and-emulate vGIC exposed
//! through the virtual device layer.
//!
//! Boot flow, page table management and console drivers live outside this
//! crate and are reached through the traits in [`core::mm`] and
//! [`core::sched`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

// Core modules
#[macro_use]
pub mod utils;
pub mod config;

// Architecture-specific code
pub mod arch;

// Core hypervisor modules
pub mod core;

// Device emulators
pub mod emulator;

// Re-export key types for convenience
pub use crate::config::HypervisorConfig;
pub use crate::core::hypervisor::Hypervisor;
pub use crate::core::sched::{RunOutcome, VcpuExit};
pub use crate::core::vmm::{VcpuId, VmId};
pub use crate::emulator::EmulatorError;

/// Partivisor version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Common error type for Partivisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Invalid argument
    InvalidArgument,
    /// Not found
    NotFound,
    /// Resource busy
    ResourceBusy,
    /// Resource unavailable
    ResourceUnavailable,
    /// Not initialized
    NotInitialized,
    /// Invalid state
    InvalidState,
    /// Architecture-specific error
    ArchError(arch::Error),
    /// Core error
    CoreError(crate::core::Error),
    /// Device emulation error
    EmulatorError(emulator::EmulatorError),
}

impl From<arch::Error> for Error {
    fn from(err: arch::Error) -> Self {
        Error::ArchError(err)
    }
}

impl From<crate::core::Error> for Error {
    fn from(err: crate::core::Error) -> Self {
        Error::CoreError(err)
    }
}

impl From<emulator::EmulatorError> for Error {
    fn from(err: emulator::EmulatorError) -> Self {
        Error::EmulatorError(err)
    }
}

impl ::core::fmt::Display for Error {
    fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
        match self {
            Error::InvalidArgument => write!(f, "invalid argument"),
            Error::NotFound => write!(f, "not found"),
            Error::ResourceBusy => write!(f, "resource busy"),
            Error::ResourceUnavailable => write!(f, "resource unavailable"),
            Error::NotInitialized => write!(f, "not initialized"),
            Error::InvalidState => write!(f, "invalid state"),
            Error::ArchError(err) => write!(f, "arch: {}", err),
            Error::CoreError(err) => write!(f, "core: {}", err),
            Error::EmulatorError(err) => write!(f, "emulator: {}", err),
        }
    }
}

/// Result type alias
pub type Result<T> = ::core::result::Result<T, Error>;
