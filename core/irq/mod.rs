//! Interrupt handling module
//!
//! Interrupt ids, SPI allocation tables and the physical line ownership
//! map shared by every VM.

pub mod ownership;

// Re-export commonly used types
pub use ownership::{IrqOwnership, SpiTable, SPI_MAX_ID, SPI_MIN_ID};

/// Interrupt id type
pub type IntId = u32;

/// Kind of a virtual interrupt as delivered to a vCPU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptType {
    /// Delivered as IRQ
    Irq,
    /// Delivered as FIQ
    Fiq,
}
