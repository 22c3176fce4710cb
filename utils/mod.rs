//! Utility functions and data structures
//!
//! This module contains helper code used throughout the hypervisor.

pub mod log;
pub mod bitmap;

// Re-export commonly used utilities
pub use self::bitmap::Bitmap;

/// Utility macros
#[macro_export]
macro_rules! align_up {
    ($addr:expr, $align:expr) => {
        (($addr + $align - 1) / $align * $align)
    };
}

#[macro_export]
macro_rules! align_down {
    ($addr:expr, $align:expr) => {
        ($addr / $align * $align)
    };
}

#[macro_export]
macro_rules! is_aligned {
    ($addr:expr, $align:expr) => {
        $addr % $align == 0
    };
}

/// Bits per byte
pub const BITS_PER_BYTE: u32 = 8;

/// Mask covering the low `bytes` bytes of a 64-bit value
#[inline]
pub const fn byte_mask(bytes: u32) -> u64 {
    if bytes >= 8 {
        u64::MAX
    } else {
        (1u64 << (bytes * BITS_PER_BYTE)) - 1
    }
}

/// Replicate the low byte of `value` into all four bytes of a word
#[inline]
pub const fn replicate_byte(value: u8) -> u32 {
    let v = value as u32;
    v | (v << 8) | (v << 16) | (v << 24)
}
