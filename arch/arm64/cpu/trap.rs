//! ARM64 data-abort decoding
//!
//! A stage-2 data abort on an emulated MMIO range reports the access in
//! ESR_EL2.ISS when ISV is set:
//!
//! | Field | Bits  | Meaning                                  |
//! |-------|-------|------------------------------------------|
//! | ISV   | 24    | syndrome valid                           |
//! | SAS   | 23:22 | access size (byte, half, word, double)   |
//! | SSE   | 21    | sign-extend the loaded value             |
//! | SRT   | 20:16 | transfer register                        |
//! | SF    | 15    | 64-bit register                          |
//! | WnR   | 6     | write (1) or read (0)                    |
//!
//! Accesses to unregistered ranges are reflected back to the guest as a
//! synchronous external data abort, see [`InjectedAbort`].

use crate::core::mm::MapMode;
use crate::utils::byte_mask;

/// ESR exception class shift
pub const ESR_EC_SHIFT: u64 = 26;
/// ESR instruction length bit (32-bit instruction)
pub const ESR_IL: u64 = 1 << 25;
/// Data abort from a lower exception level
pub const EC_DABT_LOW: u64 = 0x24;
/// Data abort without a change in exception level
pub const EC_DABT_CUR: u64 = 0x25;
/// Synchronous external abort, not on translation table walk
pub const DFSC_SYNC_EXTERNAL: u64 = 0x10;

const ISS_ISV: u64 = 1 << 24;
const ISS_SSE: u64 = 1 << 21;
const ISS_SF: u64 = 1 << 15;
const ISS_WNR: u64 = 1 << 6;

/// Size of a trapped access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AccessSize {
    /// 8-bit
    Byte = 0,
    /// 16-bit
    Half = 1,
    /// 32-bit
    Word = 2,
    /// 64-bit
    Double = 3,
}

impl AccessSize {
    /// Decode ISS.SAS
    pub const fn from_sas(sas: u64) -> Self {
        match sas & 0x3 {
            0 => Self::Byte,
            1 => Self::Half,
            2 => Self::Word,
            _ => Self::Double,
        }
    }

    /// Access width in bytes
    pub const fn bytes(self) -> u8 {
        1 << (self as u8)
    }
}

/// Decoded data-abort syndrome of a trapped MMIO access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultInfo {
    /// Raw ESR_EL2 value
    pub esr: u64,
    /// Faulting intermediate physical address
    pub ipaddr: u64,
    /// Faulting guest virtual address (FAR_EL2)
    pub vaddr: u64,
    /// Guest program counter
    pub pc: u64,
    /// Attempted access
    pub mode: MapMode,
    /// Syndrome valid
    pub isv: bool,
    /// Access size
    pub sas: AccessSize,
    /// Sign extend loads
    pub sse: bool,
    /// 64-bit transfer register
    pub sf: bool,
    /// Write access
    pub wnr: bool,
    /// Transfer register number
    pub srt: u8,
}

impl FaultInfo {
    /// Decode the syndrome of a data abort
    pub fn from_esr(esr: u64, ipaddr: u64, vaddr: u64, pc: u64) -> Self {
        let wnr = esr & ISS_WNR != 0;
        Self {
            esr,
            ipaddr,
            vaddr,
            pc,
            mode: if wnr { MapMode::W } else { MapMode::R },
            isv: esr & ISS_ISV != 0,
            sas: AccessSize::from_sas(esr >> 22),
            sse: esr & ISS_SSE != 0,
            sf: esr & ISS_SF != 0,
            wnr,
            srt: ((esr >> 16) & 0x1f) as u8,
        }
    }

    /// Exception class
    pub fn exception_class(&self) -> u64 {
        (self.esr >> ESR_EC_SHIFT) & 0x3f
    }

    /// Access width in bytes
    pub fn size(&self) -> u8 {
        self.sas.bytes()
    }

    /// Extend a loaded value to the transfer register width
    pub fn extend(&self, value: u64) -> u64 {
        let bits = u32::from(self.size()) * 8;
        let mut v = value & byte_mask(u32::from(self.size()));
        if self.sse && bits < 64 {
            let shift = 64 - bits;
            v = (((v << shift) as i64) >> shift) as u64;
        }
        if !self.sf {
            v &= 0xffff_ffff;
        }
        v
    }
}

/// Synchronous abort to be delivered to a guest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InjectedAbort {
    /// Syndrome presented in ESR_EL1
    pub esr: u64,
    /// Fault address presented in FAR_EL1
    pub far: u64,
}

impl InjectedAbort {
    /// Synchronous external data abort for a faulting access
    pub fn external_data_abort(fault: &FaultInfo, from_el0: bool) -> Self {
        let ec = if from_el0 { EC_DABT_LOW } else { EC_DABT_CUR };
        let wnr = if fault.wnr { ISS_WNR } else { 0 };
        Self {
            esr: (ec << ESR_EC_SHIFT) | ESR_IL | wnr | DFSC_SYNC_EXTERNAL,
            far: fault.vaddr,
        }
    }

    /// Exception class of the injected abort
    pub fn exception_class(&self) -> u64 {
        (self.esr >> ESR_EC_SHIFT) & 0x3f
    }
}
