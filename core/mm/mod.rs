//! Memory management interface
//!
//! Page tables live outside the partitioning core. This module defines
//! the addresses, mapping modes and the [`Stage2Mapper`] trait through
//! which the core asks for identity maps of device frames and for guest
//! ranges to be unmapped so that accesses trap.

use bitflags::bitflags;

use crate::core::vmm::VmId;
use crate::Result;

/// Physical address type
pub type PhysAddr = u64;

/// Intermediate (guest) physical address type
pub type IpAddr = u64;

/// Page size (4KB)
pub const PAGE_SIZE: u64 = 4096;

bitflags! {
    /// Mapping and access modes
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapMode: u32 {
        /// Readable
        const R = 1 << 0;
        /// Writable
        const W = 1 << 1;
        /// Executable
        const X = 1 << 2;
        /// Device memory attributes
        const D = 1 << 3;
    }
}

/// Stage-1 and stage-2 page table operations used by the core
pub trait Stage2Mapper: Send + Sync {
    /// Identity-map `[begin, end)` into the hypervisor's stage-1 tables
    fn identity_map(&self, begin: PhysAddr, end: PhysAddr, mode: MapMode) -> Result<()>;

    /// Remove `[begin, end)` from a VM's stage-2 tables
    fn vm_unmap(&self, vm: VmId, begin: IpAddr, end: IpAddr) -> Result<()>;
}
