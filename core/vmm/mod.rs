//! Virtual Machine Manager (VMM)
//!
//! VM and vCPU objects. A VM owns its vCPUs and its registered virtual
//! devices; both lists are fixed once the VM has been loaded.

pub mod vcpu;
pub mod vm;

pub use vcpu::{TwoVcpuLocked, Vcpu, VcpuLocked, VcpuState};
pub use vm::Vm;

/// VM ID type
pub type VmId = u16;

/// VCPU index within its VM
pub type VcpuId = u16;

/// Reserved VM id never handed to a VM
pub const INVALID_VM_ID: VmId = 0xffff;

/// Stable identity of a vCPU, totally ordered by VM then index
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VcpuHandle {
    /// Owning VM
    pub vm: VmId,
    /// Index within the VM
    pub index: VcpuId,
}

impl VcpuHandle {
    /// Create a handle
    pub const fn new(vm: VmId, index: VcpuId) -> Self {
        Self { vm, index }
    }

    /// Pack into a word for per-CPU atomics
    pub(crate) const fn to_raw(self) -> u32 {
        ((self.vm as u32) << 16) | self.index as u32
    }

    /// Unpack from [`VcpuHandle::to_raw`]
    pub(crate) const fn from_raw(raw: u32) -> Self {
        Self {
            vm: (raw >> 16) as VmId,
            index: raw as VcpuId,
        }
    }
}

impl core::fmt::Display for VcpuHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "vm{}/vcpu{}", self.vm, self.index)
    }
}
