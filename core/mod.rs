//! Core hypervisor modules
//!
//! This module contains the architecture-neutral part of the hypervisor:
//! VM and vCPU objects, scheduling glue, interrupt ownership and the
//! memory management interface.

pub mod hypervisor;
pub mod irq;
pub mod mm;
pub mod sched;
pub mod sync;
pub mod vmm;

use core::fmt;

use self::irq::IntId;
use self::vmm::{VcpuId, VmId};

/// Core error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Id is not a shared peripheral interrupt
    InvalidSpi(IntId),
    /// SPI already allocated in this table
    AlreadyAllocated(IntId),
    /// SPI requested by two tables being merged
    Conflict(IntId),
    /// Virtual interrupt id outside the per-vCPU range
    InvalidIntId(IntId),
    /// No VM with this id
    InvalidVm(VmId),
    /// VM id already in use
    VmExists(VmId),
    /// VM table is full
    TooManyVms,
    /// No vCPU with this index in the VM
    InvalidVcpu(VcpuId),
    /// vCPU count outside the supported range
    TooManyVcpus,
    /// Physical CPU index out of range
    InvalidCpu(usize),
    /// vCPU registers are live on a physical CPU
    RegsUnavailable,
    /// vCPU is powered off
    VcpuOff,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidSpi(id) => write!(f, "invalid SPI id {}", id),
            Error::AlreadyAllocated(id) => write!(f, "SPI {} already allocated", id),
            Error::Conflict(id) => write!(f, "SPI {} requested twice", id),
            Error::InvalidIntId(id) => write!(f, "invalid interrupt id {}", id),
            Error::InvalidVm(vm) => write!(f, "no vm {}", vm),
            Error::VmExists(vm) => write!(f, "vm {} already exists", vm),
            Error::TooManyVms => write!(f, "too many vms"),
            Error::InvalidVcpu(vcpu) => write!(f, "no vcpu {}", vcpu),
            Error::TooManyVcpus => write!(f, "unsupported vcpu count"),
            Error::InvalidCpu(cpu) => write!(f, "no cpu {}", cpu),
            Error::RegsUnavailable => write!(f, "vcpu registers unavailable"),
            Error::VcpuOff => write!(f, "vcpu is off"),
        }
    }
}
