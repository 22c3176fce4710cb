//! Device emulator module
//!
//! Virtual devices are MMIO ranges of a VM's guest physical space whose
//! stage-2 mapping is removed so that every access traps. The trap
//! handler decodes the access and hands it to the device registered for
//! the range through [`vdev_mmio_emulation`].

use alloc::sync::Arc;
use core::fmt;

use crate::arch::arm64::cpu::{FaultInfo, InjectedAbort};
use crate::config::{MAX_VDEVS_PER_VM, VDEV_NAME_SIZE};
use crate::core::mm::{IpAddr, PhysAddr, Stage2Mapper};
use crate::core::vmm::{VcpuHandle, Vm, VmId};
use crate::Result;

/// Emulator error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmulatorError {
    /// The device range could not be unmapped from the VM
    RegistrationFailed,
    /// The VM device list is full
    DeviceListFull,
    /// No device at the address
    DeviceNotFound,
    /// Access the device cannot handle
    InvalidAccess,
}

impl fmt::Display for EmulatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmulatorError::RegistrationFailed => write!(f, "vdev registration failed"),
            EmulatorError::DeviceListFull => write!(f, "vdev list full"),
            EmulatorError::DeviceNotFound => write!(f, "no vdev at address"),
            EmulatorError::InvalidAccess => write!(f, "invalid vdev access"),
        }
    }
}

/// A trapped MMIO access as seen by a device
#[derive(Debug, Clone, Copy)]
pub struct MmioAccess<'a> {
    /// Faulting vCPU
    pub vcpu: VcpuHandle,
    /// VM running on the faulting CPU
    pub current_vm: Option<VmId>,
    /// Decoded syndrome
    pub fault: &'a FaultInfo,
    /// Guest physical address of the access
    pub addr: IpAddr,
    /// Width in bytes
    pub size: u8,
}

impl<'a> MmioAccess<'a> {
    /// Build the access described by a decoded fault
    pub fn from_fault(vcpu: VcpuHandle, current_vm: Option<VmId>, fault: &'a FaultInfo) -> Self {
        Self {
            vcpu,
            current_vm,
            fault,
            addr: fault.ipaddr,
            size: fault.size(),
        }
    }
}

/// Emulated MMIO device
///
/// `read` and `write` receive the offset of the access inside the
/// device range. The remaining hooks follow the VM lifecycle and do
/// nothing by default.
pub trait VirtualDevice: Send + Sync {
    /// Device name
    fn name(&self) -> &str;

    /// Emulate a load
    fn read(&self, access: &MmioAccess<'_>, offset: u64) -> Result<u64>;

    /// Emulate a store
    fn write(&self, access: &MmioAccess<'_>, offset: u64, value: u64) -> Result<()>;

    /// Return to the power-on state
    fn reset(&self) {}

    /// Release resources held for the VM
    fn deinit(&self) {}

    /// Quiesce before the VM is suspended
    fn suspend(&self) {}

    /// Restart after [`VirtualDevice::suspend`]
    fn resume(&self) {}
}

/// A device range registered in a VM
#[derive(Clone)]
pub struct Vdev {
    name: heapless::String<VDEV_NAME_SIZE>,
    vm: VmId,
    gvm_paddr: IpAddr,
    hvm_paddr: PhysAddr,
    mem_size: u64,
    device: Arc<dyn VirtualDevice>,
}

impl fmt::Debug for Vdev {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vdev")
            .field("name", &self.name.as_str())
            .field("vm", &self.vm)
            .field("gvm_paddr", &format_args!("{:#x}", self.gvm_paddr))
            .field("mem_size", &format_args!("{:#x}", self.mem_size))
            .finish()
    }
}

impl Vdev {
    /// Describe a device occupying `[gvm_paddr, gvm_paddr + mem_size)`
    pub fn new(
        vm: VmId,
        name: &str,
        gvm_paddr: IpAddr,
        hvm_paddr: PhysAddr,
        mem_size: u64,
        device: Arc<dyn VirtualDevice>,
    ) -> Self {
        let mut vdev = Self {
            name: heapless::String::new(),
            vm,
            gvm_paddr,
            hvm_paddr,
            mem_size,
            device,
        };
        vdev.set_name(name);
        vdev
    }

    /// Set the name, truncated to [`VDEV_NAME_SIZE`] bytes
    pub fn set_name(&mut self, name: &str) {
        self.name.clear();
        for c in name.chars() {
            if self.name.push(c).is_err() {
                break;
            }
        }
    }

    /// Device name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owning VM
    pub fn vm(&self) -> VmId {
        self.vm
    }

    /// Guest physical base
    pub fn gvm_paddr(&self) -> IpAddr {
        self.gvm_paddr
    }

    /// Host physical base backing the range
    pub fn hvm_paddr(&self) -> PhysAddr {
        self.hvm_paddr
    }

    /// Size of the range
    pub fn mem_size(&self) -> u64 {
        self.mem_size
    }

    /// Device implementation
    pub fn device(&self) -> &dyn VirtualDevice {
        &*self.device
    }

    /// Whether `addr` falls inside the range
    pub fn contains(&self, addr: IpAddr) -> bool {
        addr >= self.gvm_paddr && addr - self.gvm_paddr < self.mem_size
    }
}

/// Result of emulating a trapped access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmioOutcome {
    /// Load completed with this value
    Read(u64),
    /// Store completed
    Written,
    /// No device claimed the address; deliver this abort to the guest
    InjectAbort(InjectedAbort),
}

/// Link a device into a VM and make its range trap
pub fn register_one_vdev(vm: &mut Vm, vdev: Vdev, mapper: &dyn Stage2Mapper) -> Result<()> {
    if vm.vdevs().len() >= MAX_VDEVS_PER_VM {
        log::error!("vm {}: no room for vdev {}", vm.id(), vdev.name());
        return Err(EmulatorError::DeviceListFull.into());
    }
    let end = match vdev.gvm_paddr.checked_add(vdev.mem_size) {
        Some(end) => end,
        None => {
            log::error!(
                "vm {}: vdev {} window {:#x}+{:#x} wraps",
                vm.id(),
                vdev.name(),
                vdev.gvm_paddr,
                vdev.mem_size
            );
            return Err(EmulatorError::RegistrationFailed.into());
        }
    };
    if let Some(other) = vm
        .vdevs()
        .iter()
        .find(|other| vdev.gvm_paddr < other.gvm_paddr + other.mem_size && other.gvm_paddr < end)
    {
        log::error!(
            "vm {}: vdev {} at {:#x}-{:#x} overlaps vdev {}",
            vm.id(),
            vdev.name(),
            vdev.gvm_paddr,
            end,
            other.name()
        );
        return Err(EmulatorError::RegistrationFailed.into());
    }
    if let Err(err) = mapper.vm_unmap(vm.id(), vdev.gvm_paddr, end) {
        log::error!(
            "vm {}: unmapping {:#x}-{:#x} for vdev {} failed: {}",
            vm.id(),
            vdev.gvm_paddr,
            end,
            vdev.name(),
            err
        );
        return Err(EmulatorError::RegistrationFailed.into());
    }
    log::info!(
        "vm {}: vdev {} at {:#x}-{:#x}",
        vm.id(),
        vdev.name(),
        vdev.gvm_paddr,
        end
    );
    vm.vdevs_mut()
        .push(vdev)
        .map_err(|_| EmulatorError::DeviceListFull.into())
}

/// Route a trapped access to the device registered at its address
///
/// An address outside every registered range yields
/// [`MmioOutcome::InjectAbort`] with a synchronous external data abort.
pub fn vdev_mmio_emulation(
    vm: &Vm,
    access: &MmioAccess<'_>,
    write: bool,
    value: u64,
    from_el0: bool,
) -> Result<MmioOutcome> {
    let vdev = match vm.vdevs().iter().find(|vdev| vdev.contains(access.addr)) {
        Some(vdev) => vdev,
        None => {
            log::warn!(
                "{}: no vdev at {:#x} ({} {} bytes), injecting abort",
                access.vcpu,
                access.addr,
                if write { "write" } else { "read" },
                access.size
            );
            return Ok(MmioOutcome::InjectAbort(InjectedAbort::external_data_abort(
                access.fault,
                from_el0,
            )));
        }
    };
    let offset = access.addr - vdev.gvm_paddr;
    if write {
        vdev.device().write(access, offset, value)?;
        Ok(MmioOutcome::Written)
    } else {
        vdev.device().read(access, offset).map(MmioOutcome::Read)
    }
}
