//! Virtual Machine
//!
//! A VM owns a fixed set of vCPUs, the virtual devices registered for it
//! and the SPI table built from its configuration.

use alloc::vec::Vec;

use crate::config::{MAX_VCPUS_PER_VM, MAX_VDEVS_PER_VM};
use crate::core::irq::SpiTable;
use crate::core::vmm::{Vcpu, VcpuId, VmId};
use crate::core::Error;
use crate::emulator::Vdev;
use crate::Result;

/// Virtual machine
pub struct Vm {
    id: VmId,
    vcpus: Vec<Vcpu>,
    vdevs: heapless::Vec<Vdev, MAX_VDEVS_PER_VM>,
    spis: SpiTable,
    vgic_slot: Option<usize>,
}

impl core::fmt::Debug for Vm {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Vm")
            .field("id", &self.id)
            .field("vcpus", &self.vcpus.len())
            .field("vdevs", &self.vdevs.len())
            .field("spis", &self.spis.count())
            .field("vgic_slot", &self.vgic_slot)
            .finish()
    }
}

impl Vm {
    /// Create a VM with `vcpu_count` powered-off vCPUs
    pub fn new(id: VmId, vcpu_count: usize) -> Result<Self> {
        if vcpu_count == 0 || vcpu_count > MAX_VCPUS_PER_VM {
            return Err(Error::TooManyVcpus.into());
        }
        let vcpus = (0..vcpu_count)
            .map(|index| Vcpu::new(id, index as VcpuId))
            .collect();
        log::debug!("vm {} created with {} vcpus", id, vcpu_count);
        Ok(Self {
            id,
            vcpus,
            vdevs: heapless::Vec::new(),
            spis: SpiTable::new(),
            vgic_slot: None,
        })
    }

    /// VM id
    pub fn id(&self) -> VmId {
        self.id
    }

    /// vCPU by index
    pub fn vcpu(&self, index: VcpuId) -> Result<&Vcpu> {
        self.vcpus
            .get(index as usize)
            .ok_or_else(|| Error::InvalidVcpu(index).into())
    }

    /// All vCPUs
    pub fn vcpus(&self) -> &[Vcpu] {
        &self.vcpus
    }

    /// Number of vCPUs
    pub fn vcpu_count(&self) -> usize {
        self.vcpus.len()
    }

    /// vCPU pinned to physical CPU `cpu`
    ///
    /// A VM with fewer vCPUs than CPUs wraps around.
    pub fn vcpu_for_cpu(&self, cpu: usize) -> &Vcpu {
        &self.vcpus[cpu % self.vcpus.len()]
    }

    /// Registered virtual devices
    pub fn vdevs(&self) -> &[Vdev] {
        &self.vdevs
    }

    pub(crate) fn vdevs_mut(&mut self) -> &mut heapless::Vec<Vdev, MAX_VDEVS_PER_VM> {
        &mut self.vdevs
    }

    /// SPIs requested by this VM
    pub fn spi_table(&self) -> &SpiTable {
        &self.spis
    }

    /// SPIs requested by this VM, mutable
    pub fn spi_table_mut(&mut self) -> &mut SpiTable {
        &mut self.spis
    }

    /// vGIC pool slot attached to this VM
    pub fn vgic_slot(&self) -> Option<usize> {
        self.vgic_slot
    }

    pub(crate) fn set_vgic_slot(&mut self, slot: Option<usize>) {
        self.vgic_slot = slot;
    }

    /// Reset every virtual device
    pub fn reset_devices(&self) {
        for vdev in self.vdevs.iter() {
            vdev.device().reset();
        }
    }

    /// Suspend every virtual device
    pub fn suspend_devices(&self) {
        for vdev in self.vdevs.iter() {
            vdev.device().suspend();
        }
    }

    /// Resume every virtual device
    pub fn resume_devices(&self) {
        for vdev in self.vdevs.iter() {
            vdev.device().resume();
        }
    }

    /// Tear down and drop every virtual device
    pub fn deinit_devices(&mut self) {
        for vdev in self.vdevs.iter() {
            log::debug!("vm {}: deinit vdev {}", self.id, vdev.name());
            vdev.device().deinit();
        }
        self.vdevs.clear();
    }
}
