//! Hypervisor context
//!
//! [`Hypervisor`] owns everything the partitioning core shares between
//! physical CPUs: the distributor driver, the SPI ownership map, the vGIC
//! pool, the VM table and the vCPU currently running on each CPU.
//!
//! The VM table is only changed through `&mut Hypervisor` while VMs are
//! loaded. Once the CPUs are running, the context is shared by reference
//! and the VM and vdev lists are read without locking.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::arch::arm64::cpu::{current_cpu_id, FaultInfo};
use crate::arch::arm64::interrupt::vgic::VGIC_NAME;
use crate::arch::arm64::interrupt::{GicDistributor, RegisterBlock, VgicPool, VgicVdev};
use crate::config::{HypervisorConfig, HYPERVISOR_VM_ID, MAX_CPUS, MAX_VMS};
use crate::core::irq::{IrqOwnership, SpiTable};
use crate::core::mm::Stage2Mapper;
use crate::core::vmm::{Vcpu, VcpuHandle, Vm, VmId, INVALID_VM_ID};
use crate::core::Error;
use crate::emulator::{self, MmioAccess, MmioOutcome, Vdev};
use crate::Result;

const NO_VCPU: u32 = u32::MAX;

/// Partitioning hypervisor state
pub struct Hypervisor {
    config: HypervisorConfig,
    gic: Arc<GicDistributor>,
    ownership: Arc<IrqOwnership>,
    vgic: Arc<VgicPool>,
    mapper: Arc<dyn Stage2Mapper>,
    vms: Vec<Vm>,
    current: [AtomicU32; MAX_CPUS],
}

impl core::fmt::Debug for Hypervisor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Hypervisor")
            .field("config", &self.config)
            .field("gic", &self.gic)
            .field("vms", &self.vms)
            .finish()
    }
}

impl Hypervisor {
    /// Create the hypervisor over a distributor register window
    pub fn new(
        config: HypervisorConfig,
        regs: Arc<dyn RegisterBlock>,
        mapper: Arc<dyn Stage2Mapper>,
    ) -> Result<Self> {
        config.validate()?;
        let gic = Arc::new(GicDistributor::new(regs, config.gicd_base, config.gicd_size));
        let ownership = Arc::new(IrqOwnership::new());
        let vgic = Arc::new(VgicPool::new(gic.clone(), ownership.clone(), config.vgic_mode));
        Ok(Self {
            config,
            gic,
            ownership,
            vgic,
            mapper,
            vms: Vec::with_capacity(MAX_VMS),
            current: core::array::from_fn(|_| AtomicU32::new(NO_VCPU)),
        })
    }

    /// Boot-CPU initialization
    ///
    /// Maps the distributor frame, brings the distributor to its reset
    /// configuration and clears the ownership map.
    pub fn init(&self) -> Result<()> {
        crate::utils::log::init(self.config.log_level);
        log::info!("partivisor {} starting on {} cpus", crate::VERSION, self.config.cpu_count);
        self.gic.mm_init(&*self.mapper)?;
        self.gic.init()?;
        self.ownership.init();
        Ok(())
    }

    /// Per-CPU initialization of a secondary core
    pub fn secondary_init(&self, cpu: usize) -> Result<()> {
        self.check_cpu(cpu)?;
        self.gic.secondary_init(cpu)
    }

    /// Runtime configuration
    pub fn config(&self) -> &HypervisorConfig {
        &self.config
    }

    /// Physical distributor
    pub fn gic(&self) -> &GicDistributor {
        &self.gic
    }

    /// SPI ownership map
    pub fn ownership(&self) -> &IrqOwnership {
        &self.ownership
    }

    /// vGIC pool
    pub fn vgic_pool(&self) -> &Arc<VgicPool> {
        &self.vgic
    }

    pub(crate) fn check_cpu(&self, cpu: usize) -> Result<()> {
        if cpu >= self.config.cpu_count {
            return Err(Error::InvalidCpu(cpu).into());
        }
        Ok(())
    }

    /// Create a VM with `vcpu_count` powered-off vCPUs
    pub fn create_vm(&mut self, id: VmId, vcpu_count: usize) -> Result<()> {
        if id == HYPERVISOR_VM_ID || id == INVALID_VM_ID {
            return Err(Error::InvalidVm(id).into());
        }
        if self.vms.iter().any(|vm| vm.id() == id) {
            return Err(Error::VmExists(id).into());
        }
        if self.vms.len() >= MAX_VMS {
            return Err(Error::TooManyVms.into());
        }
        self.vms.push(Vm::new(id, vcpu_count)?);
        Ok(())
    }

    /// VM by id
    pub fn vm(&self, id: VmId) -> Result<&Vm> {
        self.vms
            .iter()
            .find(|vm| vm.id() == id)
            .ok_or_else(|| Error::InvalidVm(id).into())
    }

    /// VM by id, mutable
    pub fn vm_mut(&mut self, id: VmId) -> Result<&mut Vm> {
        self.vms
            .iter_mut()
            .find(|vm| vm.id() == id)
            .ok_or_else(|| Error::InvalidVm(id).into())
    }

    /// All VMs
    pub fn vms(&self) -> &[Vm] {
        &self.vms
    }

    /// vCPU by handle
    pub fn vcpu(&self, handle: VcpuHandle) -> Result<&Vcpu> {
        self.vm(handle.vm)?.vcpu(handle.index)
    }

    /// Add an SPI to a VM's table
    pub fn request_spi(&mut self, vm: VmId, id: u32) -> Result<()> {
        self.vm_mut(vm)?.spi_table_mut().allocate(id)
    }

    /// Register a virtual device for a VM
    pub fn add_vdev(&mut self, vm: VmId, vdev: Vdev) -> Result<()> {
        let mapper = self.mapper.clone();
        emulator::register_one_vdev(self.vm_mut(vm)?, vdev, &*mapper)
    }

    /// Give a VM its own vGIC at the configured distributor address
    ///
    /// Returns the pool slot.
    pub fn attach_vgic(&mut self, vm: VmId) -> Result<usize> {
        if let Some(slot) = self.vm(vm)?.vgic_slot() {
            log::warn!("vm {} already has vgic slot {}", vm, slot);
            return Err(crate::Error::ResourceBusy);
        }
        let (base, size) = (self.config.gicd_base, self.config.gicd_size);
        let slot = self.vgic.request(vm, base, size)?;
        let device = Arc::new(VgicVdev::new(self.vgic.clone(), slot));
        let vdev = Vdev::new(vm, VGIC_NAME, base, self.gic.base(), size, device);
        if let Err(err) = self.add_vdev(vm, vdev) {
            self.vgic.release(slot)?;
            return Err(err);
        }
        self.vm_mut(vm)?.set_vgic_slot(Some(slot));
        Ok(slot)
    }

    /// Route every requested SPI to its VM
    ///
    /// Tables are merged first so that an SPI requested by two VMs fails
    /// the whole routing. Lines nobody requested go to the primary VM.
    /// Returns the number of lines recorded.
    pub fn route_interrupts(&self) -> Result<usize> {
        let mut all = SpiTable::new();
        for vm in &self.vms {
            SpiTable::merge(vm.spi_table(), &mut all)?;
        }
        let mut routed: usize = self
            .vms
            .iter()
            .map(|vm| self.ownership.claim(vm.spi_table(), vm.id()))
            .sum();
        let primary = self.config.primary_vm;
        if self.vm(primary).is_ok() {
            routed += self.ownership.assign_unclaimed(primary, self.gic.nr_lines());
        } else {
            log::warn!("primary vm {} not loaded, unclaimed lines stay unrouted", primary);
        }
        Ok(routed)
    }

    /// Remove a VM, its devices and its interrupt lines
    pub fn destroy_vm(&mut self, id: VmId) -> Result<()> {
        let index = self
            .vms
            .iter()
            .position(|vm| vm.id() == id)
            .ok_or(Error::InvalidVm(id))?;
        if self.current.iter().any(|c| {
            let raw = c.load(Ordering::Acquire);
            raw != NO_VCPU && VcpuHandle::from_raw(raw).vm == id
        }) {
            return Err(crate::Error::ResourceBusy);
        }
        let mut vm = self.vms.remove(index);
        vm.deinit_devices();
        self.ownership.release_vm(id);
        log::info!("vm {} destroyed", id);
        Ok(())
    }

    /// vCPU running on `cpu`
    pub fn current(&self, cpu: usize) -> Option<VcpuHandle> {
        match self.current.get(cpu)?.load(Ordering::Acquire) {
            NO_VCPU => None,
            raw => Some(VcpuHandle::from_raw(raw)),
        }
    }

    /// VM running on `cpu`
    pub fn current_vm(&self, cpu: usize) -> Option<VmId> {
        self.current(cpu).map(|handle| handle.vm)
    }

    pub(crate) fn set_current(&self, cpu: usize, vcpu: Option<VcpuHandle>) {
        if let Some(slot) = self.current.get(cpu) {
            slot.store(vcpu.map_or(NO_VCPU, VcpuHandle::to_raw), Ordering::Release);
        }
    }

    /// Whether `hwirq` belongs to the VM running on `cpu`
    pub fn hwirq_belongs_to_current(&self, cpu: usize, hwirq: u32) -> bool {
        self.ownership.belongs_to(hwirq, self.current_vm(cpu))
    }

    /// Per-core boot
    ///
    /// Picks the VM assigned to `cpu`, binds its vCPU for this core, gives
    /// it a clean register file with the core index in its boot register
    /// and makes it current.
    pub fn cpu_main(&self, cpu: usize) -> Result<VcpuHandle> {
        self.check_cpu(cpu)?;
        let vm = self.vm(self.config.vm_for_cpu(cpu))?;
        let vcpu = vm.vcpu_for_cpu(cpu);
        {
            let mut locked = vcpu.lock();
            locked.bind_cpu(cpu);
            locked.reset()?;
            locked.set_phys_core_idx()?;
        }
        self.set_current(cpu, Some(vcpu.handle()));
        log::info!("cpu {}: booting {}", cpu, vcpu.handle());
        Ok(vcpu.handle())
    }

    /// [`Hypervisor::cpu_main`] for the calling core
    pub fn cpu_main_here(&self) -> Result<VcpuHandle> {
        self.cpu_main(current_cpu_id())
    }

    /// Emulate a trapped MMIO access of `handle` running on `cpu`
    pub fn vdev_mmio_emulation(
        &self,
        cpu: usize,
        handle: VcpuHandle,
        fault: &FaultInfo,
        value: u64,
        from_el0: bool,
    ) -> Result<MmioOutcome> {
        let vm = self.vm(handle.vm)?;
        let access = MmioAccess::from_fault(handle, self.current_vm(cpu), fault);
        emulator::vdev_mmio_emulation(vm, &access, fault.wnr, value, from_el0)
    }
}
