//! Configuration management
//!
//! Compile-time limits of the hypervisor core and the runtime
//! configuration handed over by the boot loader.

use crate::core::vmm::VmId;
use crate::{Error, Result};
use heapless::Vec;

/// Maximum number of VMs (and vGIC pool slots)
pub const MAX_VMS: usize = 16;

/// Maximum number of physical CPUs
pub const MAX_CPUS: usize = 8;

/// Maximum number of vCPUs per VM
pub const MAX_VCPUS_PER_VM: usize = 8;

/// Maximum number of virtual devices registered per VM
pub const MAX_VDEVS_PER_VM: usize = 8;

/// Maximum length of a virtual device name
pub const VDEV_NAME_SIZE: usize = 25;

/// Number of virtual interrupt ids tracked per vCPU
pub const NUM_INTIDS: usize = 1024;

/// Number of interrupt ids covered by the SPI table
pub const SPI_TABLE_SIZE: usize = 1024;

/// Default guest physical base of the GIC distributor
pub const GICD_BASE: u64 = 0x0800_0000;

/// Size of the GIC distributor frame
pub const GICD_SIZE: u64 = 0x1000;

/// VM id reserved for the hypervisor itself
pub const HYPERVISOR_VM_ID: VmId = 0;

/// VM id of the primary VM
pub const PRIMARY_VM_ID: VmId = 1;

/// Log level used when none is configured
pub const DEFAULT_LOG_LEVEL: log::LevelFilter = crate::utils::log::default_level();

/// How the vGIC presents the distributor to guests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VgicMode {
    /// Ownership-filtered emulation
    Filtered,
    /// Accesses forwarded to hardware without filtering
    Passthrough,
}

/// Hypervisor runtime configuration
#[derive(Debug, Clone)]
pub struct HypervisorConfig {
    /// Number of physical CPUs brought up
    pub cpu_count: usize,
    /// Physical base of the GIC distributor
    pub gicd_base: u64,
    /// Size of the distributor frame
    pub gicd_size: u64,
    /// vGIC presentation mode
    pub vgic_mode: VgicMode,
    /// VM receiving interrupts nobody else claimed
    pub primary_vm: VmId,
    /// VM scheduled first on each physical CPU
    pub cpu_vm: Vec<VmId, MAX_CPUS>,
    /// Maximum log level
    pub log_level: log::LevelFilter,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            cpu_count: 1,
            gicd_base: GICD_BASE,
            gicd_size: GICD_SIZE,
            vgic_mode: VgicMode::Filtered,
            primary_vm: PRIMARY_VM_ID,
            cpu_vm: Vec::new(),
            log_level: DEFAULT_LOG_LEVEL,
        }
    }
}

impl HypervisorConfig {
    /// Check the configuration against the compile-time limits
    pub fn validate(&self) -> Result<()> {
        if self.cpu_count == 0 || self.cpu_count > MAX_CPUS {
            log::error!("invalid cpu count {}", self.cpu_count);
            return Err(Error::InvalidArgument);
        }
        if self.gicd_size < GICD_SIZE || self.gicd_base % GICD_SIZE != 0 {
            log::error!(
                "invalid distributor frame {:#x}+{:#x}",
                self.gicd_base,
                self.gicd_size
            );
            return Err(Error::InvalidArgument);
        }
        if self.primary_vm == HYPERVISOR_VM_ID {
            return Err(Error::InvalidArgument);
        }
        if self.cpu_vm.len() > self.cpu_count {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }

    /// VM assigned to a physical CPU, falling back to the primary VM
    pub fn vm_for_cpu(&self, cpu: usize) -> VmId {
        self.cpu_vm.get(cpu).copied().unwrap_or(self.primary_vm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = HypervisorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.vm_for_cpu(3), PRIMARY_VM_ID);
    }

    #[test]
    fn test_invalid_config() {
        let mut config = HypervisorConfig::default();
        config.cpu_count = 0;
        assert_eq!(config.validate(), Err(Error::InvalidArgument));

        let mut config = HypervisorConfig::default();
        config.gicd_base = 0x0800_0010;
        assert_eq!(config.validate(), Err(Error::InvalidArgument));

        let mut config = HypervisorConfig::default();
        config.primary_vm = HYPERVISOR_VM_ID;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cpu_assignment() {
        let mut config = HypervisorConfig::default();
        config.cpu_count = 2;
        config.cpu_vm.push(1).unwrap();
        config.cpu_vm.push(2).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.vm_for_cpu(1), 2);
    }
}
