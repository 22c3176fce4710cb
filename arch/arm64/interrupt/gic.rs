//! GIC (Generic Interrupt Controller) distributor driver for ARM64
//!
//! GICv2 distributor access for the partitioning core. All register
//! traffic goes through one process-wide lock so that read-modify-write
//! sequences issued from different physical cores never interleave.
//!
//! Reference: ARM IHI 0048B (GIC architecture specification)

use alloc::sync::Arc;
use core::fmt;
use core::ptr::NonNull;

use bitflags::bitflags;
use volatile::VolatilePtr;

use crate::arch::Error;
use crate::core::mm::{MapMode, PhysAddr, Stage2Mapper};
use crate::core::sync::{SpinLock, SpinLockGuard};
use crate::utils::replicate_byte;
use crate::Result;

/// GIC Distributor register offsets
pub mod gicd {
    /// GICD_CTLR - Distributor Control Register
    pub const CTLR: u64 = 0x000;
    /// GICD_TYPER - Distributor Type Register
    pub const TYPER: u64 = 0x004;
    /// GICD_IIDR - Distributor Implementer ID Register
    pub const IIDR: u64 = 0x008;
    /// GICD_IGROUPR - Interrupt Group Registers
    pub const IGROUPR: u64 = 0x080;
    /// GICD_ISENABLER - Interrupt Set-Enable Registers
    pub const ISENABLER: u64 = 0x100;
    /// GICD_ICENABLER - Interrupt Clear-Enable Registers
    pub const ICENABLER: u64 = 0x180;
    /// GICD_ISPENDR - Interrupt Set-Pending Registers
    pub const ISPENDR: u64 = 0x200;
    /// GICD_ICPENDR - Interrupt Clear-Pending Registers
    pub const ICPENDR: u64 = 0x280;
    /// GICD_ISACTIVER - Interrupt Set-Active Registers
    pub const ISACTIVER: u64 = 0x300;
    /// GICD_ICACTIVER - Interrupt Clear-Active Registers
    pub const ICACTIVER: u64 = 0x380;
    /// GICD_IPRIORITYR - Interrupt Priority Registers
    pub const IPRIORITYR: u64 = 0x400;
    /// GICD_ITARGETSR - Interrupt Processor Targets Registers
    pub const ITARGETSR: u64 = 0x800;
    /// GICD_ICFGR - Interrupt Configuration Registers
    pub const ICFGR: u64 = 0xC00;
    /// GICD_NSACR - Non-secure Access Control Registers
    pub const NSACR: u64 = 0xE00;
    /// GICD_SGIR - Software Generated Interrupt Register
    pub const SGIR: u64 = 0xF00;
    /// GICD_CPENDSGIR - SGI Clear-Pending Registers
    pub const CPENDSGIR: u64 = 0xF10;
    /// GICD_SPENDSGIR - SGI Set-Pending Registers
    pub const SPENDSGIR: u64 = 0xF20;

    /// TYPER.ITLinesNumber
    pub const TYPER_LINES: u32 = 0x1f;
    /// TYPER.CPUNumber
    pub const TYPER_CPUS: u32 = 0xe0;
}

/// Lowest usable priority
pub const GIC_PRI_LOWEST: u8 = 0xf0;
/// Default priority of device interrupts
pub const GIC_PRI_IRQ: u8 = 0xa0;
/// Priority of inter-processor interrupts
pub const GIC_PRI_IPI: u8 = 0x90;
/// Highest priority handed out
pub const GIC_PRI_HIGHEST: u8 = 0x80;

/// Largest interrupt id count the GICv2 distributor can implement
pub const GIC_MAX_IRQS: u32 = 1020;

/// First shared peripheral interrupt id
pub const GIC_SPI_BASE: u32 = 32;

/// Number of software generated interrupts
pub const GIC_NR_SGIS: u32 = 16;

bitflags! {
    /// GICD_CTLR bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GicdCtlr: u32 {
        /// Forward group 0 interrupts
        const ENABLE_GRP0 = 1 << 0;
        /// Forward group 1 interrupts
        const ENABLE_GRP1 = 1 << 1;
    }
}

bitflags! {
    /// Interrupt trigger type
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IrqFlags: u32 {
        /// Rising edge
        const EDGE_RISING = 1 << 0;
        /// Falling edge
        const EDGE_FALLING = 1 << 1;
        /// Active high level
        const LEVEL_HIGH = 1 << 2;
        /// Active low level
        const LEVEL_LOW = 1 << 3;
        /// Either edge
        const EDGE_BOTH = Self::EDGE_RISING.bits() | Self::EDGE_FALLING.bits();
        /// Either level
        const LEVEL_BOTH = Self::LEVEL_HIGH.bits() | Self::LEVEL_LOW.bits();
    }
}

/// Byte-addressed register window
///
/// Implemented by the real MMIO frame and by in-memory models in tests.
pub trait RegisterBlock: Send + Sync {
    /// Read an 8-bit register
    fn read8(&self, offset: u64) -> u8;
    /// Read a 16-bit register
    fn read16(&self, offset: u64) -> u16;
    /// Read a 32-bit register
    fn read32(&self, offset: u64) -> u32;
    /// Read a 64-bit register
    fn read64(&self, offset: u64) -> u64;
    /// Write an 8-bit register
    fn write8(&self, offset: u64, value: u8);
    /// Write a 16-bit register
    fn write16(&self, offset: u64, value: u16);
    /// Write a 32-bit register
    fn write32(&self, offset: u64, value: u32);
    /// Write a 64-bit register
    fn write64(&self, offset: u64, value: u64);
}

/// Memory-mapped register frame
pub struct MmioRegion {
    base: NonNull<u8>,
    size: usize,
}

// SAFETY: the frame is device memory shared by every core; access is
// serialized by the owner's lock.
unsafe impl Send for MmioRegion {}
unsafe impl Sync for MmioRegion {}

impl MmioRegion {
    /// Create a region over `[base, base + size)`
    ///
    /// # Safety
    /// The range must be mapped with device attributes for the lifetime of
    /// the region and not aliased by ordinary memory.
    pub unsafe fn new(base: NonNull<u8>, size: usize) -> Self {
        Self { base, size }
    }

    fn ptr<T: Copy>(&self, offset: u64) -> Option<VolatilePtr<'_, T>> {
        let offset = offset as usize;
        if offset + core::mem::size_of::<T>() > self.size {
            log::error!("mmio access {:#x} outside frame of {:#x} bytes", offset, self.size);
            return None;
        }
        // SAFETY: in-bounds offset from a non-null mapped base.
        unsafe {
            let ptr = self.base.as_ptr().add(offset) as *mut T;
            Some(VolatilePtr::new(NonNull::new_unchecked(ptr)))
        }
    }

    fn read<T: Copy + Default>(&self, offset: u64) -> T {
        self.ptr::<T>(offset).map(|p| p.read()).unwrap_or_default()
    }

    fn write<T: Copy>(&self, offset: u64, value: T) {
        if let Some(p) = self.ptr::<T>(offset) {
            p.write(value);
        }
    }
}

impl RegisterBlock for MmioRegion {
    fn read8(&self, offset: u64) -> u8 {
        self.read(offset)
    }

    fn read16(&self, offset: u64) -> u16 {
        self.read(offset)
    }

    fn read32(&self, offset: u64) -> u32 {
        self.read(offset)
    }

    fn read64(&self, offset: u64) -> u64 {
        self.read(offset)
    }

    fn write8(&self, offset: u64, value: u8) {
        self.write(offset, value)
    }

    fn write16(&self, offset: u64, value: u16) {
        self.write(offset, value)
    }

    fn write32(&self, offset: u64, value: u32) {
        self.write(offset, value)
    }

    fn write64(&self, offset: u64, value: u64) {
        self.write(offset, value)
    }
}

/// State discovered at distributor init
#[derive(Debug, Clone, Copy)]
struct DistState {
    nr_lines: u32,
    cpus: u32,
}

/// GIC Distributor
pub struct GicDistributor {
    regs: Arc<dyn RegisterBlock>,
    base: PhysAddr,
    size: u64,
    state: SpinLock<DistState>,
}

impl fmt::Debug for GicDistributor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GicDistributor")
            .field("base", &self.base)
            .field("size", &self.size)
            .finish()
    }
}

/// Held distributor lock with raw register access
pub struct DistributorGuard<'a> {
    regs: &'a dyn RegisterBlock,
    state: SpinLockGuard<'a, DistState>,
}

impl<'a> DistributorGuard<'a> {
    /// Read a 32-bit register
    #[inline]
    pub fn read32(&self, offset: u64) -> u32 {
        self.regs.read32(offset)
    }

    /// Write a 32-bit register
    #[inline]
    pub fn write32(&self, offset: u64, value: u32) {
        self.regs.write32(offset, value)
    }

    /// Read a register of 1, 2, 4 or 8 bytes
    pub fn read(&self, offset: u64, size: u8) -> Result<u64> {
        Ok(match size {
            1 => self.regs.read8(offset) as u64,
            2 => self.regs.read16(offset) as u64,
            4 => self.regs.read32(offset) as u64,
            8 => self.regs.read64(offset),
            _ => return Err(Error::UnsupportedAccessSize(size).into()),
        })
    }

    /// Write a register of 1, 2, 4 or 8 bytes
    pub fn write(&self, offset: u64, value: u64, size: u8) -> Result<()> {
        match size {
            1 => self.regs.write8(offset, value as u8),
            2 => self.regs.write16(offset, value as u16),
            4 => self.regs.write32(offset, value as u32),
            8 => self.regs.write64(offset, value),
            _ => return Err(Error::UnsupportedAccessSize(size).into()),
        }
        Ok(())
    }

    /// Number of interrupt lines handled by the distributor
    pub fn nr_lines(&self) -> u32 {
        self.state.nr_lines
    }

    fn check_spi(&self, irq: u32) -> Result<()> {
        if irq < GIC_SPI_BASE || irq >= self.state.nr_lines {
            return Err(Error::InvalidIrq(irq).into());
        }
        Ok(())
    }

    fn set_bit(&self, bank: u64, irq: u32) {
        self.write32(bank + (irq / 32) as u64 * 4, 1 << (irq % 32));
    }

    fn test_bit(&self, bank: u64, irq: u32) -> bool {
        self.read32(bank + (irq / 32) as u64 * 4) & (1 << (irq % 32)) != 0
    }
}

impl GicDistributor {
    /// Create a distributor driver over a register window
    pub fn new(regs: Arc<dyn RegisterBlock>, base: PhysAddr, size: u64) -> Self {
        Self {
            regs,
            base,
            size,
            state: SpinLock::new(DistState {
                nr_lines: GIC_MAX_IRQS,
                cpus: 1,
            }),
        }
    }

    /// Physical base address of the distributor frame
    pub fn base(&self) -> PhysAddr {
        self.base
    }

    /// Size of the distributor frame
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Acquire the distributor lock
    pub fn lock(&self) -> DistributorGuard<'_> {
        DistributorGuard {
            regs: &*self.regs,
            state: self.state.lock(),
        }
    }

    /// Read a register of 1, 2, 4 or 8 bytes
    pub fn get_direct(&self, offset: u64, size: u8) -> Result<u64> {
        self.lock().read(offset, size)
    }

    /// Write a register of 1, 2, 4 or 8 bytes
    pub fn set_direct(&self, offset: u64, value: u64, size: u8) -> Result<()> {
        self.lock().write(offset, value, size)
    }

    /// Read GICD_CTLR
    pub fn ctlr(&self) -> u32 {
        self.lock().read32(gicd::CTLR)
    }

    /// Read GICD_TYPER
    pub fn typer(&self) -> u32 {
        self.lock().read32(gicd::TYPER)
    }

    /// Read GICD_IIDR
    pub fn iidr(&self) -> u32 {
        self.lock().read32(gicd::IIDR)
    }

    /// Number of interrupt lines, clamped to 1020 after init
    pub fn nr_lines(&self) -> u32 {
        self.state.lock().nr_lines
    }

    /// Number of CPU interfaces reported by TYPER
    pub fn cpu_count(&self) -> u32 {
        self.state.lock().cpus
    }

    /// Disable forwarding of an interrupt
    pub fn mask_irq(&self, irq: u32) -> Result<()> {
        let gic = self.lock();
        gic.check_spi(irq)?;
        gic.set_bit(gicd::ICENABLER, irq);
        Ok(())
    }

    /// Enable forwarding of an interrupt
    pub fn unmask_irq(&self, irq: u32) -> Result<()> {
        let gic = self.lock();
        gic.check_spi(irq)?;
        gic.set_bit(gicd::ISENABLER, irq);
        Ok(())
    }

    /// Whether an interrupt is enabled
    pub fn is_irq_enabled(&self, irq: u32) -> Result<bool> {
        let gic = self.lock();
        gic.check_spi(irq)?;
        Ok(gic.test_bit(gicd::ISENABLER, irq))
    }

    /// Per-CPU masking is not available on the distributor
    pub fn mask_irq_cpu(&self, irq: u32, cpu: usize) {
        log::info!("not support mask irq {} percpu (cpu {})", irq, cpu);
    }

    /// Per-CPU unmasking is not available on the distributor
    pub fn unmask_irq_cpu(&self, irq: u32, cpu: usize) {
        log::info!("not support unmask irq {} percpu (cpu {})", irq, cpu);
    }

    /// Set the priority byte of an interrupt
    pub fn set_irq_priority(&self, irq: u32, priority: u8) -> Result<()> {
        let gic = self.lock();
        gic.check_spi(irq)?;
        gic.write(gicd::IPRIORITYR + irq as u64, priority as u64, 1)
    }

    /// Get the priority byte of an interrupt
    pub fn get_irq_priority(&self, irq: u32) -> Result<u8> {
        let gic = self.lock();
        gic.check_spi(irq)?;
        Ok(gic.read(gicd::IPRIORITYR + irq as u64, 1)? as u8)
    }

    /// Route an interrupt to a CPU target mask
    pub fn set_irq_affinity(&self, irq: u32, targets: u8) -> Result<()> {
        let gic = self.lock();
        gic.check_spi(irq)?;
        gic.write(gicd::ITARGETSR + irq as u64, targets as u64, 1)
    }

    /// CPU target mask of an interrupt
    pub fn get_irq_affinity(&self, irq: u32) -> Result<u8> {
        let gic = self.lock();
        gic.check_spi(irq)?;
        Ok(gic.read(gicd::ITARGETSR + irq as u64, 1)? as u8)
    }

    /// Configure an interrupt as level or edge triggered
    pub fn set_irq_type(&self, irq: u32, flags: IrqFlags) -> Result<()> {
        let gic = self.lock();
        if irq < GIC_NR_SGIS || irq >= gic.nr_lines() {
            return Err(Error::InvalidIrq(irq).into());
        }

        let offset = gicd::ICFGR + (irq / 16) as u64 * 4;
        let edgebit = 2u32 << (2 * (irq % 16));
        let mut cfg = gic.read32(offset);
        if flags.intersects(IrqFlags::LEVEL_BOTH) {
            cfg &= !edgebit;
        } else if flags.intersects(IrqFlags::EDGE_BOTH) {
            cfg |= edgebit;
        }
        gic.write32(offset, cfg);
        Ok(())
    }

    /// Raw 2-bit ICFGR field of an interrupt
    pub fn get_irq_type(&self, irq: u32) -> Result<u32> {
        let gic = self.lock();
        if irq >= gic.nr_lines() {
            return Err(Error::InvalidIrq(irq).into());
        }
        let cfg = gic.read32(gicd::ICFGR + (irq / 16) as u64 * 4);
        Ok((cfg >> ((irq % 16) * 2)) & 0x3)
    }

    /// Set an interrupt pending
    pub fn set_irq_pending(&self, irq: u32) -> Result<()> {
        let gic = self.lock();
        gic.check_spi(irq)?;
        gic.set_bit(gicd::ISPENDR, irq);
        Ok(())
    }

    /// Clear a pending interrupt
    pub fn clear_irq_pending(&self, irq: u32) -> Result<()> {
        let gic = self.lock();
        gic.check_spi(irq)?;
        gic.set_bit(gicd::ICPENDR, irq);
        Ok(())
    }

    /// Whether an interrupt is pending
    pub fn is_irq_pending(&self, irq: u32) -> Result<bool> {
        let gic = self.lock();
        gic.check_spi(irq)?;
        Ok(gic.test_bit(gicd::ISPENDR, irq))
    }

    /// Set an interrupt active
    pub fn activate_irq(&self, irq: u32) -> Result<()> {
        let gic = self.lock();
        gic.check_spi(irq)?;
        gic.set_bit(gicd::ISACTIVER, irq);
        Ok(())
    }

    /// Clear the active state of an interrupt
    pub fn deactivate_irq(&self, irq: u32) -> Result<()> {
        let gic = self.lock();
        gic.check_spi(irq)?;
        gic.set_bit(gicd::ICACTIVER, irq);
        Ok(())
    }

    /// Whether an interrupt is active
    pub fn is_irq_active(&self, irq: u32) -> Result<bool> {
        let gic = self.lock();
        gic.check_spi(irq)?;
        Ok(gic.test_bit(gicd::ISACTIVER, irq))
    }

    /// Assign an interrupt to group 0 or group 1
    pub fn set_irq_group(&self, irq: u32, group: u8) -> Result<()> {
        let gic = self.lock();
        gic.check_spi(irq)?;
        let offset = gicd::IGROUPR + (irq / 32) as u64 * 4;
        let bit = 1u32 << (irq % 32);
        let value = gic.read32(offset);
        gic.write32(offset, if group != 0 { value | bit } else { value & !bit });
        Ok(())
    }

    /// Group of an interrupt
    pub fn get_irq_group(&self, irq: u32) -> Result<u8> {
        let gic = self.lock();
        gic.check_spi(irq)?;
        Ok(gic.test_bit(gicd::IGROUPR, irq) as u8)
    }

    /// Write GICD_SGIR
    pub fn send_sgi_raw(&self, sgir: u32) {
        self.lock().write32(gicd::SGIR, sgir);
    }

    fn check_sgi(sgi: u32) -> Result<()> {
        if sgi >= GIC_NR_SGIS {
            return Err(Error::InvalidIrq(sgi).into());
        }
        Ok(())
    }

    /// Clear the pending state of an SGI for the source CPUs in `mask`
    pub fn clear_sgi_pending(&self, sgi: u32, mask: u8) -> Result<()> {
        Self::check_sgi(sgi)?;
        self.lock().write(gicd::CPENDSGIR + sgi as u64, mask as u64, 1)
    }

    /// Pending source CPUs of an SGI
    pub fn sgi_pending_state(&self, sgi: u32) -> Result<u8> {
        Self::check_sgi(sgi)?;
        Ok(self.lock().read(gicd::CPENDSGIR + sgi as u64, 1)? as u8)
    }

    /// Set an SGI pending for the source CPUs in `mask`
    pub fn set_sgi_pending(&self, sgi: u32, mask: u8) -> Result<()> {
        Self::check_sgi(sgi)?;
        self.lock().write(gicd::SPENDSGIR + sgi as u64, mask as u64, 1)
    }

    /// Pending source CPUs of an SGI, read through SPENDSGIR
    pub fn sgi_set_pending_state(&self, sgi: u32) -> Result<u8> {
        Self::check_sgi(sgi)?;
        Ok(self.lock().read(gicd::SPENDSGIR + sgi as u64, 1)? as u8)
    }

    /// Log the distributor register file
    pub fn dump_registers(&self) {
        let gic = self.lock();
        log::debug!("DUMP GIC Registers...");
        for reg in (0..0xF30u64).step_by(0x10) {
            log::debug!(
                "REG-{:03x}: {:08x}  {:08x}  {:08x}  {:08x}",
                reg,
                gic.read32(reg),
                gic.read32(reg + 4),
                gic.read32(reg + 8),
                gic.read32(reg + 0xc)
            );
        }
    }

    /// Boot-time distributor initialization
    ///
    /// Every SPI is left level triggered, routed to the boot CPU's target
    /// mask, at [`GIC_PRI_IRQ`] and disabled; the distributor is then
    /// re-enabled.
    pub fn init(&self) -> Result<()> {
        log::info!("gicv2 distributor init at {:#x}", self.base);
        let mut gic = self.lock();

        let mut cpumask = gic.read32(gicd::ITARGETSR) & 0xff;
        if cpumask == 0 {
            cpumask = 1;
        }
        let cpumask = replicate_byte(cpumask as u8);

        gic.write32(gicd::CTLR, 0);

        let typer = gic.read32(gicd::TYPER);
        let nr_lines = 32 * ((typer & gicd::TYPER_LINES) + 1);
        let cpus = ((typer & gicd::TYPER_CPUS) >> 5) + 1;

        for irq in (GIC_SPI_BASE..nr_lines).step_by(16) {
            gic.write32(gicd::ICFGR + (irq / 16) as u64 * 4, 0);
        }
        for irq in (GIC_SPI_BASE..nr_lines).step_by(4) {
            gic.write32(gicd::ITARGETSR + (irq / 4) as u64 * 4, cpumask);
        }
        let priority = replicate_byte(GIC_PRI_IRQ);
        for irq in (GIC_SPI_BASE..nr_lines).step_by(4) {
            gic.write32(gicd::IPRIORITYR + (irq / 4) as u64 * 4, priority);
        }
        for irq in (GIC_SPI_BASE..nr_lines).step_by(32) {
            gic.write32(gicd::ICENABLER + (irq / 32) as u64 * 4, 0xffff_ffff);
        }

        gic.state.nr_lines = nr_lines.min(GIC_MAX_IRQS);
        gic.state.cpus = cpus;

        gic.write32(gicd::CTLR, GicdCtlr::ENABLE_GRP0.bits());

        log::info!(
            "gicv2: {} lines, {} cpu interfaces, cpumask {:#x}",
            gic.state.nr_lines,
            cpus,
            cpumask
        );
        Ok(())
    }

    /// Per-core bring-up; the distributor holds no banked state to set up
    pub fn secondary_init(&self, cpu: usize) -> Result<()> {
        log::debug!("gicv2 secondary init on cpu {}", cpu);
        Ok(())
    }

    /// Map the distributor frame into the hypervisor address space
    pub fn mm_init(&self, mapper: &dyn Stage2Mapper) -> Result<()> {
        mapper.identity_map(self.base, self.base + self.size, MapMode::R | MapMode::W | MapMode::D)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{distributor, FakeGicd};
    use super::*;
    use crate::core::mm::testing::{MapCall, RecordingMapper};
    use test_case::test_case;

    #[test]
    fn test_dist_init_64_lines() {
        let (fake, dist) = distributor(64);
        fake.force_enabled(40, true);
        fake.force_enabled(63, true);
        dist.init().unwrap();

        assert_eq!(dist.nr_lines(), 64);
        assert_eq!(dist.cpu_count(), 4);
        assert_eq!(fake.peek32(gicd::ICFGR + 8), 0);
        assert_eq!(fake.peek32(gicd::ICFGR + 12), 0);
        for word in 8..16u64 {
            assert_eq!(fake.peek32(gicd::IPRIORITYR + word * 4), 0xA0A0_A0A0);
            assert_eq!(fake.peek32(gicd::ITARGETSR + word * 4), 0x0101_0101);
        }
        // beyond the implemented lines nothing is touched
        assert_eq!(fake.peek32(gicd::IPRIORITYR + 16 * 4), 0);
        for irq in 32..64 {
            assert!(!fake.enabled(irq));
        }
        assert_eq!(fake.peek32(gicd::CTLR) & GicdCtlr::ENABLE_GRP0.bits(), 1);
    }

    #[test]
    fn test_dist_init_clamps_lines() {
        let (_fake, dist) = distributor(1024);
        dist.init().unwrap();
        assert_eq!(dist.nr_lines(), GIC_MAX_IRQS);
    }

    #[test]
    fn test_dist_init_zero_cpumask_defaults_to_cpu0() {
        let fake = FakeGicd::shared(64, 1);
        fake.write8(gicd::ITARGETSR, 0);
        let dist = GicDistributor::new(fake.clone(), 0, 0x1000);
        dist.init().unwrap();
        assert_eq!(fake.peek32(gicd::ITARGETSR + 32), 0x0101_0101);
    }

    #[test_case(32, 0)]
    #[test_case(33, 0x80)]
    #[test_case(100, 0xa0)]
    #[test_case(1019, 0xff)]
    fn test_priority_round_trip(irq: u32, priority: u8) {
        let (_fake, dist) = distributor(1024);
        dist.set_irq_priority(irq, priority).unwrap();
        assert_eq!(dist.get_irq_priority(irq).unwrap(), priority);
    }

    #[test]
    fn test_priority_round_trip_all() {
        let (_fake, dist) = distributor(1024);
        for irq in 32..GIC_MAX_IRQS {
            let p = (irq * 7 % 256) as u8;
            dist.set_irq_priority(irq, p).unwrap();
            assert_eq!(dist.get_irq_priority(irq).unwrap(), p);
        }
    }

    #[test_case(0)]
    #[test_case(15)]
    #[test_case(31)]
    #[test_case(1020)]
    fn test_rejects_non_spi(irq: u32) {
        let (_fake, dist) = distributor(1024);
        assert_eq!(
            dist.set_irq_priority(irq, 0x10),
            Err(crate::Error::ArchError(Error::InvalidIrq(irq)))
        );
        assert!(dist.mask_irq(irq).is_err());
        assert!(dist.set_irq_affinity(irq, 1).is_err());
    }

    #[test]
    fn test_mask_unmask() {
        let (fake, dist) = distributor(64);
        dist.unmask_irq(45).unwrap();
        assert!(fake.enabled(45));
        assert!(dist.is_irq_enabled(45).unwrap());
        dist.unmask_irq(46).unwrap();
        dist.mask_irq(45).unwrap();
        assert!(!fake.enabled(45));
        assert!(fake.enabled(46));
    }

    #[test]
    fn test_pending_active() {
        let (fake, dist) = distributor(64);
        dist.set_irq_pending(50).unwrap();
        assert!(dist.is_irq_pending(50).unwrap());
        dist.clear_irq_pending(50).unwrap();
        assert!(!fake.pending(50));

        dist.activate_irq(51).unwrap();
        assert!(dist.is_irq_active(51).unwrap());
        dist.deactivate_irq(51).unwrap();
        assert!(!fake.active(51));
    }

    #[test]
    fn test_irq_type() {
        let (_fake, dist) = distributor(64);
        dist.set_irq_type(40, IrqFlags::EDGE_RISING).unwrap();
        assert_eq!(dist.get_irq_type(40).unwrap(), 0b10);
        dist.set_irq_type(40, IrqFlags::LEVEL_HIGH).unwrap();
        assert_eq!(dist.get_irq_type(40).unwrap(), 0);
        // PPIs may be configured, SGIs may not
        dist.set_irq_type(20, IrqFlags::EDGE_BOTH).unwrap();
        assert_eq!(dist.get_irq_type(20).unwrap(), 0b10);
        assert!(dist.set_irq_type(3, IrqFlags::EDGE_RISING).is_err());
    }

    #[test]
    fn test_group_read_modify_write() {
        let (_fake, dist) = distributor(64);
        dist.set_irq_group(33, 1).unwrap();
        dist.set_irq_group(34, 1).unwrap();
        dist.set_irq_group(33, 0).unwrap();
        assert_eq!(dist.get_irq_group(33).unwrap(), 0);
        assert_eq!(dist.get_irq_group(34).unwrap(), 1);
    }

    #[test]
    fn test_affinity() {
        let (_fake, dist) = distributor(64);
        dist.set_irq_affinity(60, 0x4).unwrap();
        assert_eq!(dist.get_irq_affinity(60).unwrap(), 0x4);
    }

    #[test]
    fn test_sgi_helpers() {
        let (fake, dist) = distributor(64);
        dist.set_sgi_pending(3, 0b101).unwrap();
        assert_eq!(dist.sgi_pending_state(3).unwrap(), 0b101);
        dist.clear_sgi_pending(3, 0b001).unwrap();
        assert_eq!(dist.sgi_set_pending_state(3).unwrap(), 0b100);
        assert!(dist.set_sgi_pending(16, 1).is_err());

        dist.send_sgi_raw(0x0002_0005);
        assert_eq!(fake.sgir_writes(), std::vec![0x0002_0005]);
    }

    #[test_case(1)]
    #[test_case(2)]
    #[test_case(4)]
    #[test_case(8)]
    fn test_direct_sizes(size: u8) {
        let (_fake, dist) = distributor(64);
        dist.set_direct(gicd::IPRIORITYR + 64, 0x1122_3344_5566_7788, size).unwrap();
        let expected = 0x1122_3344_5566_7788u64 & crate::utils::byte_mask(size as u32);
        assert_eq!(dist.get_direct(gicd::IPRIORITYR + 64, size).unwrap(), expected);
    }

    #[test]
    fn test_direct_rejects_odd_size() {
        let (_fake, dist) = distributor(64);
        assert_eq!(
            dist.get_direct(0, 3),
            Err(crate::Error::ArchError(Error::UnsupportedAccessSize(3)))
        );
        assert!(dist.set_direct(0, 0, 16).is_err());
    }

    #[test]
    fn test_mm_init_maps_frame() {
        let (_fake, dist) = distributor(64);
        let mapper = RecordingMapper::default();
        dist.mm_init(&mapper).unwrap();
        assert_eq!(
            mapper.calls(),
            std::vec![MapCall::Map(
                crate::config::GICD_BASE,
                crate::config::GICD_BASE + 0x1000,
                MapMode::R | MapMode::W | MapMode::D
            )]
        );
    }
}
