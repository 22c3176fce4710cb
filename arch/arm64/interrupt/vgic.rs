//! VGIC (Virtual GIC) distributor emulation for ARM64
//!
//! Guests see a GICv2 distributor frame whose stage-2 mapping is removed,
//! so every access traps and lands here. Each access is classified against
//! one register layout table, decoded into the window of interrupt ids it
//! covers, and filtered against the SPI ownership map: a VM can only
//! observe and change the bits of interrupts it owns. SGIs and PPIs
//! always belong to the running VM.
//!
//! CTLR, TYPER and IIDR are shadowed per VM. Everything else goes to the
//! physical distributor under its lock.
//!
//! Reference: ARM IHI 0048B, section 4.3 (distributor register map)

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering};

use super::gic::{gicd, GicDistributor};
use crate::arch::Error;
use crate::config::{VgicMode, MAX_VMS};
use crate::core::irq::IrqOwnership;
use crate::core::sync::SpinLock;
use crate::core::vmm::{VmId, INVALID_VM_ID};
use crate::emulator::{MmioAccess, VirtualDevice};
use crate::utils::byte_mask;
use crate::Result;

/// Name under which the vGIC is registered as a vdev
pub const VGIC_NAME: &str = "vgicv2";

/// Semantics of a distributor register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterGroup {
    /// Distributor control, shadowed
    Ctlr,
    /// Type register, shadowed, read-only
    Typer,
    /// Implementer id, shadowed, read-only
    Iidr,
    /// Group per interrupt
    Igroupr,
    /// Write 1 to enable
    Isenabler,
    /// Write 1 to disable
    Icenabler,
    /// Write 1 to set pending
    Ispendr,
    /// Write 1 to clear pending
    Icpendr,
    /// Write 1 to set active
    Isactiver,
    /// Write 1 to clear active
    Icactiver,
    /// Priority byte per interrupt
    Ipriorityr,
    /// Target byte per interrupt
    Itargetsr,
    /// Trigger configuration, two bits per interrupt
    Icfgr,
    /// Non-secure access control, two bits per interrupt
    Nsacr,
    /// Software generated interrupt trigger
    Sgir,
    /// SGI clear-pending bytes
    Cpendsgir,
    /// SGI set-pending bytes
    Spendsgir,
}

impl RegisterGroup {
    /// Write-1-to-set or write-1-to-clear register
    pub const fn is_w1(self) -> bool {
        matches!(
            self,
            Self::Isenabler
                | Self::Icenabler
                | Self::Ispendr
                | Self::Icpendr
                | Self::Isactiver
                | Self::Icactiver
        )
    }
}

/// One entry of the distributor register map
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterLayout {
    /// Register name
    pub name: &'static str,
    /// Access semantics
    pub group: RegisterGroup,
    /// First byte offset
    pub start: u64,
    /// One past the last byte offset
    pub end: u64,
    /// Bits per interrupt, 0 for registers not indexed by interrupt
    pub stride: u32,
}

const fn reg(name: &'static str, group: RegisterGroup, start: u64, end: u64, stride: u32) -> RegisterLayout {
    RegisterLayout {
        name,
        group,
        start,
        end,
        stride,
    }
}

/// GICv2 distributor register map
pub static REGISTER_LAYOUT: [RegisterLayout; 17] = [
    reg("CTLR", RegisterGroup::Ctlr, gicd::CTLR, 0x004, 0),
    reg("TYPER", RegisterGroup::Typer, gicd::TYPER, 0x008, 0),
    reg("IIDR", RegisterGroup::Iidr, gicd::IIDR, 0x00C, 0),
    reg("IGROUPR", RegisterGroup::Igroupr, gicd::IGROUPR, 0x100, 1),
    reg("ISENABLER", RegisterGroup::Isenabler, gicd::ISENABLER, 0x180, 1),
    reg("ICENABLER", RegisterGroup::Icenabler, gicd::ICENABLER, 0x200, 1),
    reg("ISPENDR", RegisterGroup::Ispendr, gicd::ISPENDR, 0x280, 1),
    reg("ICPENDR", RegisterGroup::Icpendr, gicd::ICPENDR, 0x300, 1),
    reg("ISACTIVER", RegisterGroup::Isactiver, gicd::ISACTIVER, 0x380, 1),
    reg("ICACTIVER", RegisterGroup::Icactiver, gicd::ICACTIVER, 0x400, 1),
    reg("IPRIORITYR", RegisterGroup::Ipriorityr, gicd::IPRIORITYR, 0x7FC, 8),
    reg("ITARGETSR", RegisterGroup::Itargetsr, gicd::ITARGETSR, 0xBFC, 8),
    reg("ICFGR", RegisterGroup::Icfgr, gicd::ICFGR, 0xD00, 2),
    reg("NSACR", RegisterGroup::Nsacr, gicd::NSACR, 0xF00, 2),
    reg("SGIR", RegisterGroup::Sgir, gicd::SGIR, 0xF04, 0),
    reg("CPENDSGIR", RegisterGroup::Cpendsgir, gicd::CPENDSGIR, 0xF20, 0),
    reg("SPENDSGIR", RegisterGroup::Spendsgir, gicd::SPENDSGIR, 0xF30, 0),
];

/// Find the register containing `offset`
pub fn classify(offset: u64) -> Option<&'static RegisterLayout> {
    REGISTER_LAYOUT
        .iter()
        .find(|layout| (layout.start..layout.end).contains(&offset))
}

/// Interrupts and bits touched by one access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqWindow {
    /// Word-aligned register offset
    pub aligned: u64,
    /// Interrupt id held in bit 0 of the aligned word
    pub base_irq: u32,
    /// Bit position of the access inside the word
    pub shift: u32,
    /// Bits of the word covered by the access
    pub mask: u32,
}

/// Decode the interrupt window of an access of `size` bytes at `offset`
pub fn decode_irq(layout: &RegisterLayout, offset: u64, size: u8) -> IrqWindow {
    let aligned = offset & !0x3;
    let base_irq = if layout.stride == 0 {
        0
    } else {
        ((aligned - layout.start) * 8 / layout.stride as u64) as u32
    };
    let shift = ((offset - aligned) * 8) as u32;
    IrqWindow {
        aligned,
        base_irq,
        shift,
        mask: (byte_mask(size as u32) as u32) << shift,
    }
}

/// Per-VM distributor state
#[derive(Debug)]
pub struct VgicDevice {
    vm: AtomicU16,
    gicd_base: AtomicU64,
    gicd_size: AtomicU64,
    ctlr: AtomicU32,
    typer: AtomicU32,
    iidr: AtomicU32,
}

impl Default for VgicDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl VgicDevice {
    /// Create an unassigned device
    pub const fn new() -> Self {
        Self {
            vm: AtomicU16::new(INVALID_VM_ID),
            gicd_base: AtomicU64::new(0),
            gicd_size: AtomicU64::new(0),
            ctlr: AtomicU32::new(0),
            typer: AtomicU32::new(0),
            iidr: AtomicU32::new(0),
        }
    }

    /// VM using this device
    pub fn vm(&self) -> Option<VmId> {
        match self.vm.load(Ordering::Acquire) {
            INVALID_VM_ID => None,
            vm => Some(vm),
        }
    }

    /// Guest physical base of the distributor frame
    pub fn gicd_base(&self) -> u64 {
        self.gicd_base.load(Ordering::Relaxed)
    }

    /// Size of the distributor frame
    pub fn gicd_size(&self) -> u64 {
        self.gicd_size.load(Ordering::Relaxed)
    }

    /// Shadowed GICD_CTLR
    pub fn ctlr(&self) -> u32 {
        self.ctlr.load(Ordering::Relaxed)
    }

    /// Shadowed GICD_TYPER
    pub fn typer(&self) -> u32 {
        self.typer.load(Ordering::Relaxed)
    }

    /// Shadowed GICD_IIDR
    pub fn iidr(&self) -> u32 {
        self.iidr.load(Ordering::Relaxed)
    }

    fn load_shadows(&self, gic: &GicDistributor) {
        self.ctlr.store(gic.ctlr(), Ordering::Relaxed);
        self.typer.store(gic.typer(), Ordering::Relaxed);
        self.iidr.store(gic.iidr(), Ordering::Relaxed);
    }

    fn assign(&self, vm: VmId, base: u64, size: u64, gic: &GicDistributor) {
        self.gicd_base.store(base, Ordering::Relaxed);
        self.gicd_size.store(size, Ordering::Relaxed);
        self.load_shadows(gic);
        self.vm.store(vm, Ordering::Release);
    }

    fn clear(&self) {
        self.vm.store(INVALID_VM_ID, Ordering::Release);
        self.gicd_base.store(0, Ordering::Relaxed);
        self.gicd_size.store(0, Ordering::Relaxed);
        self.ctlr.store(0, Ordering::Relaxed);
        self.typer.store(0, Ordering::Relaxed);
        self.iidr.store(0, Ordering::Relaxed);
    }
}

/// Fixed pool of per-VM vGIC devices
pub struct VgicPool {
    gic: Arc<GicDistributor>,
    ownership: Arc<IrqOwnership>,
    mode: VgicMode,
    in_use: SpinLock<[bool; MAX_VMS]>,
    devices: [VgicDevice; MAX_VMS],
}

impl core::fmt::Debug for VgicPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VgicPool")
            .field("mode", &self.mode)
            .field("in_use", &*self.in_use.lock())
            .finish()
    }
}

impl VgicPool {
    /// Create an empty pool in front of `gic`
    pub fn new(gic: Arc<GicDistributor>, ownership: Arc<IrqOwnership>, mode: VgicMode) -> Self {
        Self {
            gic,
            ownership,
            mode,
            in_use: SpinLock::new([false; MAX_VMS]),
            devices: core::array::from_fn(|_| VgicDevice::new()),
        }
    }

    /// Presentation mode
    pub fn mode(&self) -> VgicMode {
        self.mode
    }

    /// Take a free slot for `vm`, seeding its shadows from hardware
    pub fn request(&self, vm: VmId, gicd_base: u64, gicd_size: u64) -> Result<usize> {
        let mut in_use = self.in_use.lock();
        let slot = in_use
            .iter()
            .position(|used| !used)
            .ok_or(Error::PoolExhausted)?;
        in_use[slot] = true;
        self.devices[slot].assign(vm, gicd_base, gicd_size, &self.gic);
        log::debug!("vgic slot {} -> vm {}", slot, vm);
        Ok(slot)
    }

    /// Return a slot to the pool
    pub fn release(&self, slot: usize) -> Result<()> {
        let mut in_use = self.in_use.lock();
        match in_use.get_mut(slot) {
            Some(used) if *used => {
                *used = false;
                self.devices[slot].clear();
                log::debug!("vgic slot {} released", slot);
                Ok(())
            }
            _ => Err(Error::InvalidSlot(slot).into()),
        }
    }

    /// Device in an allocated slot
    pub fn device(&self, slot: usize) -> Result<&VgicDevice> {
        match self.in_use.lock().get(slot) {
            Some(true) => Ok(&self.devices[slot]),
            _ => Err(Error::InvalidSlot(slot).into()),
        }
    }

    /// Number of allocated slots
    pub fn used(&self) -> usize {
        self.in_use.lock().iter().filter(|used| **used).count()
    }

    fn check_access(offset: u64, size: u8) -> Result<()> {
        if !matches!(size, 1 | 2 | 4) {
            log::error!("vgic: unsupported {}-byte access at {:#x}", size, offset);
            return Err(Error::UnsupportedAccessSize(size).into());
        }
        if offset % size as u64 != 0 {
            log::error!("vgic: unaligned {}-byte access at {:#x}", size, offset);
            return Err(Error::UnalignedAccess(offset).into());
        }
        Ok(())
    }

    /// Bits of the word at `win` that belong to `current`
    fn owned_bits(&self, layout: &RegisterLayout, win: &IrqWindow, current: Option<VmId>) -> u32 {
        if self.mode == VgicMode::Passthrough {
            return u32::MAX;
        }
        let stride = layout.stride;
        if stride == 0 {
            return u32::MAX;
        }
        let count = 32 / stride;
        let owned = self.ownership.owned_mask(win.base_irq, count, current);
        if stride == 1 {
            return owned;
        }
        let field = (1u32 << stride) - 1;
        (0..count)
            .filter(|i| owned & (1 << i) != 0)
            .fold(0, |bits, i| bits | (field << (i * stride)))
    }

    /// Emulate a distributor load
    pub fn read(&self, slot: usize, access: &MmioAccess<'_>, offset: u64) -> Result<u64> {
        let dev = self.device(slot)?;
        let size = access.size;
        Self::check_access(offset, size)?;

        let layout = match classify(offset) {
            Some(layout) => layout,
            None => {
                log::debug!("vgic: read of unknown register {:#x}", offset);
                return self.gic.get_direct(offset, size);
            }
        };
        let win = decode_irq(layout, offset, size);
        let word = match layout.group {
            RegisterGroup::Ctlr => dev.ctlr(),
            RegisterGroup::Typer => dev.typer(),
            RegisterGroup::Iidr => dev.iidr(),
            RegisterGroup::Sgir => 0,
            _ => {
                let hw = self.gic.lock().read32(win.aligned);
                hw & self.owned_bits(layout, &win, access.current_vm)
            }
        };
        log::trace!(
            "vgic: {} read {} {:#x} -> {:#x}",
            access.vcpu,
            layout.name,
            offset,
            word
        );
        Ok(((word & win.mask) >> win.shift) as u64)
    }

    /// Emulate a distributor store
    pub fn write(&self, slot: usize, access: &MmioAccess<'_>, offset: u64, value: u64) -> Result<()> {
        let dev = self.device(slot)?;
        let size = access.size;
        Self::check_access(offset, size)?;

        let layout = match classify(offset) {
            Some(layout) => layout,
            None if self.mode == VgicMode::Passthrough => {
                return self.gic.set_direct(offset, value, size);
            }
            None => {
                log::warn!(
                    "vgic: {} write {:#x} to unknown register {:#x} dropped",
                    access.vcpu,
                    value,
                    offset
                );
                return Ok(());
            }
        };
        let win = decode_irq(layout, offset, size);
        let bits = ((value as u32) << win.shift) & win.mask;
        log::trace!(
            "vgic: {} write {} {:#x} <- {:#x}",
            access.vcpu,
            layout.name,
            offset,
            value
        );

        match layout.group {
            RegisterGroup::Ctlr => {
                let old = dev.ctlr();
                dev.ctlr.store((old & !win.mask) | bits, Ordering::Relaxed);
            }
            RegisterGroup::Typer | RegisterGroup::Iidr => {
                log::error!("vgic: {} write to read-only {}", access.vcpu, layout.name);
            }
            RegisterGroup::Sgir => {
                let sgir = bits & ((0x3 << 24) | (0xff << 16) | 0xf);
                self.gic.send_sgi_raw(sgir);
            }
            RegisterGroup::Cpendsgir | RegisterGroup::Spendsgir => {
                self.gic.set_direct(offset, value, size)?;
            }
            RegisterGroup::Itargetsr if self.mode == VgicMode::Passthrough => {
                self.gic.set_direct(offset, value, size)?;
            }
            RegisterGroup::Itargetsr if win.base_irq < 32 => {
                log::warn!(
                    "vgic: {} write to read-only ITARGETSR {:#x} ignored",
                    access.vcpu,
                    offset
                );
            }
            group => {
                let allowed = win.mask & self.owned_bits(layout, &win, access.current_vm);
                let gic = self.gic.lock();
                if group.is_w1() {
                    if bits & allowed != 0 {
                        gic.write32(win.aligned, bits & allowed);
                    }
                } else {
                    let hw = gic.read32(win.aligned);
                    gic.write32(win.aligned, (hw & !allowed) | (bits & allowed));
                }
            }
        }
        Ok(())
    }
}

/// vGIC slot exposed to a VM as a virtual device
pub struct VgicVdev {
    pool: Arc<VgicPool>,
    slot: usize,
}

impl VgicVdev {
    /// Wrap an allocated pool slot
    pub fn new(pool: Arc<VgicPool>, slot: usize) -> Self {
        Self { pool, slot }
    }

    /// Pool slot
    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl VirtualDevice for VgicVdev {
    fn name(&self) -> &str {
        VGIC_NAME
    }

    fn read(&self, access: &MmioAccess<'_>, offset: u64) -> Result<u64> {
        self.pool.read(self.slot, access, offset)
    }

    fn write(&self, access: &MmioAccess<'_>, offset: u64, value: u64) -> Result<()> {
        self.pool.write(self.slot, access, offset, value)
    }

    fn reset(&self) {
        if let Ok(dev) = self.pool.device(self.slot) {
            dev.load_shadows(&self.pool.gic);
        }
    }

    fn deinit(&self) {
        if let Err(err) = self.pool.release(self.slot) {
            log::error!("vgic: releasing slot {}: {}", self.slot, err);
        }
    }
}
