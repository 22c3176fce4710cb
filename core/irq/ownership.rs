//! SPI allocation and ownership
//!
//! [`SpiTable`] is the plain allocation bitmap a VM's configuration builds
//! up: one bit per interrupt id, only SPIs may be set. [`IrqOwnership`] is
//! the hypervisor-wide map from physical interrupt line to owning VM that
//! the vGIC consults on every filtered register access.

use crate::config::SPI_TABLE_SIZE;
use crate::core::sync::SpinLock;
use crate::core::vmm::VmId;
use crate::core::Error;
use crate::utils::Bitmap;
use crate::Result;

/// First id accepted by the SPI table
pub const SPI_MIN_ID: u32 = 16;

/// One past the last id accepted by the SPI table
pub const SPI_MAX_ID: u32 = SPI_TABLE_SIZE as u32;

const SPI_WORDS: usize = SPI_TABLE_SIZE / 32;

/// Interrupt lines requested by one VM
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpiTable {
    bits: Bitmap<SPI_WORDS>,
}

#[inline]
fn is_spi(id: u32) -> bool {
    (SPI_MIN_ID..SPI_MAX_ID).contains(&id)
}

impl SpiTable {
    /// Create an empty table
    pub const fn new() -> Self {
        Self { bits: Bitmap::new() }
    }

    /// Clear every allocation
    pub fn init(&mut self) {
        self.bits.clear_all();
    }

    /// Whether `id` is allocated
    pub fn is_allocated(&self, id: u32) -> bool {
        self.bits.test(id as usize)
    }

    /// Allocate `id`, which must be an SPI not yet allocated
    pub fn allocate(&mut self, id: u32) -> Result<()> {
        if !is_spi(id) {
            return Err(Error::InvalidSpi(id).into());
        }
        if self.bits.test(id as usize) {
            return Err(Error::AlreadyAllocated(id).into());
        }
        self.bits.set_bit(id as usize);
        Ok(())
    }

    /// Union `src` into `dst`
    ///
    /// Fails with the first id set in both tables, leaving `dst` untouched.
    pub fn merge(src: &SpiTable, dst: &mut SpiTable) -> Result<()> {
        if let Some(id) = src.bits.first_common(&dst.bits) {
            log::error!("spi {} requested twice", id);
            return Err(Error::Conflict(id as u32).into());
        }
        dst.bits.union_with(&src.bits);
        Ok(())
    }

    /// Allocated ids in ascending order
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.bits.iter_set().map(|id| id as u32)
    }

    /// Number of allocated ids
    pub fn count(&self) -> usize {
        self.bits.count_ones()
    }
}

/// Owner of every physical interrupt line
pub struct IrqOwnership {
    owners: SpinLock<[Option<VmId>; SPI_TABLE_SIZE]>,
}

impl Default for IrqOwnership {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqOwnership {
    /// Create a map with every line unassigned
    pub const fn new() -> Self {
        Self {
            owners: SpinLock::new([None; SPI_TABLE_SIZE]),
        }
    }

    /// Unassign every line
    pub fn init(&self) {
        *self.owners.lock() = [None; SPI_TABLE_SIZE];
        log::debug!("spi ownership map cleared");
    }

    /// Record `vmid` as owner of `hwirq` if the line is unassigned
    ///
    /// Soft-fails: a line that already has an owner or an id outside
    /// `[16, 1024)` is logged and left alone. Returns whether the owner was
    /// recorded.
    pub fn vm_hwirq_add(&self, hwirq: u32, vmid: VmId) -> bool {
        if !is_spi(hwirq) {
            log::warn!("hwirq {} out of range for vm {}", hwirq, vmid);
            return false;
        }
        let mut owners = self.owners.lock();
        match owners[hwirq as usize] {
            None => {
                owners[hwirq as usize] = Some(vmid);
                log::debug!("hwirq {} -> vm {}", hwirq, vmid);
                true
            }
            Some(owner) => {
                log::warn!(
                    "hwirq {} already owned by vm {}, ignoring vm {}",
                    hwirq,
                    owner,
                    vmid
                );
                false
            }
        }
    }

    /// Release `hwirq`; only SPIs can be released
    pub fn vm_hwirq_remove(&self, hwirq: u32) -> bool {
        if !is_spi(hwirq) {
            log::warn!("hwirq {} cannot be released", hwirq);
            return false;
        }
        self.owners.lock()[hwirq as usize].take().is_some()
    }

    /// Owner of a line
    pub fn owner(&self, hwirq: u32) -> Option<VmId> {
        self.owners.lock().get(hwirq as usize).copied().flatten()
    }

    /// Whether `hwirq` is visible to the VM `current`
    ///
    /// SGIs and PPIs (ids below 16) always belong to whoever is running.
    pub fn belongs_to(&self, hwirq: u32, current: Option<VmId>) -> bool {
        if hwirq < SPI_MIN_ID {
            return true;
        }
        match current {
            Some(vm) => self.owner(hwirq) == Some(vm),
            None => false,
        }
    }

    /// Ownership bits of 32 consecutive ids starting at `first` for `current`
    ///
    /// Bit `i` is set iff `first + i` belongs to `current`. Takes the lock
    /// once for the whole word.
    pub fn owned_mask(&self, first: u32, count: u32, current: Option<VmId>) -> u32 {
        let owners = self.owners.lock();
        (0..count.min(32)).fold(0u32, |mask, i| {
            let id = first + i;
            let owned = if id < SPI_MIN_ID {
                true
            } else {
                match (current, owners.get(id as usize).copied().flatten()) {
                    (Some(vm), Some(owner)) => vm == owner,
                    _ => false,
                }
            };
            if owned {
                mask | (1 << i)
            } else {
                mask
            }
        })
    }

    /// Route every line of a VM's table to that VM
    ///
    /// Returns the number of lines recorded.
    pub fn claim(&self, table: &SpiTable, vmid: VmId) -> usize {
        table.iter().filter(|&id| self.vm_hwirq_add(id, vmid)).count()
    }

    /// Unassign every line owned by `vmid`
    pub fn release_vm(&self, vmid: VmId) -> usize {
        let mut owners = self.owners.lock();
        let mut released = 0;
        for owner in owners.iter_mut().filter(|o| **o == Some(vmid)) {
            *owner = None;
            released += 1;
        }
        log::debug!("released {} lines of vm {}", released, vmid);
        released
    }

    /// Hand every unassigned SPI below `nr_lines` to `primary`
    pub fn assign_unclaimed(&self, primary: VmId, nr_lines: u32) -> usize {
        let mut owners = self.owners.lock();
        let end = nr_lines.min(SPI_MAX_ID) as usize;
        let mut assigned = 0;
        for owner in owners[SPI_MIN_ID as usize..end].iter_mut().filter(|o| o.is_none()) {
            *owner = Some(primary);
            assigned += 1;
        }
        log::info!("{} unclaimed lines routed to primary vm {}", assigned, primary);
        assigned
    }
}
