//! Virtual CPU (VCPU) state and locking
//!
//! Every field of a vCPU lives behind its own spin lock. The only way to
//! reach that state is through a [`VcpuLocked`] guard, so each function
//! touching vCPU state names the lock in its signature. Two vCPUs are
//! locked together only through [`Vcpu::lock_both`], which acquires them
//! in `(vm, index)` order.
//!
//! ## States
//!
//! ```text
//!  OFF --on--> WAITING --run--> RUNNING --exit--> WAITING
//!                                               | BLOCKED
//!                                               | BLOCKED_INTERRUPT
//!                                               | PREEMPTED
//!                                               | OFF
//!                                               | ABORTED (terminal)
//! ```
//!
//! Apart from the boot-time `on` transition, the state only changes while
//! the scheduler processes the return of a run (see [`crate::core::sched`]).

use crate::arch::arm64::cpu::ArchRegs;
use crate::config::NUM_INTIDS;
use crate::core::irq::{IntId, InterruptType};
use crate::core::sync::{SpinLock, SpinLockGuard};
use crate::core::vmm::{VcpuHandle, VcpuId, VmId};
use crate::core::Error;
use crate::utils::Bitmap;
use crate::Result;

/// General-purpose register receiving the physical core index at boot
pub const PHYS_CORE_IDX_GPR: u8 = 4;

const INTID_WORDS: usize = NUM_INTIDS / 32;

/// vCPU run state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuState {
    /// Powered off, not runnable
    Off,
    /// Idle, waiting for a message or interrupt
    Waiting,
    /// Executing on a physical CPU
    Running,
    /// Yielded or blocked on another partition
    Blocked,
    /// Blocked until a virtual interrupt is pending (WFI)
    BlockedInterrupt,
    /// Interrupted before finishing its work
    Preempted,
    /// Faulted; never runs again
    Aborted,
}

/// Virtual interrupt bitfields and their counters
#[derive(Debug, Clone, Default)]
struct Interrupts {
    enabled: Bitmap<INTID_WORDS>,
    pending: Bitmap<INTID_WORDS>,
    /// Set bit: delivered as FIQ
    fiq: Bitmap<INTID_WORDS>,
    enabled_and_pending_irq_count: u32,
    enabled_and_pending_fiq_count: u32,
}

impl Interrupts {
    fn counted(&self, intid: IntId) -> Option<InterruptType> {
        let i = intid as usize;
        if self.enabled.test(i) && self.pending.test(i) {
            Some(if self.fiq.test(i) {
                InterruptType::Fiq
            } else {
                InterruptType::Irq
            })
        } else {
            None
        }
    }

    fn increment(&mut self, kind: InterruptType) {
        match kind {
            InterruptType::Irq => self.enabled_and_pending_irq_count += 1,
            InterruptType::Fiq => self.enabled_and_pending_fiq_count += 1,
        }
    }

    fn decrement(&mut self, kind: InterruptType) {
        let count = match kind {
            InterruptType::Irq => &mut self.enabled_and_pending_irq_count,
            InterruptType::Fiq => &mut self.enabled_and_pending_fiq_count,
        };
        assert!(*count > 0, "{:?} counter underflow", kind);
        *count -= 1;
    }

    /// Apply `change` to the bitfields of `intid` and move the counters in
    /// step with the enabled-and-pending transition it causes.
    fn update(&mut self, intid: IntId, change: impl FnOnce(&mut Self, usize)) {
        let before = self.counted(intid);
        change(self, intid as usize);
        let after = self.counted(intid);
        if before != after {
            if let Some(kind) = before {
                self.decrement(kind);
            }
            if let Some(kind) = after {
                self.increment(kind);
            }
        }
        assert!(self.is_consistent(), "interrupt counters out of sync");
    }

    fn is_consistent(&self) -> bool {
        let both = self.enabled.and(&self.pending);
        let fiqs = both.and(&self.fiq).count_ones() as u32;
        let total = both.count_ones() as u32;
        self.enabled_and_pending_fiq_count == fiqs
            && self.enabled_and_pending_irq_count == total - fiqs
    }
}

/// State protected by the vCPU lock
#[derive(Debug)]
struct VcpuInner {
    state: VcpuState,
    is_bootstrapped: bool,
    cpu: Option<usize>,
    regs: ArchRegs,
    regs_available: bool,
    interrupts: Interrupts,
    direct_request_origin_vm_id: Option<VmId>,
    processing_secure_interrupt: bool,
    secure_interrupt_deactivated: bool,
    current_sec_interrupt_id: Option<IntId>,
    preempted_vcpu: Option<VcpuHandle>,
    priority_mask: u8,
    implicit_completion_signal: bool,
}

impl VcpuInner {
    fn new() -> Self {
        Self {
            state: VcpuState::Off,
            is_bootstrapped: false,
            cpu: None,
            regs: ArchRegs::new(),
            regs_available: true,
            interrupts: Interrupts::default(),
            direct_request_origin_vm_id: None,
            processing_secure_interrupt: false,
            secure_interrupt_deactivated: false,
            current_sec_interrupt_id: None,
            preempted_vcpu: None,
            priority_mask: 0xff,
            implicit_completion_signal: false,
        }
    }

    fn clear_secure_interrupt(&mut self) -> Option<VcpuHandle> {
        self.processing_secure_interrupt = false;
        self.secure_interrupt_deactivated = false;
        self.current_sec_interrupt_id = None;
        self.preempted_vcpu.take()
    }
}

/// Virtual CPU
pub struct Vcpu {
    handle: VcpuHandle,
    inner: SpinLock<VcpuInner>,
}

impl core::fmt::Debug for Vcpu {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Vcpu").field("handle", &self.handle).finish()
    }
}

impl Vcpu {
    /// Create a powered-off vCPU
    pub fn new(vm: VmId, index: VcpuId) -> Self {
        Self {
            handle: VcpuHandle::new(vm, index),
            inner: SpinLock::new(VcpuInner::new()),
        }
    }

    /// Identity of this vCPU
    pub fn handle(&self) -> VcpuHandle {
        self.handle
    }

    /// Owning VM
    pub fn vm_id(&self) -> VmId {
        self.handle.vm
    }

    /// Index within the VM
    pub fn index(&self) -> VcpuId {
        self.handle.index
    }

    /// Lock this vCPU
    pub fn lock(&self) -> VcpuLocked<'_> {
        VcpuLocked {
            vcpu: self,
            inner: self.inner.lock(),
        }
    }

    /// Lock two distinct vCPUs
    ///
    /// The locks are always taken lowest `(vm, index)` first, so callers
    /// on different cores may pass the pair in either order. The guards
    /// are returned in argument order.
    ///
    /// # Panics
    /// If `a` and `b` are the same vCPU.
    pub fn lock_both<'a>(a: &'a Vcpu, b: &'a Vcpu) -> TwoVcpuLocked<'a> {
        assert!(a.handle != b.handle, "lock_both on the same vcpu {}", a.handle);
        if a.handle < b.handle {
            let vcpu1 = a.lock();
            let vcpu2 = b.lock();
            TwoVcpuLocked { vcpu1, vcpu2 }
        } else {
            let vcpu2 = b.lock();
            let vcpu1 = a.lock();
            TwoVcpuLocked { vcpu1, vcpu2 }
        }
    }
}

/// Proof that a vCPU lock is held
pub struct VcpuLocked<'a> {
    vcpu: &'a Vcpu,
    inner: SpinLockGuard<'a, VcpuInner>,
}

/// Two vCPU locks taken together, in argument order
pub struct TwoVcpuLocked<'a> {
    /// First argument of [`Vcpu::lock_both`]
    pub vcpu1: VcpuLocked<'a>,
    /// Second argument of [`Vcpu::lock_both`]
    pub vcpu2: VcpuLocked<'a>,
}

impl<'a> VcpuLocked<'a> {
    /// The locked vCPU
    pub fn vcpu(&self) -> &'a Vcpu {
        self.vcpu
    }

    /// Identity of the locked vCPU
    pub fn handle(&self) -> VcpuHandle {
        self.vcpu.handle
    }

    /// Current run state
    pub fn state(&self) -> VcpuState {
        self.inner.state
    }

    /// Change the run state; reserved to the run loop and boot
    pub(crate) fn set_state(&mut self, state: VcpuState) {
        let old = self.inner.state;
        assert!(
            old != VcpuState::Aborted || state == VcpuState::Aborted,
            "{} leaving aborted state",
            self.vcpu.handle
        );
        if old != state {
            log::trace!("{}: {:?} -> {:?}", self.vcpu.handle, old, state);
        }
        self.inner.state = state;
    }

    /// Whether the vCPU is powered off
    pub fn is_off(&self) -> bool {
        self.inner.state == VcpuState::Off
    }

    /// Whether the vCPU has been started at least once
    pub fn is_bootstrapped(&self) -> bool {
        self.inner.is_bootstrapped
    }

    /// Physical CPU the vCPU is bound to
    pub fn cpu(&self) -> Option<usize> {
        self.inner.cpu
    }

    /// Bind to a physical CPU
    pub fn bind_cpu(&mut self, cpu: usize) {
        self.inner.cpu = Some(cpu);
    }

    /// Whether the register file is saved (not live on a CPU)
    pub fn regs_available(&self) -> bool {
        self.inner.regs_available
    }

    /// Saved registers
    pub fn regs(&self) -> Result<&ArchRegs> {
        if !self.inner.regs_available {
            return Err(Error::RegsUnavailable.into());
        }
        Ok(&self.inner.regs)
    }

    /// Saved registers, mutable
    pub fn regs_mut(&mut self) -> Result<&mut ArchRegs> {
        if !self.inner.regs_available {
            return Err(Error::RegsUnavailable.into());
        }
        Ok(&mut self.inner.regs)
    }

    /// Hand the register file to a physical CPU
    pub(crate) fn take_regs_for_run(&mut self) -> Result<ArchRegs> {
        let regs = self.regs()?.clone();
        self.inner.regs_available = false;
        Ok(regs)
    }

    /// Store the register file back after a run
    pub(crate) fn return_regs(&mut self, regs: ArchRegs) {
        assert!(
            !self.inner.regs_available,
            "{} registers returned twice",
            self.vcpu.handle
        );
        self.inner.regs = regs;
        self.inner.regs_available = true;
    }

    /// Start the vCPU at `entry` with `arg` in x0
    pub fn on(&mut self, entry: u64, arg: u64) -> Result<()> {
        let regs = self.regs_mut()?;
        regs.pc = entry;
        regs.set_gpr(0, arg);
        self.inner.is_bootstrapped = true;
        self.set_state(VcpuState::Waiting);
        log::debug!("{} on at {:#x}", self.vcpu.handle, entry);
        Ok(())
    }

    /// Reset and start the vCPU if it is off
    ///
    /// Returns whether the vCPU was started.
    pub fn secondary_reset_and_start(&mut self, entry: u64, arg: u64) -> Result<bool> {
        if !self.is_off() {
            return Ok(false);
        }
        self.regs_mut()?.reset(entry, arg);
        self.on(entry, arg)?;
        Ok(true)
    }

    /// Give the vCPU a clean register file, keeping its entry point
    pub fn reset(&mut self) -> Result<()> {
        let regs = self.regs_mut()?;
        let (entry, arg) = (regs.pc, regs.gpr(0));
        regs.reset(entry, arg);
        self.inner.clear_secure_interrupt();
        self.inner.implicit_completion_signal = false;
        self.inner.direct_request_origin_vm_id = None;
        Ok(())
    }

    /// Put the bound physical core index in its boot register
    pub fn set_phys_core_idx(&mut self) -> Result<()> {
        let cpu = self.inner.cpu.ok_or(Error::InvalidCpu(usize::MAX))?;
        self.regs_mut()?.set_gpr(PHYS_CORE_IDX_GPR, cpu as u64);
        Ok(())
    }

    fn check_intid(intid: IntId) -> Result<()> {
        if intid as usize >= NUM_INTIDS {
            return Err(Error::InvalidIntId(intid).into());
        }
        Ok(())
    }

    /// Enable a virtual interrupt with the given delivery type
    pub fn enable_interrupt(&mut self, intid: IntId, kind: InterruptType) -> Result<()> {
        Self::check_intid(intid)?;
        self.inner.interrupts.update(intid, |irqs, i| {
            irqs.fiq.set(i, kind == InterruptType::Fiq);
            irqs.enabled.set_bit(i);
        });
        Ok(())
    }

    /// Disable a virtual interrupt
    pub fn disable_interrupt(&mut self, intid: IntId) -> Result<()> {
        Self::check_intid(intid)?;
        self.inner.interrupts.update(intid, |irqs, i| {
            irqs.enabled.clear_bit(i);
        });
        Ok(())
    }

    /// Mark a virtual interrupt pending
    pub fn set_pending(&mut self, intid: IntId) -> Result<()> {
        Self::check_intid(intid)?;
        self.inner.interrupts.update(intid, |irqs, i| {
            irqs.pending.set_bit(i);
        });
        Ok(())
    }

    /// Clear a pending virtual interrupt
    pub fn clear_pending(&mut self, intid: IntId) -> Result<()> {
        Self::check_intid(intid)?;
        self.inner.interrupts.update(intid, |irqs, i| {
            irqs.pending.clear_bit(i);
        });
        Ok(())
    }

    /// Change the delivery type of a virtual interrupt
    pub fn set_interrupt_type(&mut self, intid: IntId, kind: InterruptType) -> Result<()> {
        Self::check_intid(intid)?;
        self.inner.interrupts.update(intid, |irqs, i| {
            irqs.fiq.set(i, kind == InterruptType::Fiq);
        });
        Ok(())
    }

    /// Whether a virtual interrupt is enabled
    pub fn is_enabled(&self, intid: IntId) -> bool {
        self.inner.interrupts.enabled.test(intid as usize)
    }

    /// Whether a virtual interrupt is pending
    pub fn is_pending(&self, intid: IntId) -> bool {
        self.inner.interrupts.pending.test(intid as usize)
    }

    /// Delivery type of a virtual interrupt
    pub fn interrupt_type(&self, intid: IntId) -> InterruptType {
        if self.inner.interrupts.fiq.test(intid as usize) {
            InterruptType::Fiq
        } else {
            InterruptType::Irq
        }
    }

    /// Acknowledge the lowest enabled and pending interrupt
    pub fn next_pending_enabled(&mut self) -> Option<IntId> {
        let irqs = &self.inner.interrupts;
        let intid = irqs.enabled.first_common(&irqs.pending)? as IntId;
        self.inner.interrupts.update(intid, |irqs, i| {
            irqs.pending.clear_bit(i);
        });
        Some(intid)
    }

    /// Enabled and pending IRQs
    pub fn irq_count(&self) -> u32 {
        self.inner.interrupts.enabled_and_pending_irq_count
    }

    /// Enabled and pending FIQs
    pub fn fiq_count(&self) -> u32 {
        self.inner.interrupts.enabled_and_pending_fiq_count
    }

    /// Enabled and pending interrupts of either type
    pub fn pending_enabled_count(&self) -> u32 {
        self.irq_count() + self.fiq_count()
    }

    /// Panic if the counters disagree with the bitfields
    pub fn assert_interrupt_counters(&self) {
        assert!(
            self.inner.interrupts.is_consistent(),
            "{} interrupt counters out of sync",
            self.vcpu.handle
        );
    }

    /// VM that sent the direct request being served
    pub fn direct_request_origin(&self) -> Option<VmId> {
        self.inner.direct_request_origin_vm_id
    }

    /// Record or clear the origin of a direct request
    pub fn set_direct_request_origin(&mut self, origin: Option<VmId>) {
        self.inner.direct_request_origin_vm_id = origin;
    }

    /// Priority mask in effect while handling a secure interrupt
    pub fn priority_mask(&self) -> u8 {
        self.inner.priority_mask
    }

    /// Update the priority mask
    pub fn set_priority_mask(&mut self, mask: u8) {
        self.inner.priority_mask = mask;
    }

    /// Whether a secure interrupt is being handled
    pub fn processing_secure_interrupt(&self) -> bool {
        self.inner.processing_secure_interrupt
    }

    /// Secure interrupt being handled
    pub fn current_sec_interrupt_id(&self) -> Option<IntId> {
        self.inner.current_sec_interrupt_id
    }

    /// vCPU to resume once the secure interrupt completes
    pub fn preempted_vcpu(&self) -> Option<VcpuHandle> {
        self.inner.preempted_vcpu
    }

    /// Whether the handler deactivated the secure interrupt
    pub fn secure_interrupt_deactivated(&self) -> bool {
        self.inner.secure_interrupt_deactivated
    }

    /// Whether completion is expected from a priority drop
    pub fn implicit_completion_signal(&self) -> bool {
        self.inner.implicit_completion_signal
    }

    /// Start handling secure interrupt `intid`
    ///
    /// `preempted` is the vCPU that was running when the interrupt fired,
    /// `implicit` selects completion by priority drop instead of an
    /// explicit ABI call.
    pub fn enter_secure_interrupt(
        &mut self,
        intid: IntId,
        preempted: Option<VcpuHandle>,
        implicit: bool,
    ) -> Result<()> {
        if self.inner.processing_secure_interrupt {
            log::warn!(
                "{} already handling secure interrupt {:?}",
                self.vcpu.handle,
                self.inner.current_sec_interrupt_id
            );
            return Err(crate::Error::ResourceBusy);
        }
        self.set_pending(intid)?;
        self.inner.processing_secure_interrupt = true;
        self.inner.secure_interrupt_deactivated = false;
        self.inner.current_sec_interrupt_id = Some(intid);
        self.inner.preempted_vcpu = preempted;
        self.inner.implicit_completion_signal = implicit;
        Ok(())
    }

    /// Record deactivation of the secure interrupt being handled
    pub fn mark_secure_interrupt_deactivated(&mut self, intid: IntId) -> bool {
        if self.inner.current_sec_interrupt_id != Some(intid) {
            log::warn!(
                "{} deactivated {} while handling {:?}",
                self.vcpu.handle,
                intid,
                self.inner.current_sec_interrupt_id
            );
            return false;
        }
        self.inner.secure_interrupt_deactivated = true;
        true
    }

    /// Explicit completion, returns the vCPU to resume
    pub fn complete_secure_interrupt(&mut self) -> Option<VcpuHandle> {
        if !self.inner.processing_secure_interrupt {
            return None;
        }
        if !self.inner.secure_interrupt_deactivated {
            log::warn!(
                "{} completed secure interrupt {:?} without deactivating it",
                self.vcpu.handle,
                self.inner.current_sec_interrupt_id
            );
        }
        self.inner.implicit_completion_signal = false;
        self.inner.clear_secure_interrupt()
    }

    /// Implicit completion by priority drop, returns the vCPU to resume
    ///
    /// Only honoured when implicit completion was requested at entry.
    pub fn complete_secure_interrupt_implicit(&mut self) -> Option<VcpuHandle> {
        if !self.inner.processing_secure_interrupt || !self.inner.implicit_completion_signal {
            return None;
        }
        self.inner.implicit_completion_signal = false;
        self.inner.clear_secure_interrupt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use test_case::test_case;

    #[test]
    fn test_new_vcpu_is_off() {
        let vcpu = Vcpu::new(1, 0);
        let locked = vcpu.lock();
        assert!(locked.is_off());
        assert!(locked.regs_available());
        assert!(!locked.is_bootstrapped());
        assert_eq!(locked.handle(), VcpuHandle::new(1, 0));
    }

    #[test]
    fn test_on_and_secondary_start() {
        let vcpu = Vcpu::new(1, 1);
        let mut locked = vcpu.lock();
        assert!(locked.secondary_reset_and_start(0x8000, 7).unwrap());
        assert_eq!(locked.state(), VcpuState::Waiting);
        assert_eq!(locked.regs().unwrap().pc, 0x8000);
        assert_eq!(locked.regs().unwrap().gpr(0), 7);
        assert!(locked.is_bootstrapped());
        // already on
        assert!(!locked.secondary_reset_and_start(0x9000, 0).unwrap());
        assert_eq!(locked.regs().unwrap().pc, 0x8000);
    }

    #[test]
    fn test_regs_unavailable_while_running() {
        let vcpu = Vcpu::new(1, 0);
        let mut locked = vcpu.lock();
        let regs = locked.take_regs_for_run().unwrap();
        assert!(!locked.regs_available());
        assert_eq!(locked.regs().unwrap_err(), Error::RegsUnavailable.into());
        assert!(locked.on(0, 0).is_err());
        assert!(locked.reset().is_err());
        locked.return_regs(regs);
        assert!(locked.regs().is_ok());
    }

    #[test]
    fn test_reset_keeps_entry() {
        let vcpu = Vcpu::new(2, 0);
        let mut locked = vcpu.lock();
        locked.on(0x4000, 3).unwrap();
        locked.regs_mut().unwrap().x[9] = 99;
        locked.bind_cpu(2);
        locked.reset().unwrap();
        locked.set_phys_core_idx().unwrap();
        let regs = locked.regs().unwrap();
        assert_eq!(regs.pc, 0x4000);
        assert_eq!(regs.gpr(0), 3);
        assert_eq!(regs.gpr(9), 0);
        assert_eq!(regs.gpr(PHYS_CORE_IDX_GPR), 2);
    }

    #[test]
    fn test_set_phys_core_idx_requires_binding() {
        let vcpu = Vcpu::new(2, 0);
        assert!(vcpu.lock().set_phys_core_idx().is_err());
    }

    #[test]
    fn test_counters_follow_bitfields() {
        let vcpu = Vcpu::new(1, 0);
        let mut v = vcpu.lock();
        v.set_pending(40).unwrap();
        assert_eq!(v.pending_enabled_count(), 0);
        v.enable_interrupt(40, InterruptType::Irq).unwrap();
        assert_eq!(v.irq_count(), 1);
        // enabling twice does not count twice
        v.enable_interrupt(40, InterruptType::Irq).unwrap();
        assert_eq!(v.irq_count(), 1);
        v.set_interrupt_type(40, InterruptType::Fiq).unwrap();
        assert_eq!((v.irq_count(), v.fiq_count()), (0, 1));
        v.enable_interrupt(3, InterruptType::Irq).unwrap();
        v.set_pending(3).unwrap();
        assert_eq!((v.irq_count(), v.fiq_count()), (1, 1));
        assert_eq!(v.next_pending_enabled(), Some(3));
        assert_eq!(v.next_pending_enabled(), Some(40));
        assert_eq!(v.next_pending_enabled(), None);
        assert_eq!(v.pending_enabled_count(), 0);
        v.assert_interrupt_counters();
    }

    #[test]
    fn test_counter_invariant_random_sequence() {
        let vcpu = Vcpu::new(1, 0);
        let mut v = vcpu.lock();
        let mut seed: u32 = 0x1234_5678;
        for _ in 0..5000 {
            seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            let intid = (seed >> 8) % 48;
            let kind = if seed & 0x10 != 0 {
                InterruptType::Fiq
            } else {
                InterruptType::Irq
            };
            match seed % 6 {
                0 => v.enable_interrupt(intid, kind).unwrap(),
                1 => v.disable_interrupt(intid).unwrap(),
                2 => v.set_pending(intid).unwrap(),
                3 => v.clear_pending(intid).unwrap(),
                4 => v.set_interrupt_type(intid, kind).unwrap(),
                _ => {
                    v.next_pending_enabled();
                }
            }
            let expected = (0..48).filter(|&i| v.is_enabled(i) && v.is_pending(i)).count() as u32;
            assert_eq!(v.irq_count() + v.fiq_count(), expected);
            v.assert_interrupt_counters();
        }
    }

    #[test_case(NUM_INTIDS as u32)]
    #[test_case(u32::MAX)]
    fn test_rejects_out_of_range_intid(intid: IntId) {
        let vcpu = Vcpu::new(1, 0);
        let mut v = vcpu.lock();
        assert!(v.set_pending(intid).is_err());
        assert!(v.enable_interrupt(intid, InterruptType::Irq).is_err());
    }

    #[test]
    fn test_lock_both_returns_argument_order() {
        let a = Vcpu::new(2, 0);
        let b = Vcpu::new(1, 3);
        let both = Vcpu::lock_both(&a, &b);
        assert_eq!(both.vcpu1.handle(), a.handle());
        assert_eq!(both.vcpu2.handle(), b.handle());
    }

    #[test]
    #[should_panic(expected = "same vcpu")]
    fn test_lock_both_same_vcpu_panics() {
        let a = Vcpu::new(1, 0);
        let _both = Vcpu::lock_both(&a, &a);
    }

    #[test]
    fn test_lock_both_no_deadlock() {
        let vcpus = Arc::new([Vcpu::new(1, 0), Vcpu::new(1, 1), Vcpu::new(2, 0)]);
        let barrier = Arc::new(Barrier::new(3));
        let handles: std::vec::Vec<_> = (0..3u32)
            .map(|t| {
                let vcpus = vcpus.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let mut seed = 0x9e37_79b9u32.wrapping_mul(t + 1);
                    barrier.wait();
                    for _ in 0..20_000 {
                        seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                        let i = (seed >> 4) as usize % 3;
                        let j = (i + 1 + (seed >> 12) as usize % 2) % 3;
                        let mut both = Vcpu::lock_both(&vcpus[i], &vcpus[j]);
                        both.vcpu1.set_priority_mask(t as u8);
                        both.vcpu2.set_priority_mask(t as u8);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_secure_interrupt_explicit_completion() {
        let vcpu = Vcpu::new(3, 0);
        let mut v = vcpu.lock();
        let victim = VcpuHandle::new(1, 0);
        v.enter_secure_interrupt(45, Some(victim), false).unwrap();
        assert!(v.processing_secure_interrupt());
        assert_eq!(v.current_sec_interrupt_id(), Some(45));
        assert!(v.is_pending(45));
        assert!(v.enter_secure_interrupt(46, None, false).is_err());
        // implicit completion was not requested
        assert_eq!(v.complete_secure_interrupt_implicit(), None);
        assert!(!v.mark_secure_interrupt_deactivated(46));
        assert!(v.mark_secure_interrupt_deactivated(45));
        assert_eq!(v.complete_secure_interrupt(), Some(victim));
        assert!(!v.processing_secure_interrupt());
        assert_eq!(v.preempted_vcpu(), None);
    }

    #[test]
    fn test_secure_interrupt_implicit_completion() {
        let vcpu = Vcpu::new(3, 0);
        let mut v = vcpu.lock();
        v.enter_secure_interrupt(50, Some(VcpuHandle::new(1, 1)), true).unwrap();
        assert!(v.implicit_completion_signal());
        assert_eq!(v.complete_secure_interrupt_implicit(), Some(VcpuHandle::new(1, 1)));
        assert!(!v.implicit_completion_signal());
        assert_eq!(v.complete_secure_interrupt(), None);
    }

    #[test]
    fn test_direct_request_origin() {
        let vcpu = Vcpu::new(3, 0);
        let mut v = vcpu.lock();
        assert_eq!(v.direct_request_origin(), None);
        v.set_direct_request_origin(Some(1));
        assert_eq!(v.direct_request_origin(), Some(1));
    }

    #[test]
    #[should_panic(expected = "interrupt counters out of sync")]
    fn test_counter_desync_panics() {
        let mut irqs = Interrupts::default();
        irqs.enabled_and_pending_irq_count = 1;
        irqs.update(40, |irqs, i| {
            irqs.enabled.set_bit(i);
        });
    }

    #[test]
    #[should_panic(expected = "leaving aborted state")]
    fn test_aborted_is_terminal() {
        let vcpu = Vcpu::new(1, 0);
        let mut v = vcpu.lock();
        v.set_state(VcpuState::Aborted);
        v.set_state(VcpuState::Waiting);
    }
}
