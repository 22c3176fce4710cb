//! vCPU run loop
//!
//! The world switch itself is architecture plumbing behind
//! [`GuestExecutor`]. This module owns what happens around it: taking the
//! vCPU out of its saved state, emulating trapped MMIO without holding the
//! vCPU lock, and applying the single state transition a run produces.
//!
//! ```text
//! exit                 new state          outcome
//! ----                 ---------          -------
//! WFI, none pending    BLOCKED_INTERRUPT  WaitingForInterrupt
//! yield                BLOCKED            Blocked
//! msg wait             WAITING            Waiting / ResumePreempted
//! direct response      WAITING            Waiting
//! physical IRQ         PREEMPTED          Preempted
//! secure interrupt     PREEMPTED          SecureInterruptHandoff / Preempted
//! priority drop        PREEMPTED          ResumePreempted
//! power off            OFF                PoweredOff
//! abort                ABORTED            Aborted
//! ```

use crate::arch::arm64::cpu::{ArchRegs, FaultInfo, InjectedAbort};
use crate::core::hypervisor::Hypervisor;
use crate::core::irq::{IntId, SPI_MIN_ID};
use crate::core::vmm::{Vcpu, VcpuHandle, VcpuLocked, VcpuState, VmId};
use crate::core::Error;
use crate::emulator::MmioOutcome;
use crate::utils::byte_mask;
use crate::Result;

/// Reason a vCPU stopped executing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuExit {
    /// Stage-2 data abort
    DataAbort {
        /// ESR_EL2
        esr: u64,
        /// Faulting IPA (HPFAR_EL2 based)
        ipa: u64,
        /// FAR_EL2
        far: u64,
    },
    /// WFI trapped
    Wfi,
    /// Guest yielded its time slice
    Yield,
    /// Guest waits for a message
    MsgWait,
    /// Guest answered a direct request
    DirectResponse,
    /// Physical IRQ taken while the guest ran
    Irq,
    /// Secure interrupt taken while the guest ran
    SecureInterrupt {
        /// Interrupt id
        intid: IntId,
    },
    /// Guest dropped its running priority
    PriorityDrop,
    /// Guest deactivated an interrupt
    InterruptDeactivated {
        /// Interrupt id
        intid: IntId,
    },
    /// Guest powered the vCPU off
    PowerOff,
    /// Unrecoverable guest fault
    Abort,
}

/// What the caller should do after [`Hypervisor::run_vcpu`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// vCPU idles until it receives a message
    Waiting,
    /// vCPU yielded or blocked
    Blocked,
    /// vCPU sleeps until a virtual interrupt is pending
    WaitingForInterrupt,
    /// vCPU was interrupted and should be resumed later
    Preempted,
    /// Run `target` to handle a secure interrupt
    SecureInterruptHandoff {
        /// vCPU that received the interrupt
        target: VcpuHandle,
    },
    /// Resume `vcpu`, preempted by a completed secure interrupt
    ResumePreempted {
        /// Preempted vCPU
        vcpu: VcpuHandle,
    },
    /// vCPU is off
    PoweredOff,
    /// vCPU aborted
    Aborted,
    /// vCPU is running elsewhere
    Busy,
}

/// Result of routing a physical interrupt to a vCPU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectOutcome {
    /// Recorded pending, nothing to do now
    Pended,
    /// Target sleeps in WFI and can now be run
    WakeTarget {
        /// Woken vCPU
        vcpu: VcpuHandle,
    },
    /// Target runs on another core that needs a kick
    Kick {
        /// Core to interrupt
        cpu: usize,
    },
    /// No VM owns the interrupt
    Ignored,
}

/// Runs a vCPU's register file on the current core until it exits
pub trait GuestExecutor {
    /// Enter the guest
    ///
    /// `abort` is a synchronous abort queued since the previous entry; the
    /// executor delivers it before resuming at `regs.pc`. It is handed over
    /// exactly once.
    fn run(
        &mut self,
        vcpu: VcpuHandle,
        regs: &mut ArchRegs,
        abort: Option<InjectedAbort>,
    ) -> VcpuExit;
}

impl Hypervisor {
    /// Run `handle` on `cpu` until an exit needs the scheduler
    ///
    /// Data aborts, WFI with an interrupt already pending, interrupt
    /// deactivation and priority drops without a completion signal are
    /// handled here and re-enter the guest.
    pub fn run_vcpu(
        &self,
        cpu: usize,
        handle: VcpuHandle,
        exec: &mut dyn GuestExecutor,
    ) -> Result<RunOutcome> {
        self.check_cpu(cpu)?;
        let vcpu = self.vcpu(handle)?;
        let mut regs = {
            let mut locked = vcpu.lock();
            if let Some(outcome) = Self::prepare_run(&mut locked)? {
                return Ok(outcome);
            }
            locked.bind_cpu(cpu);
            locked.take_regs_for_run()?
        };
        self.set_current(cpu, Some(handle));

        let exit = loop {
            let abort = regs.take_pending_abort();
            if let Some(abort) = abort {
                log::debug!("{}: entering with abort esr={:#x}", handle, abort.esr);
            }
            let exit = exec.run(handle, &mut regs, abort);
            match exit {
                VcpuExit::DataAbort { esr, ipa, far } => {
                    if let Err(err) = self.handle_data_abort(cpu, handle, &mut regs, esr, ipa, far) {
                        log::error!("{}: data abort at {:#x}: {}", handle, ipa, err);
                        break VcpuExit::Abort;
                    }
                }
                VcpuExit::Wfi => {
                    regs.advance_pc();
                    if vcpu.lock().pending_enabled_count() == 0 {
                        break exit;
                    }
                }
                VcpuExit::InterruptDeactivated { intid } => {
                    vcpu.lock().mark_secure_interrupt_deactivated(intid);
                }
                VcpuExit::PriorityDrop => {
                    if vcpu.lock().implicit_completion_signal() {
                        break exit;
                    }
                }
                _ => break exit,
            }
        };

        let mut locked = vcpu.lock();
        locked.return_regs(regs);
        self.set_current(cpu, None);
        Ok(self.finish_run(cpu, vcpu, locked, exit))
    }

    /// Check that a vCPU may run and mark it running
    fn prepare_run(locked: &mut VcpuLocked<'_>) -> Result<Option<RunOutcome>> {
        let outcome = match locked.state() {
            VcpuState::Off => return Err(Error::VcpuOff.into()),
            VcpuState::Aborted => Some(RunOutcome::Aborted),
            VcpuState::Running => Some(RunOutcome::Busy),
            VcpuState::BlockedInterrupt if locked.pending_enabled_count() == 0 => {
                Some(RunOutcome::WaitingForInterrupt)
            }
            _ if !locked.regs_available() => Some(RunOutcome::Busy),
            _ => None,
        };
        if outcome.is_none() {
            locked.set_state(VcpuState::Running);
        }
        Ok(outcome)
    }

    fn finish_run<'a>(
        &'a self,
        cpu: usize,
        vcpu: &'a Vcpu,
        mut locked: VcpuLocked<'a>,
        exit: VcpuExit,
    ) -> RunOutcome {
        let handle = vcpu.handle();
        match exit {
            VcpuExit::Wfi => {
                locked.set_state(VcpuState::BlockedInterrupt);
                RunOutcome::WaitingForInterrupt
            }
            VcpuExit::Yield => {
                locked.set_state(VcpuState::Blocked);
                RunOutcome::Blocked
            }
            VcpuExit::MsgWait => {
                locked.set_state(VcpuState::Waiting);
                match locked.complete_secure_interrupt() {
                    Some(victim) => RunOutcome::ResumePreempted { vcpu: victim },
                    None => RunOutcome::Waiting,
                }
            }
            VcpuExit::DirectResponse => {
                locked.set_direct_request_origin(None);
                locked.set_state(VcpuState::Waiting);
                RunOutcome::Waiting
            }
            VcpuExit::PriorityDrop => {
                locked.set_state(VcpuState::Preempted);
                match locked.complete_secure_interrupt_implicit() {
                    Some(victim) => RunOutcome::ResumePreempted { vcpu: victim },
                    None => RunOutcome::Preempted,
                }
            }
            VcpuExit::SecureInterrupt { intid } => {
                self.route_secure_interrupt(cpu, vcpu, locked, intid)
            }
            VcpuExit::PowerOff => {
                locked.set_state(VcpuState::Off);
                log::info!("{} powered off", handle);
                RunOutcome::PoweredOff
            }
            VcpuExit::Abort => {
                locked.set_state(VcpuState::Aborted);
                log::error!("{} aborted", handle);
                RunOutcome::Aborted
            }
            VcpuExit::Irq | VcpuExit::DataAbort { .. } | VcpuExit::InterruptDeactivated { .. } => {
                locked.set_state(VcpuState::Preempted);
                RunOutcome::Preempted
            }
        }
    }

    /// Hand a secure interrupt to the vCPU of its owner on this core
    ///
    /// The running vCPU is preempted. A target that is idle or preempted
    /// starts handling the interrupt and remembers whom it preempted; a
    /// busy target only gets the interrupt pended.
    fn route_secure_interrupt<'a>(
        &'a self,
        cpu: usize,
        vcpu: &'a Vcpu,
        mut locked: VcpuLocked<'a>,
        intid: IntId,
    ) -> RunOutcome {
        let handle = vcpu.handle();
        let target = self
            .ownership()
            .owner(intid)
            .and_then(|vm| self.vm(vm).ok())
            .map(|vm| vm.vcpu_for_cpu(cpu));
        let target = match target {
            Some(target) => target,
            None => {
                log::warn!("secure interrupt {} has no owner", intid);
                locked.set_state(VcpuState::Preempted);
                return RunOutcome::Preempted;
            }
        };

        if target.handle() == handle {
            locked.set_state(VcpuState::Preempted);
            let entered = if locked.processing_secure_interrupt() {
                locked.set_pending(intid)
            } else {
                locked.enter_secure_interrupt(intid, None, false)
            };
            if let Err(err) = entered {
                log::error!("{}: secure interrupt {}: {}", handle, intid, err);
            }
            return RunOutcome::SecureInterruptHandoff { target: handle };
        }

        drop(locked);
        let mut both = Vcpu::lock_both(vcpu, target);
        both.vcpu1.set_state(VcpuState::Preempted);
        let target_state = both.vcpu2.state();
        let idle = matches!(
            target_state,
            VcpuState::Waiting
                | VcpuState::Blocked
                | VcpuState::BlockedInterrupt
                | VcpuState::Preempted
        );
        if idle && !both.vcpu2.processing_secure_interrupt() {
            let implicit = target_state == VcpuState::Preempted;
            match both.vcpu2.enter_secure_interrupt(intid, Some(handle), implicit) {
                Ok(()) => {
                    log::debug!("secure interrupt {}: {} -> {}", intid, handle, target.handle());
                    RunOutcome::SecureInterruptHandoff {
                        target: target.handle(),
                    }
                }
                Err(err) => {
                    log::error!("{}: secure interrupt {}: {}", target.handle(), intid, err);
                    RunOutcome::Preempted
                }
            }
        } else {
            if let Err(err) = both.vcpu2.set_pending(intid) {
                log::error!("{}: secure interrupt {}: {}", target.handle(), intid, err);
            }
            log::debug!(
                "secure interrupt {} pended on busy {} ({:?})",
                intid,
                target.handle(),
                target_state
            );
            RunOutcome::Preempted
        }
    }

    /// Emulate a stage-2 data abort taken by `handle`
    ///
    /// Loads write the extended value back into the transfer register and
    /// completed accesses step over the instruction. Accesses without a
    /// valid syndrome, to unregistered ranges, or rejected by the device
    /// leave an injected abort pending in `regs`.
    pub fn handle_data_abort(
        &self,
        cpu: usize,
        handle: VcpuHandle,
        regs: &mut ArchRegs,
        esr: u64,
        ipa: u64,
        far: u64,
    ) -> Result<MmioOutcome> {
        let fault = FaultInfo::from_esr(esr, ipa, far, regs.pc);
        let from_el0 = regs.spsr & 0xf == 0;

        let outcome = if !fault.isv {
            log::warn!("{}: data abort at {:#x} without syndrome", handle, ipa);
            MmioOutcome::InjectAbort(InjectedAbort::external_data_abort(&fault, from_el0))
        } else {
            let value = if fault.wnr {
                regs.gpr(fault.srt) & byte_mask(fault.size() as u32)
            } else {
                0
            };
            match self.vdev_mmio_emulation(cpu, handle, &fault, value, from_el0) {
                Ok(outcome) => outcome,
                Err(err) => {
                    log::warn!("{}: mmio {:#x} failed: {}", handle, ipa, err);
                    MmioOutcome::InjectAbort(InjectedAbort::external_data_abort(&fault, from_el0))
                }
            }
        };

        match outcome {
            MmioOutcome::Read(value) => {
                regs.set_gpr(fault.srt, fault.extend(value));
                regs.advance_pc();
            }
            MmioOutcome::Written => regs.advance_pc(),
            MmioOutcome::InjectAbort(abort) => regs.inject_abort(abort),
        }
        Ok(outcome)
    }

    /// Route physical interrupt `intid`, taken on `cpu`, to its owner
    ///
    /// SGIs and PPIs go to the VM running on `cpu`, SPIs to their owner.
    pub fn inject_physical_irq(&self, cpu: usize, intid: IntId) -> Result<InjectOutcome> {
        self.check_cpu(cpu)?;
        let owner: Option<VmId> = if intid < SPI_MIN_ID {
            self.current_vm(cpu)
        } else {
            self.ownership().owner(intid)
        };
        let vm = match owner {
            Some(vm) => self.vm(vm)?,
            None => {
                log::debug!("irq {} on cpu {} has no owner", intid, cpu);
                return Ok(InjectOutcome::Ignored);
            }
        };
        let vcpu = vm.vcpu_for_cpu(cpu);
        let mut locked = vcpu.lock();
        locked.set_pending(intid)?;
        if !locked.is_enabled(intid) {
            return Ok(InjectOutcome::Pended);
        }
        Ok(match locked.state() {
            VcpuState::BlockedInterrupt => InjectOutcome::WakeTarget {
                vcpu: vcpu.handle(),
            },
            VcpuState::Running => InjectOutcome::Kick {
                cpu: locked.cpu().unwrap_or(cpu),
            },
            _ => InjectOutcome::Pended,
        })
    }

    /// Record a direct request from `origin` to `target`
    ///
    /// A vCPU serves one direct request at a time.
    pub fn deliver_direct_request(&self, target: VcpuHandle, origin: VmId) -> Result<()> {
        let vcpu = self.vcpu(target)?;
        let mut locked = vcpu.lock();
        if locked.is_off() {
            return Err(Error::VcpuOff.into());
        }
        if let Some(current) = locked.direct_request_origin() {
            log::warn!("{} busy with request from vm {}", target, current);
            return Err(crate::Error::ResourceBusy);
        }
        locked.set_direct_request_origin(Some(origin));
        Ok(())
    }
}
