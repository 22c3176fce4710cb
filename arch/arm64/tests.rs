//! ARM64 scenario tests
//!
//! End-to-end tests of the trap path: a data abort on the guest
//! distributor frame is decoded, dispatched to the VM's vGIC through the
//! vdev layer, filtered against SPI ownership and applied to the
//! in-memory distributor model.
//!
//! Tests are grouped by functionality:
//! - `test_vgic_*` - ownership filtering and register semantics
//! - `test_mmio_*` - syndrome decoding, write-back and abort injection
//! - `test_run_*` - the same paths driven through the run loop
//!
//! Every test uses two VMs: VM 1 is the primary and receives every
//! unrequested line, VM 2 requests SPI 41.

use alloc::sync::Arc;
use std::collections::VecDeque;
use std::vec::Vec;

use test_case::test_case;

use super::cpu::trap::{EC_DABT_CUR, EC_DABT_LOW};
use super::cpu::trap::InjectedAbort;
use super::cpu::ArchRegs;
use super::interrupt::gic::testing::FakeGicd;
use super::interrupt::gicd;
use crate::config::{HypervisorConfig, VgicMode, GICD_BASE};
use crate::core::hypervisor::testing::hypervisor_with;
use crate::core::irq::InterruptType;
use crate::core::sched::{GuestExecutor, RunOutcome, VcpuExit};
use crate::core::vmm::VcpuHandle;
use crate::emulator::MmioOutcome;
use crate::Hypervisor;

const VM1: VcpuHandle = VcpuHandle::new(1, 0);
const VM2: VcpuHandle = VcpuHandle::new(2, 0);

/// Transfer register used by every access
const SRT: u8 = 2;

fn setup(mode: VgicMode) -> (Arc<FakeGicd>, Hypervisor) {
    let (fake, _mapper, mut hv) = hypervisor_with(HypervisorConfig {
        cpu_count: 2,
        vgic_mode: mode,
        ..HypervisorConfig::default()
    });
    hv.create_vm(1, 1).unwrap();
    hv.create_vm(2, 1).unwrap();
    hv.request_spi(2, 41).unwrap();
    hv.attach_vgic(1).unwrap();
    hv.attach_vgic(2).unwrap();
    hv.route_interrupts().unwrap();
    (fake, hv)
}

/// Lower-EL data abort syndrome with a valid ISS
fn esr(size: u8, write: bool, sf: bool, sse: bool) -> u64 {
    let mut esr = (EC_DABT_LOW << 26) | (1 << 25) | (1 << 24);
    esr |= (size.trailing_zeros() as u64) << 22;
    esr |= (SRT as u64) << 16;
    if sse {
        esr |= 1 << 21;
    }
    if sf {
        esr |= 1 << 15;
    }
    if write {
        esr |= 1 << 6;
    }
    esr
}

fn guest_regs() -> ArchRegs {
    let mut regs = ArchRegs::new();
    regs.reset(0x4_0000, 0);
    regs
}

/// Trap one access of `vcpu` at distributor `offset`
fn trap(hv: &Hypervisor, vcpu: VcpuHandle, esr: u64, offset: u64, value: u64) -> (MmioOutcome, ArchRegs) {
    let mut regs = guest_regs();
    regs.set_gpr(SRT, value);
    hv.set_current(0, Some(vcpu));
    let outcome = hv
        .handle_data_abort(0, vcpu, &mut regs, esr, GICD_BASE + offset, 0xffff_0000_0800_0000 + offset)
        .unwrap();
    hv.set_current(0, None);
    (outcome, regs)
}

fn read(hv: &Hypervisor, vcpu: VcpuHandle, offset: u64, size: u8) -> u64 {
    let (outcome, regs) = trap(hv, vcpu, esr(size, false, false, false), offset, 0);
    assert!(matches!(outcome, MmioOutcome::Read(_)), "{:?}", outcome);
    assert_eq!(regs.pc, 0x4_0004);
    regs.gpr(SRT)
}

fn write(hv: &Hypervisor, vcpu: VcpuHandle, offset: u64, size: u8, value: u64) {
    let (outcome, regs) = trap(hv, vcpu, esr(size, true, false, false), offset, value);
    assert_eq!(outcome, MmioOutcome::Written);
    assert_eq!(regs.pc, 0x4_0004);
}

// ============================================================================
// vGIC ownership filtering
// ============================================================================

#[test]
fn test_vgic_isenabler_hides_foreign_lines() {
    let (fake, hv) = setup(VgicMode::Filtered);
    fake.force_enabled(40, true);
    fake.force_enabled(41, true);

    assert_eq!(read(&hv, VM1, gicd::ISENABLER + 4, 4), 1 << 8);
    assert_eq!(read(&hv, VM2, gicd::ISENABLER + 4, 4), 1 << 9);
    // byte access to the same word
    assert_eq!(read(&hv, VM2, gicd::ISENABLER + 5, 1), 1 << 1);
    assert_eq!(read(&hv, VM1, gicd::ISENABLER + 5, 1), 1 << 0);
}

#[test]
fn test_vgic_w1c_only_touches_owned_lines() {
    let (fake, hv) = setup(VgicMode::Filtered);
    fake.force_enabled(40, true);
    fake.force_enabled(41, true);

    write(&hv, VM1, gicd::ICENABLER + 4, 4, 0xffff_ffff);
    assert!(!fake.enabled(40));
    assert!(fake.enabled(41));

    write(&hv, VM2, gicd::ICENABLER + 4, 4, 1 << 9);
    assert!(!fake.enabled(41));
    write(&hv, VM1, gicd::ISENABLER + 4, 4, 1 << 9);
    assert!(!fake.enabled(41));

    write(&hv, VM2, gicd::ISPENDR + 4, 4, 0xffff_ffff);
    assert!(fake.pending(41));
    assert!(!fake.pending(40));
}

#[test]
fn test_vgic_priority_byte_access() {
    let (_fake, hv) = setup(VgicMode::Filtered);

    write(&hv, VM2, gicd::IPRIORITYR + 41, 1, 0x42);
    assert_eq!(hv.gic().get_irq_priority(41), Ok(0x42));

    write(&hv, VM1, gicd::IPRIORITYR + 41, 1, 0x10);
    assert_eq!(hv.gic().get_irq_priority(41), Ok(0x42));

    // word write keeps the foreign byte
    write(&hv, VM1, gicd::IPRIORITYR + 40, 4, 0x8080_8080);
    assert_eq!(hv.gic().get_irq_priority(40), Ok(0x80));
    assert_eq!(hv.gic().get_irq_priority(41), Ok(0x42));
    assert_eq!(hv.gic().get_irq_priority(42), Ok(0x80));

    assert_eq!(read(&hv, VM1, gicd::IPRIORITYR + 40, 4), 0x8080_0080);
    assert_eq!(read(&hv, VM2, gicd::IPRIORITYR + 40, 4), 0x0000_4200);
    assert_eq!(read(&hv, VM2, gicd::IPRIORITYR + 42, 2), 0);
}

#[test]
fn test_vgic_icfgr_two_bit_fields() {
    let (fake, hv) = setup(VgicMode::Filtered);
    // ICFGR2 covers 32-47, irq 41 is field 9
    write(&hv, VM2, gicd::ICFGR + 8, 4, 0xffff_ffff);
    assert_eq!(fake.peek32(gicd::ICFGR + 8), 0x3 << 18);
    assert_eq!(read(&hv, VM1, gicd::ICFGR + 8, 4), 0);
}

#[test]
fn test_vgic_local_ids_visible_to_all() {
    let (fake, hv) = setup(VgicMode::Filtered);
    fake.force_enabled(3, true);
    fake.force_enabled(27, true);
    assert_eq!(read(&hv, VM1, gicd::ISENABLER, 4), (1 << 3) | (1 << 27));
    // 16-31 are routed to the primary
    assert_eq!(read(&hv, VM2, gicd::ISENABLER, 4), 1 << 3);
}

#[test]
fn test_vgic_ctlr_is_shadowed() {
    let (fake, hv) = setup(VgicMode::Filtered);
    write(&hv, VM1, gicd::CTLR, 4, 0);
    assert_eq!(read(&hv, VM1, gicd::CTLR, 4), 0);
    assert_eq!(read(&hv, VM2, gicd::CTLR, 4), 1);
    assert_eq!(fake.peek32(gicd::CTLR), 1);
}

#[test]
fn test_vgic_read_only_registers() {
    let (fake, hv) = setup(VgicMode::Filtered);
    let typer = fake.peek32(gicd::TYPER);
    write(&hv, VM1, gicd::TYPER, 4, 0);
    write(&hv, VM1, gicd::IIDR, 4, 0);
    assert_eq!(read(&hv, VM1, gicd::TYPER, 4), typer as u64);
    assert_eq!(read(&hv, VM1, gicd::IIDR, 4), 0x0200_043b);

    // targets of SGIs and PPIs are banked and read-only
    write(&hv, VM1, gicd::ITARGETSR + 20, 1, 0x0f);
    assert_eq!(fake.peek32(gicd::ITARGETSR + 20), 0x0101_0101);

    write(&hv, VM2, gicd::ITARGETSR + 41, 1, 0x04);
    assert_eq!(hv.gic().get_irq_affinity(41), Ok(0x04));
}

#[test]
fn test_vgic_sgir_is_reencoded() {
    let (fake, hv) = setup(VgicMode::Filtered);
    write(&hv, VM1, gicd::SGIR, 4, 0x0102_8ff5);
    assert_eq!(fake.sgir_writes(), [0x0102_0005]);
    assert_eq!(read(&hv, VM1, gicd::SGIR, 4), 0);
}

#[test]
fn test_vgic_sgi_pending_banks_forwarded() {
    let (_fake, hv) = setup(VgicMode::Filtered);
    write(&hv, VM2, gicd::SPENDSGIR + 5, 1, 0x03);
    assert_eq!(hv.gic().sgi_pending_state(5), Ok(0x03));
    write(&hv, VM1, gicd::CPENDSGIR + 5, 1, 0x01);
    assert_eq!(hv.gic().sgi_pending_state(5), Ok(0x02));
}

#[test]
fn test_vgic_unknown_offsets() {
    let (fake, hv) = setup(VgicMode::Filtered);
    assert_eq!(read(&hv, VM1, 0x0c, 4), 0);
    write(&hv, VM1, 0x40, 4, 0xdead_beef);
    assert_eq!(fake.peek32(0x40), 0);
}

#[test]
fn test_vgic_passthrough_mode() {
    let (fake, hv) = setup(VgicMode::Passthrough);
    fake.force_enabled(40, true);
    fake.force_enabled(41, true);
    assert_eq!(read(&hv, VM2, gicd::ISENABLER + 4, 4), (1 << 8) | (1 << 9));

    write(&hv, VM2, gicd::ICENABLER + 4, 4, 1 << 8);
    assert!(!fake.enabled(40));

    write(&hv, VM2, gicd::ITARGETSR + 20, 1, 0x0f);
    assert_eq!(fake.peek32(gicd::ITARGETSR + 20), 0x0101_010f);

    write(&hv, VM2, gicd::CTLR, 4, 0);
    assert_eq!(fake.peek32(gicd::CTLR), 1);
    assert_eq!(read(&hv, VM2, gicd::CTLR, 4), 0);
}

// ============================================================================
// MMIO decode and abort injection
// ============================================================================

#[test]
fn test_mmio_unregistered_address_injects_abort() {
    let (_fake, hv) = setup(VgicMode::Filtered);
    let mut regs = guest_regs();
    let esr = esr(4, true, false, false);
    let outcome = hv
        .handle_data_abort(0, VM1, &mut regs, esr, 0x0a00_0000, 0xffff_0000_0a00_0000)
        .unwrap();
    let abort = match outcome {
        MmioOutcome::InjectAbort(abort) => abort,
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(abort.exception_class(), EC_DABT_CUR);
    assert_eq!(abort.far, 0xffff_0000_0a00_0000);
    assert_eq!(abort.esr & 0x3f, 0x10);
    assert_ne!(abort.esr & (1 << 6), 0);
    assert_eq!(regs.pending_abort, Some(abort));
    assert_eq!(regs.pc, 0x4_0000);
}

#[test]
fn test_mmio_abort_from_el0() {
    let (_fake, hv) = setup(VgicMode::Filtered);
    let mut regs = guest_regs();
    regs.spsr = 0;
    hv.handle_data_abort(0, VM1, &mut regs, esr(4, false, false, false), 0x0a00_0000, 0x1000)
        .unwrap();
    assert_eq!(regs.pending_abort.map(|a| a.exception_class()), Some(EC_DABT_LOW));
}

#[test]
fn test_mmio_without_syndrome_injects_abort() {
    let (_fake, hv) = setup(VgicMode::Filtered);
    let mut regs = guest_regs();
    let esr = esr(4, false, false, false) & !(1 << 24);
    let outcome = hv
        .handle_data_abort(0, VM1, &mut regs, esr, GICD_BASE, 0x1000)
        .unwrap();
    assert!(matches!(outcome, MmioOutcome::InjectAbort(_)));
}

#[test_case(8, gicd::ISENABLER ; "doubleword")]
#[test_case(2, gicd::ISENABLER + 1 ; "unaligned halfword")]
#[test_case(4, gicd::ISENABLER + 2 ; "unaligned word")]
fn test_mmio_rejected_access_injects_abort(size: u8, offset: u64) {
    let (_fake, hv) = setup(VgicMode::Filtered);
    let (outcome, regs) = trap(&hv, VM1, esr(size, false, true, false), offset, 0);
    assert!(matches!(outcome, MmioOutcome::InjectAbort(_)), "{:?}", outcome);
    assert!(regs.pending_abort.is_some());
    assert_eq!(regs.pc, 0x4_0000);
}

#[test]
fn test_mmio_load_extension() {
    let (_fake, hv) = setup(VgicMode::Filtered);
    // LDRSB x2: priority 0xa0 sign-extended to 64 bits
    let (_, regs) = trap(&hv, VM1, esr(1, false, true, true), gicd::IPRIORITYR + 40, 0);
    assert_eq!(regs.gpr(SRT), 0xffff_ffff_ffff_ffa0);
    // LDRSB w2: extended to 32 bits only
    let (_, regs) = trap(&hv, VM1, esr(1, false, false, true), gicd::IPRIORITYR + 40, 0);
    assert_eq!(regs.gpr(SRT), 0xffff_ffa0);
    // LDRB w2
    let (_, regs) = trap(&hv, VM1, esr(1, false, false, false), gicd::IPRIORITYR + 40, 0);
    assert_eq!(regs.gpr(SRT), 0xa0);
}

// ============================================================================
// Run loop
// ============================================================================

/// Executor replaying exits and recording what each entry was given
struct Script {
    exits: VecDeque<VcpuExit>,
    seen: Vec<ArchRegs>,
    aborts: Vec<Option<InjectedAbort>>,
}

impl Script {
    fn new(exits: &[VcpuExit]) -> Self {
        Self {
            exits: exits.iter().copied().collect(),
            seen: Vec::new(),
            aborts: Vec::new(),
        }
    }
}

impl GuestExecutor for Script {
    fn run(
        &mut self,
        _vcpu: VcpuHandle,
        regs: &mut ArchRegs,
        abort: Option<InjectedAbort>,
    ) -> VcpuExit {
        self.seen.push(regs.clone());
        self.aborts.push(abort);
        self.exits.pop_front().unwrap_or(VcpuExit::Abort)
    }
}

#[test]
fn test_run_emulates_mmio_between_entries() {
    let (fake, hv) = setup(VgicMode::Filtered);
    fake.force_enabled(40, true);
    fake.force_enabled(41, true);
    hv.vcpu(VM1).unwrap().lock().secondary_reset_and_start(0x4_0000, 0).unwrap();

    let mut exec = Script::new(&[
        VcpuExit::DataAbort {
            esr: esr(4, false, false, false),
            ipa: GICD_BASE + gicd::ISENABLER + 4,
            far: 0xffff_0000_0800_0104,
        },
        VcpuExit::DataAbort {
            esr: esr(4, false, false, false),
            ipa: 0x0a00_0000,
            far: 0xffff_0000_0a00_0000,
        },
        VcpuExit::Wfi,
        VcpuExit::Yield,
    ]);
    hv.vcpu(VM1).unwrap().lock().enable_interrupt(40, InterruptType::Irq).unwrap();
    hv.vcpu(VM1).unwrap().lock().set_pending(40).unwrap();
    assert_eq!(hv.run_vcpu(0, VM1, &mut exec).unwrap(), RunOutcome::Blocked);

    assert_eq!(exec.seen.len(), 4);
    assert_eq!(exec.seen[1].gpr(SRT), 1 << 8);
    assert_eq!(exec.seen[1].pc, 0x4_0004);
    assert_eq!(exec.aborts[0], None);
    assert_eq!(exec.aborts[1], None);
    let abort = exec.aborts[2].unwrap();
    assert_eq!(abort.exception_class(), EC_DABT_CUR);
    assert_eq!(abort.far, 0xffff_0000_0a00_0000);
    assert_eq!(exec.seen[2].pc, 0x4_0004);
    assert_eq!(exec.seen[2].pending_abort, None);
    // delivered once, later entries run clean
    assert_eq!(exec.aborts[3], None);

    let mut again = Script::new(&[VcpuExit::Yield]);
    assert_eq!(hv.run_vcpu(0, VM1, &mut again).unwrap(), RunOutcome::Blocked);
    assert_eq!(again.aborts, [None]);
    let vcpu = hv.vcpu(VM1).unwrap().lock();
    assert_eq!(vcpu.regs().unwrap().pending_abort, None);
}
