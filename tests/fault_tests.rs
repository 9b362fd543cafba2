//! Fault transparency: a displaced instruction that faults must leave
//! the target looking exactly as if the fault happened at the probed
//! address, with the dispatch fully unwound.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axprobe::sim::{asm, SimTarget, CODE_BASE, STACK_TOP};
use axprobe::{CpuContext, MemFault, ProbeHandlers, ProbeManager, ProbeOps, Regs, Status};

const DATA: u32 = 0x3000;
const BAD: u32 = 0x4000; // never mapped

fn setup() -> (SimTarget, ProbeManager<SimTarget>, CpuContext, Regs) {
    let sim = SimTarget::new();
    sim.map(DATA, 0x100);
    let mgr = ProbeManager::new(sim.clone());
    let mut regs = Regs::new();
    regs.pc = CODE_BASE;
    regs.sp = STACK_TOP - 32;
    (sim, mgr, CpuContext::new(), regs)
}

struct CountPre {
    count: AtomicUsize,
}

impl ProbeHandlers for CountPre {
    fn pre(&self, _regs: &mut Regs) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }
}

// =============================================================================
// Single-Step Faults
// =============================================================================

#[test]
fn test_faulting_load_unwinds_to_the_probed_address() {
    let (sim, mgr, mut ctx, mut regs) = setup();
    sim.write_insn(CODE_BASE, asm::ldr_imm(0, 1, 0));

    let pre = Arc::new(CountPre {
        count: AtomicUsize::new(0),
    });
    let handle = mgr.register_probe(CODE_BASE, pre.clone()).unwrap();

    regs.r[1] = BAD;
    let err = sim
        .run_until(&mgr, &mut ctx, &mut regs, CODE_BASE + 4, 100)
        .unwrap_err();

    // The fault reports the effective address, not the probe address.
    assert_eq!(err, MemFault { addr: BAD });
    // Transparency: pc points back at the probed instruction and the
    // context is ready for the host's fault delivery.
    assert_eq!(regs.pc, CODE_BASE);
    assert_eq!(ctx.status(), Status::Idle);
    assert_eq!(pre.count.load(Ordering::Relaxed), 1);
    assert_eq!(mgr.probe_hits(handle).unwrap(), 1);
}

#[test]
fn test_replayed_hit_after_fault_fixup_succeeds() {
    let (sim, mgr, mut ctx, mut regs) = setup();
    sim.write_insn(CODE_BASE, asm::ldr_imm(0, 1, 4));
    sim.write_bytes(DATA + 4, &0xfeed_beefu32.to_le_bytes())
        .unwrap();

    let pre = Arc::new(CountPre {
        count: AtomicUsize::new(0),
    });
    let handle = mgr.register_probe(CODE_BASE, pre.clone()).unwrap();

    regs.r[1] = BAD;
    sim.run_until(&mgr, &mut ctx, &mut regs, CODE_BASE + 4, 100)
        .unwrap_err();

    // The "fault handler" repairs the base register and replays, the
    // way a host retries after resolving a page fault.
    regs.r[1] = DATA;
    sim.run_until(&mgr, &mut ctx, &mut regs, CODE_BASE + 4, 100)
        .unwrap();

    assert_eq!(regs.r[0], 0xfeed_beef);
    assert_eq!(pre.count.load(Ordering::Relaxed), 2);
    assert_eq!(mgr.probe_hits(handle).unwrap(), 2);
}

#[test]
fn test_faulting_store_reports_the_target_address() {
    let (sim, mgr, mut ctx, mut regs) = setup();
    sim.write_insn(CODE_BASE, asm::str_imm(0, 1, 8));
    mgr.register_probe(
        CODE_BASE,
        Arc::new(CountPre {
            count: AtomicUsize::new(0),
        }),
    )
    .unwrap();

    regs.r[1] = BAD;
    let err = sim
        .run_until(&mgr, &mut ctx, &mut regs, CODE_BASE + 4, 100)
        .unwrap_err();
    assert_eq!(err, MemFault { addr: BAD + 8 });
    assert_eq!(regs.pc, CODE_BASE);
}

// =============================================================================
// Reentrant Faults
// =============================================================================

#[test]
fn test_fault_during_reentrant_step_unwinds_to_the_outer_dispatch() {
    let (sim, mgr, mut ctx, mut regs) = setup();
    let repl = CODE_BASE + 0x100;
    sim.write_insn(CODE_BASE, asm::mov_imm(0, 1));
    sim.write_insn(repl, asm::ldr_imm(0, 1, 0));

    let sub = mgr.register_substitute(CODE_BASE, repl).unwrap();
    mgr.register_probe(
        repl,
        Arc::new(CountPre {
            count: AtomicUsize::new(0),
        }),
    )
    .unwrap();

    regs.r[1] = BAD;
    let err = sim
        .run_until(&mgr, &mut ctx, &mut regs, repl + 4, 100)
        .unwrap_err();

    assert_eq!(err, MemFault { addr: BAD });
    // The inner step unwound to its own address; the outer substitution
    // dispatch is still in flight.
    assert_eq!(regs.pc, repl);
    assert_eq!(ctx.status(), Status::HitActive);
    assert_eq!(mgr.probe_missed(sub).unwrap(), 1);
}

// =============================================================================
// Handler And Idle Faults
// =============================================================================

#[test]
fn test_handler_fault_while_active_counts_a_miss() {
    let (sim, mgr, mut ctx, mut regs) = setup();
    let repl = CODE_BASE + 0x100;
    sim.write_insn(CODE_BASE, asm::mov_imm(0, 1));
    sim.write_insn(repl, asm::mov_imm(1, 5));

    let sub = mgr.register_substitute(CODE_BASE, repl).unwrap();
    sim.run_until(&mgr, &mut ctx, &mut regs, repl, 100).unwrap();
    assert_eq!(ctx.status(), Status::HitActive);

    // A fault surfacing while the dispatch is active but no user fault
    // hook exists: unclaimed, and the probe records the miss.
    let claimed = mgr.handle_fault(&mut ctx, &mut regs, MemFault { addr: BAD });
    assert!(!claimed);
    assert_eq!(mgr.probe_missed(sub).unwrap(), 1);
}

#[test]
fn test_idle_fault_is_never_claimed() {
    let (_sim, mgr, mut ctx, mut regs) = setup();
    assert!(!mgr.handle_fault(&mut ctx, &mut regs, MemFault { addr: BAD }));
}
