//! Trap dispatch through the simulated executor: handler ordering,
//! displaced-instruction execution, conditional skip, and accounting.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axprobe::regs::FLAG_T;
use axprobe::sim::{asm, SimTarget, CODE_BASE};
use axprobe::{CpuContext, InsnMode, ProbeHandlers, ProbeManager, Regs, Status};

fn setup() -> (SimTarget, ProbeManager<SimTarget>, CpuContext, Regs) {
    let sim = SimTarget::new();
    let mgr = ProbeManager::new(sim.clone());
    let mut regs = Regs::new();
    regs.pc = CODE_BASE;
    regs.sp = axprobe::sim::STACK_TOP - 64;
    (sim, mgr, CpuContext::new(), regs)
}

/// Records (label, r0, pc) at each callback.
struct Recorder {
    log: Mutex<Vec<(&'static str, u32, u32)>>,
}

impl Recorder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            log: Mutex::new(Vec::new()),
        })
    }

    fn entries(&self) -> Vec<(&'static str, u32, u32)> {
        self.log.lock().unwrap().clone()
    }
}

impl ProbeHandlers for Recorder {
    fn pre(&self, regs: &mut Regs) {
        self.log.lock().unwrap().push(("pre", regs.r[0], regs.pc));
    }

    fn post(&self, regs: &mut Regs) {
        self.log.lock().unwrap().push(("post", regs.r[0], regs.pc));
    }
}

// =============================================================================
// Single-Step Dispatch
// =============================================================================

#[test]
fn test_pre_and_post_bracket_the_displaced_instruction() {
    let (sim, mgr, mut ctx, mut regs) = setup();
    sim.write_insn(CODE_BASE, asm::mov_imm(0, 5));
    sim.write_insn(CODE_BASE + 4, asm::add_imm(0, 0, 3));
    sim.write_insn(CODE_BASE + 8, asm::sub_imm(0, 0, 1));

    let rec = Recorder::new();
    let handle = mgr.register_probe(CODE_BASE + 4, rec.clone()).unwrap();

    sim.run_until(&mgr, &mut ctx, &mut regs, CODE_BASE + 12, 100)
        .unwrap();

    assert_eq!(regs.r[0], 7);
    assert_eq!(
        rec.entries(),
        vec![
            // pre: before the add, pc still on the probed address.
            ("pre", 5, CODE_BASE + 4),
            // post: the add has landed, pc past it.
            ("post", 8, CODE_BASE + 8),
        ]
    );
    assert_eq!(mgr.probe_hits(handle).unwrap(), 1);
    assert_eq!(mgr.probe_missed(handle).unwrap(), 0);
    assert_eq!(ctx.status(), Status::Idle);
}

#[test]
fn test_probed_branch_is_simulated_to_its_target() {
    let (sim, mgr, mut ctx, mut regs) = setup();
    sim.write_insn(CODE_BASE, asm::mov_imm(0, 1));
    sim.write_insn(CODE_BASE + 4, asm::b(CODE_BASE + 4, CODE_BASE + 16));
    sim.write_insn(CODE_BASE + 8, asm::mov_imm(0, 0xde)); // skipped
    sim.write_insn(CODE_BASE + 16, asm::mov_imm(1, 2));

    let handle = mgr.register_probe(CODE_BASE + 4, Recorder::new()).unwrap();

    sim.run_until(&mgr, &mut ctx, &mut regs, CODE_BASE + 20, 100)
        .unwrap();

    assert_eq!(regs.r[0], 1);
    assert_eq!(regs.r[1], 2);
    assert_eq!(mgr.probe_hits(handle).unwrap(), 1);
}

#[test]
fn test_probed_call_links_the_return_address() {
    let (sim, mgr, mut ctx, mut regs) = setup();
    let func = CODE_BASE + 0x40;
    sim.write_insn(CODE_BASE, asm::bl(CODE_BASE, func));
    sim.write_insn(func, asm::mov_imm(0, 3));

    mgr.register_probe(CODE_BASE, Recorder::new()).unwrap();

    sim.run_until(&mgr, &mut ctx, &mut regs, func + 4, 100)
        .unwrap();

    assert_eq!(regs.lr, CODE_BASE + 4);
    assert_eq!(regs.r[0], 3);
}

#[test]
fn test_failed_condition_skips_the_displaced_instruction() {
    let (sim, mgr, mut ctx, mut regs) = setup();
    sim.write_insn(CODE_BASE, asm::mov_imm(0, 0));
    sim.write_insn(CODE_BASE + 4, asm::cmp_imm(0, 1));
    // moveq r1, #7: EQ fails after comparing 0 against 1.
    sim.write_insn(CODE_BASE + 8, asm::with_cond(asm::mov_imm(1, 7), 0x0));
    sim.write_insn(CODE_BASE + 12, asm::mov_imm(2, 9));

    let rec = Recorder::new();
    let handle = mgr.register_probe(CODE_BASE + 8, rec.clone()).unwrap();

    sim.run_until(&mgr, &mut ctx, &mut regs, CODE_BASE + 16, 100)
        .unwrap();

    assert_eq!(regs.r[1], 0, "condition failed, mov must not execute");
    assert_eq!(regs.r[2], 9);
    // The hit still dispatched fully: pre, skip, post.
    assert_eq!(mgr.probe_hits(handle).unwrap(), 1);
    let labels: Vec<&str> = rec.entries().iter().map(|e| e.0).collect();
    assert_eq!(labels, vec!["pre", "post"]);
}

// =============================================================================
// Encoding Modes
// =============================================================================

#[test]
fn test_half_mode_program_dispatches_through_a_tagged_probe() {
    let (sim, mgr, mut ctx, mut regs) = setup();
    sim.write_half(CODE_BASE, asm::mov_imm_h(0, 3));
    sim.write_half(CODE_BASE + 2, asm::add_imm_h(0, 4));
    sim.write_half(CODE_BASE + 4, asm::nop_h());

    let handle = mgr
        .register_probe((CODE_BASE + 2) | 1, Recorder::new())
        .unwrap();

    regs.set_pc_tagged(CODE_BASE | 1);
    sim.run_until(&mgr, &mut ctx, &mut regs, CODE_BASE + 6, 100)
        .unwrap();

    assert_eq!(regs.r[0], 7);
    assert!(regs.half_mode());
    assert_eq!(mgr.probe_hits(handle).unwrap(), 1);
}

#[test]
fn test_trap_in_the_wrong_encoding_state_is_not_claimed() {
    let (sim, mgr, mut ctx, mut regs) = setup();
    sim.write_insn(CODE_BASE, asm::mov_imm(0, 5));
    mgr.register_probe(CODE_BASE, Recorder::new()).unwrap();

    // Word-mode probe, but the trapping context is in half mode.
    regs.pc = CODE_BASE;
    regs.cpsr |= FLAG_T;
    assert_eq!(mgr.handle_trap(&mut ctx, &mut regs), Ok(false));
}

// =============================================================================
// Unclaimed Traps
// =============================================================================

#[test]
fn test_spurious_breakpoint_is_left_to_the_host() {
    let (sim, mgr, mut ctx, mut regs) = setup();
    // A breakpoint nobody registered.
    sim.write_insn(CODE_BASE, axprobe::insn::BREAK_WORD);
    regs.pc = CODE_BASE;
    assert_eq!(mgr.handle_trap(&mut ctx, &mut regs), Ok(false));
    assert_eq!(ctx.status(), Status::Idle);
}

// =============================================================================
// Introspection
// =============================================================================

#[test]
fn test_list_probes_reports_addresses_modes_and_counts() {
    let (sim, mgr, mut ctx, mut regs) = setup();
    sim.write_insn(CODE_BASE, asm::mov_imm(0, 5));
    sim.write_insn(CODE_BASE + 4, asm::add_imm(0, 0, 1));
    mgr.register_probe(CODE_BASE, Recorder::new()).unwrap();
    mgr.register_probe(CODE_BASE + 4, Recorder::new()).unwrap();

    sim.run_until(&mgr, &mut ctx, &mut regs, CODE_BASE + 8, 100)
        .unwrap();

    let listed = mgr.list_probes();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0], (CODE_BASE, InsnMode::Word, 1, 0));
    assert_eq!(listed[1], (CODE_BASE + 4, InsnMode::Word, 1, 0));
}

#[test]
fn test_every_hit_is_counted() {
    let (sim, mgr, mut ctx, mut regs) = setup();
    // Loop: r0 = 3; subtract down to zero, branching back while NE.
    sim.write_insn(CODE_BASE, asm::mov_imm(0, 3));
    sim.write_insn(CODE_BASE + 4, asm::sub_imm(0, 0, 1));
    sim.write_insn(CODE_BASE + 8, asm::cmp_imm(0, 0));
    sim.write_insn(
        CODE_BASE + 12,
        asm::with_cond(asm::b(CODE_BASE + 12, CODE_BASE + 4), 0x1),
    );

    let hits = Arc::new(CountingProbe {
        count: AtomicUsize::new(0),
        last_r0: AtomicU32::new(u32::MAX),
    });
    let handle = mgr.register_probe(CODE_BASE + 4, hits.clone()).unwrap();

    sim.run_until(&mgr, &mut ctx, &mut regs, CODE_BASE + 16, 200)
        .unwrap();

    assert_eq!(regs.r[0], 0);
    assert_eq!(hits.count.load(Ordering::Relaxed), 3);
    assert_eq!(hits.last_r0.load(Ordering::Relaxed), 1);
    assert_eq!(mgr.probe_hits(handle).unwrap(), 3);
}

struct CountingProbe {
    count: AtomicUsize,
    last_r0: AtomicU32,
}

impl ProbeHandlers for CountingProbe {
    fn pre(&self, regs: &mut Regs) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.last_r0.store(regs.r[0], Ordering::Relaxed);
    }
}
