//! Trap dispatch and fault interposition.
//!
//! The host routes its breakpoint trap into [`ProbeManager::handle_trap`]
//! and its memory-fault path into [`ProbeManager::handle_fault`]. The
//! dispatch drives the per-context state machine: recognize the hit,
//! run pre-handling, execute the displaced instruction, run
//! post-handling, and return to Idle. One level of reentrancy is
//! tolerated (a probe hit while another probe's handling is in flight
//! single-steps the inner instruction and counts a miss against the
//! outer probe); deeper nesting is fatal.

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::insn::MemFault;
use crate::ops::ProbeOps;
use crate::probe::context::{CpuContext, Status};
use crate::probe::manager::ProbeManager;
use crate::probe::retprobe::{RetInstance, ReturnProbe};
use crate::probe::{substitute, Probe, ProbeKind};
use crate::regs::Regs;

impl<O: ProbeOps> ProbeManager<O> {
    /// Dispatch one breakpoint trap.
    ///
    /// Returns `Ok(true)` when the trap belonged to this manager and
    /// was fully handled (the host resumes at `regs.pc`), `Ok(false)`
    /// for a trap that is not ours, and `Err` when the displaced
    /// instruction faulted: the context has been unwound, `regs.pc`
    /// points back at the probed address, and the host should deliver
    /// the fault through its normal path.
    pub fn handle_trap(
        &self,
        ctx: &mut CpuContext,
        regs: &mut Regs,
    ) -> Result<bool, MemFault> {
        let pc = regs.pc;

        if pc == self.ops.trampoline_addr() {
            let task = self.ops.current_task();
            let ret = self.instances.retire(task, pc, regs);
            regs.set_pc_tagged(ret);
            return Ok(true);
        }

        match self.lookup(pc, regs.half_mode()) {
            Some(probe) if ctx.status == Status::Idle => self.dispatch(ctx, regs, probe),
            Some(probe) => self.dispatch_reentrant(ctx, regs, probe),
            None => self.dispatch_unclaimed(ctx, regs),
        }
    }

    /// Normal hit from Idle.
    fn dispatch(
        &self,
        ctx: &mut CpuContext,
        regs: &mut Regs,
        probe: Arc<Probe>,
    ) -> Result<bool, MemFault> {
        probe.record_hit();
        ctx.active = Some(probe.clone());
        ctx.status = Status::HitActive;

        match &probe.kind {
            ProbeKind::User(handlers) => handlers.pre(regs),
            ProbeKind::Return(list) => self.capture_returns(list, regs),
            ProbeKind::Substitute { target } => {
                // Context stays HitActive with live scratch until the
                // replacement re-enters through the sentinel.
                substitute::enter(ctx, regs, &self.ops, *target);
                return Ok(true);
            }
        }

        ctx.status = Status::SingleStepping;
        if let Err(fault) = self.single_step(&probe, regs) {
            regs.pc = probe.addr();
            ctx.clear();
            return Err(fault);
        }
        ctx.status = Status::SingleStepDone;
        if let ProbeKind::User(handlers) = &probe.kind {
            handlers.post(regs);
        }
        ctx.clear();
        Ok(true)
    }

    /// Hit while another probe's handling is in flight. The inner probe
    /// gets no handler callbacks, only its displaced instruction, and
    /// the outer probe records the miss.
    fn dispatch_reentrant(
        &self,
        ctx: &mut CpuContext,
        regs: &mut Regs,
        probe: Arc<Probe>,
    ) -> Result<bool, MemFault> {
        if let Some(outer) = ctx.active.as_ref() {
            outer.record_miss();
        }
        ctx.save_for_reentry();
        ctx.active = Some(probe.clone());
        ctx.status = Status::Reentered;

        match self.single_step(&probe, regs) {
            Ok(()) => {
                ctx.restore_after_reentry();
                Ok(true)
            }
            Err(fault) => {
                regs.pc = probe.addr();
                ctx.restore_after_reentry();
                Err(fault)
            }
        }
    }

    /// Trap at an address with no matching probe. The one legitimate
    /// case is the substitution sentinel; anything else is spurious and
    /// left to the host.
    fn dispatch_unclaimed(
        &self,
        ctx: &mut CpuContext,
        regs: &mut Regs,
    ) -> Result<bool, MemFault> {
        if regs.pc == substitute::RETURN_SENTINEL {
            if let Some(probe) = ctx.active.clone() {
                if matches!(probe.kind, ProbeKind::Substitute { .. }) {
                    substitute::restore(ctx, regs, &self.ops);
                    // Resume the original function: step its displaced
                    // first instruction so it does not re-trap.
                    ctx.status = Status::SingleStepping;
                    if let Err(fault) = self.single_step(&probe, regs) {
                        regs.pc = probe.addr();
                        ctx.clear();
                        return Err(fault);
                    }
                    ctx.clear();
                    return Ok(true);
                }
            }
        }
        log::trace!("probe: spurious trap at {:#x}", regs.pc);
        Ok(false)
    }

    /// Offer a memory fault raised during probe handling.
    ///
    /// Returns `true` when the fault was claimed and the host should
    /// resume, `false` when it must propagate.
    pub fn handle_fault(&self, ctx: &mut CpuContext, regs: &mut Regs, fault: MemFault) -> bool {
        match ctx.status {
            // Fault while executing the displaced instruction: make the
            // trap transparent by pointing back at the probed address,
            // then let the fault take its normal course.
            Status::SingleStepping | Status::Reentered => {
                if let Some(probe) = ctx.active.as_ref() {
                    regs.pc = probe.addr();
                }
                if ctx.status == Status::Reentered {
                    ctx.restore_after_reentry();
                } else {
                    ctx.clear();
                }
                false
            }
            // Fault inside a handler: a probe-level fault handler may
            // claim it; either way the probe missed this hit.
            Status::HitActive | Status::SingleStepDone => {
                if let Some(probe) = ctx.active.clone() {
                    probe.record_miss();
                    if let ProbeKind::User(handlers) = &probe.kind {
                        return handlers.fault(regs, fault);
                    }
                }
                false
            }
            Status::Idle => false,
        }
    }

    /// Execute the displaced instruction's effect against the saved
    /// context. A failing condition field skips the instruction, which
    /// still counts as stepping past it.
    fn single_step(&self, probe: &Probe, regs: &mut Regs) -> Result<(), MemFault> {
        let insn = probe.saved_insn();
        let (exec, cond) = probe.action.parts();
        if !cond(insn, regs) {
            regs.pc = probe.addr().wrapping_add(probe.len() as u32);
            return Ok(());
        }
        exec(insn, probe.addr(), regs, &self.ops)
    }

    /// Entry half of a return probe: capture the caller's return
    /// address once per enabled registration and aim `lr` at the
    /// trampoline. With several registrations the earlier pushes see
    /// the trampoline as their "return address", which is exactly the
    /// chain the trampoline walk expects.
    fn capture_returns(
        &self,
        list: &Mutex<Vec<Arc<ReturnProbe>>>,
        regs: &mut Regs,
    ) {
        let task = self.ops.current_task();
        let trampoline = self.ops.trampoline_addr();

        // Snapshot the registrations into a buffer sized with the list
        // lock released; instance pushes then run without it, so the
        // capture path never allocates under a lock.
        let mut snapshot: Vec<Arc<ReturnProbe>> = Vec::new();
        {
            let mut guard = list.lock();
            loop {
                let need = guard.len();
                if snapshot.capacity() >= need {
                    break;
                }
                drop(guard);
                snapshot.reserve(need);
                guard = list.lock();
            }
            for rp in guard.iter() {
                if rp.enabled() {
                    snapshot.push(rp.clone());
                }
            }
        }

        for rp in snapshot {
            self.instances.push(RetInstance {
                task,
                ret_addr: regs.lr,
                rp,
            });
            regs.lr = trampoline;
        }
    }
}
