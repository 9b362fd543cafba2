//! Call substitution: diverting a probed function into a replacement.
//!
//! A substitute probe saves the trap-time registers plus a bounded
//! window of the caller's stack into per-context scratch, then resumes
//! execution at the replacement function with interrupts masked. The
//! replacement runs with the original's arguments; when done it calls
//! [`return_from_substitute`], which parks the pc on a sentinel address
//! that can never hold code. The resulting trap restores the saved
//! state and the dispatch single-steps the displaced instruction, so
//! the original function proceeds as if nothing happened.

use crate::ops::ProbeOps;
use crate::probe::context::{CpuContext, SUBST_STACK_MAX};
use crate::regs::Regs;

/// Re-entry address planted by [`return_from_substitute`]. Sits at the
/// top of the address space where no instruction can be mapped, so the
/// trap it raises is unambiguous.
pub const RETURN_SENTINEL: u32 = 0xffff_fff0;

/// Called by a replacement function in place of returning normally.
/// Transfers control back to the probe machinery, which restores the
/// saved context and resumes the original function.
pub fn return_from_substitute(regs: &mut Regs) {
    regs.pc = RETURN_SENTINEL;
}

/// Entry half: capture state and divert to `target`.
pub(crate) fn enter<O: ProbeOps>(ctx: &mut CpuContext, regs: &mut Regs, ops: &O, target: u32) {
    let top = ops.stack_top(regs.sp);
    let window = (top.saturating_sub(regs.sp) as usize).min(SUBST_STACK_MAX);

    ctx.scratch.regs = regs.clone();
    ctx.scratch.sp = regs.sp;
    ctx.scratch.stack_len = window;
    if window > 0 {
        if let Err(f) = ops.read_bytes(regs.sp, &mut ctx.scratch.stack[..window]) {
            panic!("substitute: caller stack unreadable at {:#x}", f.addr);
        }
    }
    ctx.scratch_live = true;
    ctx.irq_masked = true;

    regs.set_pc_tagged(target);
    log::debug!(
        "substitute: diverted {:#x} -> {:#x}, saved {} stack bytes",
        ctx.scratch.regs.pc,
        target,
        window
    );
}

/// Return half: restore the captured state at sentinel re-entry.
///
/// A stack pointer that moved between capture and re-entry means the
/// replacement unbalanced the caller's frame; the saved window can no
/// longer be put back where it came from, and continuing would corrupt
/// the probed function. That is fatal.
pub(crate) fn restore<O: ProbeOps>(ctx: &mut CpuContext, regs: &mut Regs, ops: &O) {
    if !ctx.scratch_live {
        panic!("substitute: sentinel re-entry without saved context");
    }
    if regs.sp != ctx.scratch.sp {
        panic!(
            "substitute: return with moved stack (saved sp {:#x}, found {:#x})",
            ctx.scratch.sp, regs.sp
        );
    }
    let window = ctx.scratch.stack_len;
    if window > 0 {
        if let Err(f) = ops.write_bytes(ctx.scratch.sp, &ctx.scratch.stack[..window]) {
            panic!("substitute: caller stack unwritable at {:#x}", f.addr);
        }
    }
    *regs = ctx.scratch.regs.clone();
    ctx.scratch_live = false;
    ctx.irq_masked = false;
    log::debug!("substitute: restored context at {:#x}", regs.pc);
}
