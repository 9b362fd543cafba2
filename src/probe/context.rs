//! Per-execution-context control block.
//!
//! One `CpuContext` exists per CPU or logical thread of control, created
//! at context startup and owned exclusively by that context; it is
//! never shared or locked. It carries the trap dispatch status, the
//! probe currently being handled, exactly one level of saved state for
//! reentrant hits, and the scratch area the substitution subsystem uses
//! to park the caller's registers and stack window.

extern crate alloc;

use alloc::sync::Arc;

use super::Probe;
use crate::regs::Regs;

/// Trap dispatch status of one context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// No probe being handled.
    Idle,
    /// A probe hit was recognized; pre-handling is in progress (or, for
    /// a substitution probe, the substitute is running).
    HitActive,
    /// The displaced instruction is being executed.
    SingleStepping,
    /// The displaced instruction finished; post-handling is in progress.
    SingleStepDone,
    /// A second probe hit arrived before the first finished.
    Reentered,
}

/// Bytes of caller stack the substitution subsystem may park.
pub const SUBST_STACK_MAX: usize = 64;

/// Saved caller state for an in-flight substitution.
pub(crate) struct SubstScratch {
    pub regs: Regs,
    pub stack: [u8; SUBST_STACK_MAX],
    pub stack_len: usize,
    pub sp: u32,
}

impl SubstScratch {
    const fn empty() -> Self {
        Self {
            regs: Regs {
                r: [0; crate::regs::NUM_GPRS],
                sp: 0,
                lr: 0,
                pc: 0,
                cpsr: 0,
            },
            stack: [0; SUBST_STACK_MAX],
            stack_len: 0,
            sp: 0,
        }
    }
}

/// Control block for one execution context.
pub struct CpuContext {
    pub(crate) status: Status,
    pub(crate) active: Option<Arc<Probe>>,
    /// One-deep history for the single supported level of reentrancy.
    saved: Option<(Option<Arc<Probe>>, Status)>,
    pub(crate) scratch: SubstScratch,
    pub(crate) scratch_live: bool,
    /// Set while a substitution keeps the context's interruption source
    /// masked beyond the trap itself.
    pub(crate) irq_masked: bool,
}

impl CpuContext {
    pub fn new() -> Self {
        Self {
            status: Status::Idle,
            active: None,
            saved: None,
            scratch: SubstScratch::empty(),
            scratch_live: false,
            irq_masked: false,
        }
    }

    /// Current dispatch status.
    pub fn status(&self) -> Status {
        self.status
    }

    /// Whether a substitution currently keeps interruption masked.
    pub fn irq_masked(&self) -> bool {
        self.irq_masked
    }

    /// Park the current `(active, status)` pair ahead of a reentrant
    /// dispatch. Only one level is supported; a second park while one is
    /// pending means the execution environment violated the nesting
    /// contract, and there is no safe way to continue.
    pub(crate) fn save_for_reentry(&mut self) {
        if self.saved.is_some() {
            panic!("probe nesting deeper than one level");
        }
        self.saved = Some((self.active.take(), self.status));
    }

    /// Restore the parked pair after a reentrant dispatch completed.
    pub(crate) fn restore_after_reentry(&mut self) {
        let (active, status) = self
            .saved
            .take()
            .expect("reentry restore without saved state");
        self.active = active;
        self.status = status;
    }

    pub(crate) fn clear(&mut self) {
        self.active = None;
        self.status = Status::Idle;
    }
}

impl Default for CpuContext {
    fn default() -> Self {
        Self::new()
    }
}
