//! Probe types shared across the registry, the trap dispatcher, and the
//! derived return-probe and substitution subsystems.

extern crate alloc;

pub mod context;
pub mod handler;
pub mod manager;
pub mod retprobe;
pub mod substitute;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::insn::{CondFn, ExecFn, InsnMode, MemFault};
use crate::regs::Regs;
use retprobe::ReturnProbe;

/// User-supplied handlers attached to one probe registration.
///
/// All methods default to no-ops so callers implement only what they
/// need. Handlers run on the trap path with interruption disabled; they
/// must not block.
pub trait ProbeHandlers: Send + Sync {
    /// Runs when execution reaches the probed address, before the
    /// displaced instruction executes.
    fn pre(&self, regs: &mut Regs) {
        let _ = regs;
    }

    /// Runs after the displaced instruction's effect has been applied.
    fn post(&self, regs: &mut Regs) {
        let _ = regs;
    }

    /// Offered a fault raised while this probe's handlers were running.
    /// Return `true` to claim the fault and suppress propagation.
    fn fault(&self, regs: &mut Regs, fault: MemFault) -> bool {
        let _ = (regs, fault);
        false
    }
}

/// How the displaced instruction is executed on a hit.
pub enum DecodedAction {
    /// Simulated entirely in software.
    Simulated { exec: ExecFn, cond: CondFn },
    /// Executed from an out-of-line copy held in `slot`; `exec` applies
    /// the effect corrected for the original address.
    Relocated { slot: u32, exec: ExecFn, cond: CondFn },
}

impl DecodedAction {
    pub(crate) fn parts(&self) -> (ExecFn, CondFn) {
        match self {
            DecodedAction::Simulated { exec, cond } => (*exec, *cond),
            DecodedAction::Relocated { exec, cond, .. } => (*exec, *cond),
        }
    }

    pub(crate) fn slot(&self) -> Option<u32> {
        match self {
            DecodedAction::Relocated { slot, .. } => Some(*slot),
            DecodedAction::Simulated { .. } => None,
        }
    }
}

/// What a probe does when it fires.
pub(crate) enum ProbeKind {
    /// Plain probe: user handlers around a single-step.
    User(Arc<dyn ProbeHandlers>),
    /// Function-entry probe backing one or more return-probe
    /// registrations on the same function.
    Return(Mutex<Vec<Arc<ReturnProbe>>>),
    /// Call substitution: divert to `target` instead of single-stepping.
    Substitute { target: u32 },
}

/// A registered interception point.
pub struct Probe {
    /// Untagged target address.
    addr: u32,
    mode: InsnMode,
    len: usize,
    /// Original instruction bytes, restored at disarm and used to build
    /// the out-of-line copy.
    saved: [u8; 4],
    pub(crate) action: DecodedAction,
    pub(crate) kind: ProbeKind,
    hits: AtomicU64,
    nmissed: AtomicU64,
}

impl Probe {
    pub(crate) fn new(
        addr: u32,
        mode: InsnMode,
        len: usize,
        saved: [u8; 4],
        action: DecodedAction,
        kind: ProbeKind,
    ) -> Self {
        Self {
            addr,
            mode,
            len,
            saved,
            action,
            kind,
            hits: AtomicU64::new(0),
            nmissed: AtomicU64::new(0),
        }
    }

    /// Untagged target address.
    pub fn addr(&self) -> u32 {
        self.addr
    }

    pub fn mode(&self) -> InsnMode {
        self.mode
    }

    /// Displaced instruction length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Original instruction bytes at the target.
    pub fn saved_bytes(&self) -> &[u8] {
        &self.saved[..self.len]
    }

    /// Displaced instruction reassembled as a classifier word.
    pub(crate) fn saved_insn(&self) -> u32 {
        match (self.mode, self.len) {
            (InsnMode::Word, _) => u32::from_le_bytes(self.saved),
            (InsnMode::Half, 2) => u16::from_le_bytes([self.saved[0], self.saved[1]]) as u32,
            (InsnMode::Half, _) => {
                let hw1 = u16::from_le_bytes([self.saved[0], self.saved[1]]) as u32;
                let hw2 = u16::from_le_bytes([self.saved[2], self.saved[3]]) as u32;
                (hw1 << 16) | hw2
            }
        }
    }

    /// Times this probe's dispatch ran to completion.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Times a hit could not be fully dispatched (reentrant hit while
    /// this probe was active, or a fault inside its handlers).
    pub fn missed(&self) -> u64 {
        self.nmissed.load(Ordering::Relaxed)
    }

    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.nmissed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Handle to a registered probe, keyed by the tagged registration
/// address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeHandle(pub(crate) u32);

impl ProbeHandle {
    /// The tagged address this probe was registered at.
    pub fn addr(&self) -> u32 {
        self.0
    }
}

/// Handle to one return-probe registration. Several registrations may
/// share a function, so the handle carries a per-registration id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReturnProbeHandle {
    pub(crate) addr: u32,
    pub(crate) id: u64,
}

impl ReturnProbeHandle {
    pub fn addr(&self) -> u32 {
        self.addr
    }
}
