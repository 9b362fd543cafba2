//! Code patching capability.
//!
//! `CodePatch` is the only path that writes executable memory. Arming
//! picks between a single atomic-unit store and the stop-all-contexts
//! barrier: a word-mode breakpoint and a narrow half-mode breakpoint
//! each fit one naturally aligned unit, but the wide half-mode
//! breakpoint spans two halfword units when the address is not
//! word-aligned, and a fetch between the two stores would see a torn
//! encoding. Disarming always takes the barrier so a trap handler that
//! already read the breakpoint can finish reading the original bytes
//! before they are restored under it.

use crate::insn::{self, MemFault};
use crate::ops::ProbeOps;
use crate::probe::Probe;

/// Exclusive permission to patch executable target memory.
pub struct CodePatch<'a, O: ProbeOps> {
    ops: &'a O,
}

impl<'a, O: ProbeOps> CodePatch<'a, O> {
    pub fn new(ops: &'a O) -> Self {
        Self { ops }
    }

    /// Store one naturally aligned unit and flush the range.
    pub fn write_atomic_unit(&self, addr: u32, bytes: &[u8]) -> Result<(), MemFault> {
        debug_assert!(bytes.len() == 2 || bytes.len() == 4);
        debug_assert_eq!(addr as usize % bytes.len(), 0);
        self.ops.write_unit(addr, bytes)?;
        self.ops.flush_icache(addr, bytes.len());
        Ok(())
    }

    /// Store bytes with every other context quiesced, then flush.
    pub fn write_with_barrier(&self, addr: u32, bytes: &[u8]) -> Result<(), MemFault> {
        let mut result = Ok(());
        self.ops.with_all_stopped(&mut || {
            result = self.ops.write_bytes(addr, bytes);
        });
        result?;
        self.ops.flush_icache(addr, bytes.len());
        Ok(())
    }

    /// Install the breakpoint encoding at the probe's address.
    pub fn arm(&self, probe: &Probe) -> Result<(), MemFault> {
        let (bp, len) = insn::breakpoint_bytes(probe.mode(), probe.len());
        let addr = probe.addr();
        if len == 2 || addr % 4 == 0 {
            self.write_atomic_unit(addr, &bp[..len])
        } else {
            // Wide breakpoint at a halfword-aligned address: two units.
            self.write_with_barrier(addr, &bp[..len])
        }
    }

    /// Restore the probe's original instruction bytes.
    pub fn disarm(&self, probe: &Probe) -> Result<(), MemFault> {
        self.write_with_barrier(probe.addr(), probe.saved_bytes())
    }
}
