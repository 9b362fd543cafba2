//! Collaborator interface between the probing core and its host.
//!
//! Everything the core needs from the surrounding runtime goes through
//! one trait: target memory access, executable-memory patching,
//! instruction-cache maintenance, the stop-all-contexts barrier, the
//! instruction-slot allocator, the return trampoline, and execution
//! identity. Hosts implement it once; the `sim` module provides an
//! in-memory implementation for tests.

use crate::insn::{MemFault, TargetMem};

/// Host services consumed by the probing core.
///
/// All methods take `&self`: implementations are shared across the
/// registration path and the trap path and use interior mutability.
pub trait ProbeOps: TargetMem + Send + Sync {
    /// Read raw bytes from target memory.
    fn read_bytes(&self, addr: u32, buf: &mut [u8]) -> Result<(), MemFault>;

    /// Write raw bytes to target memory without atomicity guarantees.
    /// Callers needing patch atomicity go through `write_unit` or wrap
    /// the write in `with_all_stopped`.
    fn write_bytes(&self, addr: u32, bytes: &[u8]) -> Result<(), MemFault>;

    /// Overwrite one naturally aligned unit (2 or 4 bytes) such that any
    /// concurrent fetch sees either the old or the new encoding, never a
    /// mix.
    fn write_unit(&self, addr: u32, bytes: &[u8]) -> Result<(), MemFault>;

    /// Make the processors observe freshly patched bytes in the range.
    fn flush_icache(&self, addr: u32, len: usize);

    /// Run `f` with every other execution context quiesced. Expensive;
    /// the core uses it only where a single atomic write cannot close
    /// the tearing window.
    fn with_all_stopped(&self, f: &mut dyn FnMut());

    /// Whether `addr` lies inside the fault/exception handling text,
    /// where installing a probe would re-trap recursively.
    fn in_exception_text(&self, addr: u32) -> bool;

    /// Hand out one scratch instruction slot, or `None` when exhausted.
    fn alloc_insn_slot(&self) -> Option<u32>;

    /// Return a slot to the pool.
    fn free_insn_slot(&self, addr: u32);

    /// Address of the return-probe trampoline stub.
    fn trampoline_addr(&self) -> u32;

    /// Exclusive top of the stack the given stack pointer lives on.
    /// Bounds the window the substitution subsystem may copy.
    fn stack_top(&self, sp: u32) -> u32;

    /// Identifier of the task currently executing on this context.
    /// Keys the return-probe instance table.
    fn current_task(&self) -> u64;
}
