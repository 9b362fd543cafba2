//! Dynamic instruction probing for a 32-bit conditional-execution
//! target.
//!
//! The crate lets a host plant probes on live instructions: a probed
//! address is overwritten with a breakpoint, and when execution reaches
//! it the trap dispatcher runs the probe's handlers, executes the
//! displaced instruction out of line (by software simulation or from a
//! relocated copy in an instruction slot), and resumes the target as if
//! nothing happened. On top of the same machinery sit return probes
//! (intercept a function's return via a shared trampoline) and call
//! substitution (divert a function into a replacement that later
//! resumes the original).
//!
//! The host supplies its services through one trait, [`ProbeOps`]:
//! target memory, atomic patching, cache maintenance, the
//! stop-all-contexts barrier, slot storage, the trampoline address, and
//! task identity. The `sim` feature (on by default) provides
//! [`sim::SimTarget`], an in-memory implementation with an instruction
//! executor, which is how the test suite drives the whole stack.
//!
//! # Quick start
//!
//! ```ignore
//! use axprobe::{CpuContext, ProbeHandlers, ProbeManager, Regs};
//! use axprobe::sim::{self, SimTarget};
//! use alloc::sync::Arc;
//!
//! struct CountArgs;
//! impl ProbeHandlers for CountArgs {
//!     fn pre(&self, regs: &mut Regs) {
//!         log::info!("hit with arg0 = {}", regs.arg(0));
//!     }
//! }
//!
//! let sim = SimTarget::new();
//! sim.write_insn(sim::CODE_BASE, sim::asm::mov_imm(0, 7));
//! let mgr = ProbeManager::new(sim.clone());
//! let handle = mgr.register_probe(sim::CODE_BASE, Arc::new(CountArgs))?;
//!
//! // Host trap handler:
//! //   breakpoint trap -> mgr.handle_trap(&mut ctx, &mut regs)
//! //   memory fault    -> mgr.handle_fault(&mut ctx, &mut regs, fault)
//!
//! mgr.unregister_probe(handle)?;
//! ```

#![no_std]

extern crate alloc;

pub mod error;
pub mod insn;
pub mod ops;
pub mod patch;
pub mod probe;
pub mod regs;
pub mod slot;

#[cfg(feature = "sim")]
pub mod sim;

pub use error::{ProbeError, Result};
pub use insn::{InsnMode, MemFault, TargetMem};
pub use ops::ProbeOps;
pub use probe::context::{CpuContext, Status};
pub use probe::manager::ProbeManager;
pub use probe::retprobe::ReturnHandler;
pub use probe::substitute::return_from_substitute;
pub use probe::{ProbeHandle, ProbeHandlers, ReturnProbeHandle};
pub use regs::Regs;
