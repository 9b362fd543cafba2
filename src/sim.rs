//! In-memory simulated target for exercising the probing core.
//!
//! `SimTarget` implements [`ProbeOps`] over a list of byte regions and
//! plays the role the real machine plays in production: it holds code,
//! a slot area, a stack, and the return trampoline, counts barrier and
//! cache-flush invocations, and carries a settable current-task id.
//! The [`SimTarget::step`] executor fetches the instruction under the
//! simulated pc and either reports a trap (breakpoint encodings and the
//! substitution sentinel) or applies the instruction's effect through
//! the same execution functions the single-stepper uses.

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use spin::Mutex;

use crate::insn::{self, Decoded, InsnMode, MemFault, TargetMem};
use crate::ops::ProbeOps;
use crate::probe::context::CpuContext;
use crate::probe::manager::ProbeManager;
use crate::probe::substitute::RETURN_SENTINEL;
use crate::regs::Regs;
use crate::slot::{SlotPool, NUM_SLOTS, SLOT_SIZE};

/// Base of the default code region.
pub const CODE_BASE: u32 = 0x8000;
/// Size of the default code region.
pub const CODE_SIZE: usize = 0x4000;
/// Base of the instruction-slot region.
pub const SLOT_BASE: u32 = 0x6000;
/// Address of the return trampoline stub (holds a breakpoint).
pub const TRAMPOLINE: u32 = 0x7000;
/// Default stack region.
pub const STACK_BASE: u32 = 0x1_0000;
/// Exclusive top of the default stack.
pub const STACK_TOP: u32 = 0x2_0000;
/// Range treated as fault/exception handling text.
pub const EXCEPTION_TEXT: core::ops::Range<u32> = 0x100..0x200;

struct Region {
    base: u32,
    bytes: Vec<u8>,
}

struct SimInner {
    regions: Mutex<Vec<Region>>,
    slots: SlotPool,
    task: AtomicU64,
    barriers: AtomicUsize,
    flushes: AtomicUsize,
}

/// Simulated probing target. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SimTarget {
    inner: Arc<SimInner>,
}

/// Outcome of one simulated fetch-execute cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// An ordinary instruction executed.
    Executed,
    /// The pc sits on a breakpoint encoding or the return sentinel;
    /// the trap dispatcher should run.
    Trap,
}

impl SimTarget {
    /// A target with code, slot, stack, and trampoline regions mapped
    /// and the trampoline stub in place.
    pub fn new() -> Self {
        let sim = Self {
            inner: Arc::new(SimInner {
                regions: Mutex::new(Vec::new()),
                slots: SlotPool::new(SLOT_BASE),
                task: AtomicU64::new(1),
                barriers: AtomicUsize::new(0),
                flushes: AtomicUsize::new(0),
            }),
        };
        sim.map(CODE_BASE, CODE_SIZE);
        sim.map(SLOT_BASE, NUM_SLOTS * SLOT_SIZE);
        sim.map(STACK_BASE, (STACK_TOP - STACK_BASE) as usize);
        sim.map(TRAMPOLINE, 4);
        sim.write_insn(TRAMPOLINE, insn::BREAK_WORD);
        sim
    }

    /// Map a zero-filled region.
    pub fn map(&self, base: u32, len: usize) {
        self.inner.regions.lock().push(Region {
            base,
            bytes: vec![0; len],
        });
    }

    /// Store a word-mode instruction.
    pub fn write_insn(&self, addr: u32, insn: u32) {
        self.write_bytes(addr, &insn.to_le_bytes())
            .unwrap_or_else(|f| panic!("sim: unmapped write at {:#x}", f.addr));
    }

    /// Store a narrow half-mode instruction.
    pub fn write_half(&self, addr: u32, hw: u16) {
        self.write_bytes(addr, &hw.to_le_bytes())
            .unwrap_or_else(|f| panic!("sim: unmapped write at {:#x}", f.addr));
    }

    /// Store a wide half-mode instruction (first halfword in the high
    /// 16 bits of `insn`).
    pub fn write_half_wide(&self, addr: u32, insn: u32) {
        self.write_half(addr, (insn >> 16) as u16);
        self.write_half(addr + 2, insn as u16);
    }

    pub fn set_task(&self, task: u64) {
        self.inner.task.store(task, Ordering::Relaxed);
    }

    /// How many times the stop-all-contexts barrier ran.
    pub fn barrier_count(&self) -> usize {
        self.inner.barriers.load(Ordering::Relaxed)
    }

    /// How many instruction-cache flushes were requested.
    pub fn flush_count(&self) -> usize {
        self.inner.flushes.load(Ordering::Relaxed)
    }

    fn with_region<R>(
        &self,
        addr: u32,
        len: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, MemFault> {
        let mut regions = self.inner.regions.lock();
        for region in regions.iter_mut() {
            let end = region.base as usize + region.bytes.len();
            if addr >= region.base && addr as usize + len <= end {
                let off = (addr - region.base) as usize;
                return Ok(f(&mut region.bytes[off..off + len]));
            }
        }
        Err(MemFault { addr })
    }

    /// One fetch-execute cycle at `regs.pc`.
    ///
    /// Panics on an instruction the execution model cannot apply; the
    /// simulated programs stick to the modeled subset.
    pub fn step(&self, regs: &mut Regs) -> Result<Step, MemFault> {
        let pc = regs.pc;
        if pc == RETURN_SENTINEL {
            return Ok(Step::Trap);
        }

        let mode = if regs.half_mode() {
            InsnMode::Half
        } else {
            InsnMode::Word
        };
        let insn = match mode {
            InsnMode::Word => self.read_u32(pc)?,
            InsnMode::Half => {
                let mut buf = [0u8; 2];
                self.read_bytes(pc, &mut buf)?;
                let hw1 = u16::from_le_bytes(buf);
                if insn::wide_half(hw1) {
                    self.read_bytes(pc + 2, &mut buf)?;
                    ((hw1 as u32) << 16) | u16::from_le_bytes(buf) as u32
                } else {
                    hw1 as u32
                }
            }
        };

        let is_break = match mode {
            InsnMode::Word => insn == insn::BREAK_WORD,
            InsnMode::Half => insn == insn::BREAK_HALF as u32 || insn == insn::BREAK_HALF_WIDE,
        };
        if is_break {
            return Ok(Step::Trap);
        }

        match insn::classify(insn, mode) {
            Decoded::Simulate { exec, cond } | Decoded::Slot { exec, cond } => {
                if cond(insn, regs) {
                    exec(insn, pc, regs, self)?;
                } else {
                    regs.pc = pc.wrapping_add(insn::insn_len(mode, insn) as u32);
                }
                Ok(Step::Executed)
            }
            Decoded::Reject => panic!("sim: cannot execute {:#x} at {:#x}", insn, pc),
        }
    }

    /// Run until the pc reaches `stop`, dispatching traps through
    /// `mgr`. Faults surfaced by the dispatcher or the executor
    /// propagate to the caller with the registers left as the fault
    /// unwinding produced them.
    pub fn run_until(
        &self,
        mgr: &ProbeManager<SimTarget>,
        ctx: &mut CpuContext,
        regs: &mut Regs,
        stop: u32,
        mut fuel: usize,
    ) -> Result<(), MemFault> {
        while regs.pc != stop {
            assert!(fuel > 0, "sim: out of fuel at {:#x}", regs.pc);
            fuel -= 1;
            match self.step(regs)? {
                Step::Executed => {}
                Step::Trap => {
                    let handled = mgr.handle_trap(ctx, regs)?;
                    assert!(handled, "sim: unclaimed trap at {:#x}", regs.pc);
                }
            }
        }
        Ok(())
    }
}

impl Default for SimTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetMem for SimTarget {
    fn read_u32(&self, addr: u32) -> Result<u32, MemFault> {
        self.with_region(addr, 4, |b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn write_u32(&self, addr: u32, val: u32) -> Result<(), MemFault> {
        self.with_region(addr, 4, |b| b.copy_from_slice(&val.to_le_bytes()))
    }
}

impl ProbeOps for SimTarget {
    fn read_bytes(&self, addr: u32, buf: &mut [u8]) -> Result<(), MemFault> {
        self.with_region(addr, buf.len(), |b| buf.copy_from_slice(b))
    }

    fn write_bytes(&self, addr: u32, bytes: &[u8]) -> Result<(), MemFault> {
        self.with_region(addr, bytes.len(), |b| b.copy_from_slice(bytes))
    }

    fn write_unit(&self, addr: u32, bytes: &[u8]) -> Result<(), MemFault> {
        debug_assert!(bytes.len() == 2 || bytes.len() == 4);
        debug_assert_eq!(addr as usize % bytes.len(), 0);
        self.write_bytes(addr, bytes)
    }

    fn flush_icache(&self, _addr: u32, _len: usize) {
        self.inner.flushes.fetch_add(1, Ordering::Relaxed);
    }

    fn with_all_stopped(&self, f: &mut dyn FnMut()) {
        self.inner.barriers.fetch_add(1, Ordering::Relaxed);
        f();
    }

    fn in_exception_text(&self, addr: u32) -> bool {
        EXCEPTION_TEXT.contains(&addr)
    }

    fn alloc_insn_slot(&self) -> Option<u32> {
        self.inner.slots.alloc()
    }

    fn free_insn_slot(&self, addr: u32) {
        self.inner.slots.free(addr);
    }

    fn trampoline_addr(&self) -> u32 {
        TRAMPOLINE
    }

    fn stack_top(&self, sp: u32) -> u32 {
        if (STACK_BASE..STACK_TOP).contains(&sp) {
            STACK_TOP
        } else {
            sp
        }
    }

    fn current_task(&self) -> u64 {
        self.inner.task.load(Ordering::Relaxed)
    }
}

/// Hand assemblers for the modeled instruction subset.
pub mod asm {
    /// `mov rd, #imm8` (word mode).
    pub fn mov_imm(rd: u32, imm: u32) -> u32 {
        0xe3a0_0000 | (rd << 12) | (imm & 0xff)
    }

    /// `add rd, rn, #imm8` (word mode).
    pub fn add_imm(rd: u32, rn: u32, imm: u32) -> u32 {
        0xe280_0000 | (rn << 16) | (rd << 12) | (imm & 0xff)
    }

    /// `sub rd, rn, #imm8` (word mode).
    pub fn sub_imm(rd: u32, rn: u32, imm: u32) -> u32 {
        0xe240_0000 | (rn << 16) | (rd << 12) | (imm & 0xff)
    }

    /// `cmp rn, #imm8` (word mode, sets flags).
    pub fn cmp_imm(rn: u32, imm: u32) -> u32 {
        0xe350_0000 | (rn << 16) | (imm & 0xff)
    }

    /// `ldr rd, [rn, #imm12]` (word mode).
    pub fn ldr_imm(rd: u32, rn: u32, imm: u32) -> u32 {
        0xe590_0000 | (rn << 16) | (rd << 12) | (imm & 0xfff)
    }

    /// `str rd, [rn, #imm12]` (word mode).
    pub fn str_imm(rd: u32, rn: u32, imm: u32) -> u32 {
        0xe580_0000 | (rn << 16) | (rd << 12) | (imm & 0xfff)
    }

    /// `b to` assembled at `from` (word mode).
    pub fn b(from: u32, to: u32) -> u32 {
        let off = (to.wrapping_sub(from.wrapping_add(8)) as i32) >> 2;
        0xea00_0000 | (off as u32 & 0x00ff_ffff)
    }

    /// `bl to` assembled at `from` (word mode).
    pub fn bl(from: u32, to: u32) -> u32 {
        let off = (to.wrapping_sub(from.wrapping_add(8)) as i32) >> 2;
        0xeb00_0000 | (off as u32 & 0x00ff_ffff)
    }

    /// `bx rm` (word mode).
    pub fn bx(rm: u32) -> u32 {
        0xe12f_ff10 | rm
    }

    /// Replace the condition field of a word-mode instruction.
    pub fn with_cond(insn: u32, cond: u32) -> u32 {
        (insn & 0x0fff_ffff) | (cond << 28)
    }

    /// `mov rd, #imm8` (half mode, narrow).
    pub fn mov_imm_h(rd: u16, imm: u16) -> u16 {
        0x2000 | (rd << 8) | (imm & 0xff)
    }

    /// `add rd, #imm8` (half mode, narrow).
    pub fn add_imm_h(rd: u16, imm: u16) -> u16 {
        0x3000 | (rd << 8) | (imm & 0xff)
    }

    /// `nop` (half mode hint).
    pub fn nop_h() -> u16 {
        0xbf00
    }

    /// `bx rm` (half mode).
    pub fn bx_h(rm: u16) -> u16 {
        0x4700 | (rm << 3)
    }
}
