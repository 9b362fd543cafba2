//! Instruction classifier for the probed ISA.
//!
//! One target instruction is decoded into a verdict: rejected (the rest
//! of the system cannot safely displace it), simulatable in place, or
//! requiring an out-of-line slot copy. The verdict carries an execute
//! function that applies the instruction's architectural effect against
//! the saved register context, plus a condition function the dispatcher
//! consults before honoring the effect. Branches resolve against the
//! original probe address, never the slot address.
//!
//! The ISA has two encoding families selected by bit 0 of a tagged code
//! address: full 32-bit words ("word mode", conditional via bits 28..31)
//! and a compressed 16/32-bit form ("half mode").

use crate::regs::Regs;

/// A data-abort style fault raised by a target memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemFault {
    /// Address whose access faulted.
    pub addr: u32,
}

/// Target memory as seen by instruction execution. Implementations use
/// interior mutability; a miss reports the faulting address.
pub trait TargetMem {
    fn read_u32(&self, addr: u32) -> Result<u32, MemFault>;
    fn write_u32(&self, addr: u32, val: u32) -> Result<(), MemFault>;
}

/// Encoding family of a probed address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsnMode {
    /// Full 32-bit words, 4-byte aligned.
    Word,
    /// Compressed 16/32-bit encodings, 2-byte aligned.
    Half,
}

/// Applies one instruction's effect to the saved context.
///
/// `insn` is the encoding (wide half-mode instructions pack the first
/// halfword into the high 16 bits), `addr` the untagged address the
/// instruction was fetched from.
pub type ExecFn = fn(insn: u32, addr: u32, regs: &mut Regs, mem: &dyn TargetMem) -> Result<(), MemFault>;

/// Execution-condition predicate for one instruction.
pub type CondFn = fn(insn: u32, regs: &Regs) -> bool;

/// Classifier verdict.
pub enum Decoded {
    /// Cannot be displaced; registration must fail.
    Reject,
    /// Simulated entirely in software, no slot needed.
    Simulate { exec: ExecFn, cond: CondFn },
    /// Needs an out-of-line copy in an instruction slot.
    Slot { exec: ExecFn, cond: CondFn },
}

/// Breakpoint encoding for word mode.
pub const BREAK_WORD: u32 = 0xe7f0_01f8;
/// Breakpoint encoding for narrow half-mode instructions.
pub const BREAK_HALF: u16 = 0xde18;
/// Breakpoint encoding replacing wide half-mode instructions; spans two
/// halfword units, so installing it at a non-word-aligned address needs
/// the global barrier.
pub const BREAK_HALF_WIDE: u32 = 0xf7f0_a018;

/// Whether a half-mode first halfword opens a wide (32-bit) encoding.
#[inline]
pub fn wide_half(hw: u16) -> bool {
    matches!(hw & 0xf800, 0xe800 | 0xf000 | 0xf800)
}

/// Byte length of a decoded instruction. Wide half-mode encodings carry
/// their first halfword in the high 16 bits, so a nonzero high half
/// means 4 bytes.
#[inline]
pub fn insn_len(mode: InsnMode, insn: u32) -> usize {
    match mode {
        InsnMode::Word => 4,
        InsnMode::Half => {
            if insn >> 16 != 0 {
                4
            } else {
                2
            }
        }
    }
}

/// Little-endian breakpoint bytes for a probe of the given mode/length.
pub fn breakpoint_bytes(mode: InsnMode, len: usize) -> ([u8; 4], usize) {
    match (mode, len) {
        (InsnMode::Word, _) => (BREAK_WORD.to_le_bytes(), 4),
        (InsnMode::Half, 2) => {
            let b = BREAK_HALF.to_le_bytes();
            ([b[0], b[1], 0, 0], 2)
        }
        (InsnMode::Half, _) => {
            // Two halfwords, first halfword stored first.
            let hi = ((BREAK_HALF_WIDE >> 16) as u16).to_le_bytes();
            let lo = (BREAK_HALF_WIDE as u16).to_le_bytes();
            ([hi[0], hi[1], lo[0], lo[1]], 4)
        }
    }
}

fn sext(x: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((x << shift) as i32) >> shift
}

#[inline]
fn get_reg(regs: &Regs, idx: u32) -> u32 {
    match idx & 0xf {
        13 => regs.sp,
        14 => regs.lr,
        n => regs.r[n as usize],
    }
}

#[inline]
fn set_reg(regs: &mut Regs, idx: u32, val: u32) {
    match idx & 0xf {
        13 => regs.sp = val,
        14 => regs.lr = val,
        n => regs.r[n as usize] = val,
    }
}

// =============================================================================
// Condition predicates
// =============================================================================

fn cond_always(_insn: u32, _regs: &Regs) -> bool {
    true
}

fn cond_word(insn: u32, regs: &Regs) -> bool {
    regs.condition_passes((insn >> 28) as u8)
}

fn cond_half_branch(insn: u32, regs: &Regs) -> bool {
    regs.condition_passes(((insn >> 8) & 0xf) as u8)
}

// =============================================================================
// Word-mode execution
// =============================================================================

fn exec_branch_word(insn: u32, addr: u32, regs: &mut Regs, _mem: &dyn TargetMem) -> Result<(), MemFault> {
    let off = sext(insn & 0x00ff_ffff, 24) << 2;
    if insn & (1 << 24) != 0 {
        regs.lr = addr.wrapping_add(4);
    }
    // Fetch pipeline: pc reads as insn address + 8.
    regs.pc = addr.wrapping_add(8).wrapping_add(off as u32);
    Ok(())
}

fn exec_bx_word(insn: u32, _addr: u32, regs: &mut Regs, _mem: &dyn TargetMem) -> Result<(), MemFault> {
    let target = get_reg(regs, insn & 0xf);
    regs.set_pc_tagged(target);
    Ok(())
}

fn dp_operand2_imm(insn: u32) -> u32 {
    let imm = insn & 0xff;
    let rot = ((insn >> 8) & 0xf) * 2;
    imm.rotate_right(rot)
}

fn dp_apply(regs: &mut Regs, insn: u32, op2: u32, addr: u32) {
    let opcode = (insn >> 21) & 0xf;
    let rd = (insn >> 12) & 0xf;
    let rn_val = get_reg(regs, (insn >> 16) & 0xf);
    match opcode {
        0x2 => set_reg(regs, rd, rn_val.wrapping_sub(op2)), // SUB
        0x4 => set_reg(regs, rd, rn_val.wrapping_add(op2)), // ADD
        0xa => {
            // CMP: flags only.
            let res = rn_val.wrapping_sub(op2);
            let mut cpsr = regs.cpsr & 0x0fff_ffff;
            if res & 0x8000_0000 != 0 {
                cpsr |= crate::regs::FLAG_N;
            }
            if res == 0 {
                cpsr |= crate::regs::FLAG_Z;
            }
            if rn_val >= op2 {
                cpsr |= crate::regs::FLAG_C;
            }
            if ((rn_val ^ op2) & (rn_val ^ res)) & 0x8000_0000 != 0 {
                cpsr |= crate::regs::FLAG_V;
            }
            regs.cpsr = cpsr;
        }
        _ => set_reg(regs, rd, op2), // MOV (0xd)
    }
    regs.pc = addr.wrapping_add(4);
}

fn exec_dp_imm_word(insn: u32, addr: u32, regs: &mut Regs, _mem: &dyn TargetMem) -> Result<(), MemFault> {
    let op2 = dp_operand2_imm(insn);
    dp_apply(regs, insn, op2, addr);
    Ok(())
}

fn exec_dp_reg_word(insn: u32, addr: u32, regs: &mut Regs, _mem: &dyn TargetMem) -> Result<(), MemFault> {
    let op2 = get_reg(regs, insn & 0xf);
    dp_apply(regs, insn, op2, addr);
    Ok(())
}

fn transfer_ea(insn: u32, regs: &Regs) -> u32 {
    let base = get_reg(regs, (insn >> 16) & 0xf);
    let off = insn & 0xfff;
    if insn & (1 << 23) != 0 {
        base.wrapping_add(off)
    } else {
        base.wrapping_sub(off)
    }
}

fn exec_ldr_word(insn: u32, addr: u32, regs: &mut Regs, mem: &dyn TargetMem) -> Result<(), MemFault> {
    let ea = transfer_ea(insn, regs);
    let val = mem.read_u32(ea)?;
    set_reg(regs, (insn >> 12) & 0xf, val);
    regs.pc = addr.wrapping_add(4);
    Ok(())
}

fn exec_str_word(insn: u32, addr: u32, regs: &mut Regs, mem: &dyn TargetMem) -> Result<(), MemFault> {
    let ea = transfer_ea(insn, regs);
    mem.write_u32(ea, get_reg(regs, (insn >> 12) & 0xf))?;
    regs.pc = addr.wrapping_add(4);
    Ok(())
}

// =============================================================================
// Half-mode execution
// =============================================================================

fn exec_branch_cond_half(insn: u32, addr: u32, regs: &mut Regs, _mem: &dyn TargetMem) -> Result<(), MemFault> {
    let off = sext(insn & 0xff, 8) << 1;
    regs.pc = addr.wrapping_add(4).wrapping_add(off as u32);
    Ok(())
}

fn exec_branch_half(insn: u32, addr: u32, regs: &mut Regs, _mem: &dyn TargetMem) -> Result<(), MemFault> {
    let off = sext(insn & 0x7ff, 11) << 1;
    regs.pc = addr.wrapping_add(4).wrapping_add(off as u32);
    Ok(())
}

fn exec_bx_half(insn: u32, addr: u32, regs: &mut Regs, _mem: &dyn TargetMem) -> Result<(), MemFault> {
    let target = get_reg(regs, (insn >> 3) & 0xf);
    if insn & (1 << 7) != 0 {
        // Link form: return address keeps the half-mode tag.
        regs.lr = addr.wrapping_add(2) | 1;
    }
    regs.set_pc_tagged(target);
    Ok(())
}

fn exec_mov_imm_half(insn: u32, addr: u32, regs: &mut Regs, _mem: &dyn TargetMem) -> Result<(), MemFault> {
    let rd = ((insn >> 8) & 0x7) as usize;
    regs.r[rd] = insn & 0xff;
    regs.pc = addr.wrapping_add(2);
    Ok(())
}

fn exec_add_imm_half(insn: u32, addr: u32, regs: &mut Regs, _mem: &dyn TargetMem) -> Result<(), MemFault> {
    let rd = ((insn >> 8) & 0x7) as usize;
    regs.r[rd] = regs.r[rd].wrapping_add(insn & 0xff);
    regs.pc = addr.wrapping_add(2);
    Ok(())
}

fn exec_sub_imm_half(insn: u32, addr: u32, regs: &mut Regs, _mem: &dyn TargetMem) -> Result<(), MemFault> {
    let rd = ((insn >> 8) & 0x7) as usize;
    regs.r[rd] = regs.r[rd].wrapping_sub(insn & 0xff);
    regs.pc = addr.wrapping_add(2);
    Ok(())
}

fn exec_nop_half(_insn: u32, addr: u32, regs: &mut Regs, _mem: &dyn TargetMem) -> Result<(), MemFault> {
    regs.pc = addr.wrapping_add(2);
    Ok(())
}

fn exec_bl_wide(insn: u32, addr: u32, regs: &mut Regs, _mem: &dyn TargetMem) -> Result<(), MemFault> {
    let hw1 = insn >> 16;
    let hw2 = insn & 0xffff;
    let s = (hw1 >> 10) & 1;
    let j1 = (hw2 >> 13) & 1;
    let j2 = (hw2 >> 11) & 1;
    let i1 = !(j1 ^ s) & 1;
    let i2 = !(j2 ^ s) & 1;
    let raw = (s << 24) | (i1 << 23) | (i2 << 22) | ((hw1 & 0x3ff) << 12) | ((hw2 & 0x7ff) << 1);
    let off = sext(raw, 25);
    regs.lr = addr.wrapping_add(4) | 1;
    regs.pc = addr.wrapping_add(4).wrapping_add(off as u32);
    Ok(())
}

// =============================================================================
// Classification
// =============================================================================

/// Classify one instruction. See the module docs for the encoding model.
pub fn classify(insn: u32, mode: InsnMode) -> Decoded {
    match mode {
        InsnMode::Word => classify_word(insn),
        InsnMode::Half => classify_half(insn),
    }
}

fn classify_word(insn: u32) -> Decoded {
    if insn == BREAK_WORD {
        // Our own breakpoint: probing it would recurse.
        return Decoded::Reject;
    }
    if insn >> 28 == 0xf {
        // Unconditional-extension space: not modeled.
        return Decoded::Reject;
    }
    if insn & 0x0fff_fff0 == 0x012f_ff10 {
        if insn & 0xf == 15 {
            return Decoded::Reject;
        }
        return Decoded::Simulate { exec: exec_bx_word, cond: cond_word };
    }
    if insn & 0x0e00_0000 == 0x0a00_0000 {
        // B / BL: meaning depends on its own address, simulate.
        return Decoded::Simulate { exec: exec_branch_word, cond: cond_word };
    }
    if insn & 0x0f00_0000 == 0x0f00_0000 {
        // Supervisor call.
        return Decoded::Reject;
    }
    if insn & 0x0e00_0000 == 0x0200_0000 {
        return classify_dp(insn, exec_dp_imm_word);
    }
    if insn & 0x0e00_0010 == 0x0000_0000 {
        if insn & 0xf == 15 {
            return Decoded::Reject;
        }
        return classify_dp(insn, exec_dp_reg_word);
    }
    if insn & 0x0e00_0000 == 0x0400_0000 {
        // Single register transfer, immediate offset. Only the plain
        // pre-indexed word form without writeback is displaceable.
        let p = insn & (1 << 24) != 0;
        let w = insn & (1 << 21) != 0;
        let b = insn & (1 << 22) != 0;
        let rn = (insn >> 16) & 0xf;
        let rd = (insn >> 12) & 0xf;
        if !p || w || b || rn == 15 || rd == 15 {
            return Decoded::Reject;
        }
        let exec = if insn & (1 << 20) != 0 { exec_ldr_word } else { exec_str_word };
        return Decoded::Slot { exec, cond: cond_word };
    }
    Decoded::Reject
}

fn classify_dp(insn: u32, exec: ExecFn) -> Decoded {
    let opcode = (insn >> 21) & 0xf;
    let s = insn & (1 << 20) != 0;
    let rd = (insn >> 12) & 0xf;
    let rn = (insn >> 16) & 0xf;
    let ok = match opcode {
        0x2 | 0x4 | 0xd => !s && rd != 15 && rn != 15, // SUB / ADD / MOV
        0xa => s && rn != 15,                          // CMP
        _ => false,
    };
    if ok {
        Decoded::Slot { exec, cond: cond_word }
    } else {
        Decoded::Reject
    }
}

fn classify_half(insn: u32) -> Decoded {
    if insn >> 16 != 0 {
        return classify_half_wide(insn);
    }
    let hw = insn as u16;
    if hw == BREAK_HALF || hw & 0xff00 == 0xbe00 {
        return Decoded::Reject;
    }
    if hw & 0xff00 == 0xbf00 && hw & 0x000f == 0 {
        // Hint space: only the plain no-op form.
        return Decoded::Slot { exec: exec_nop_half, cond: cond_always };
    }
    if hw & 0xff00 == 0x4700 {
        if (hw >> 3) & 0xf == 15 {
            return Decoded::Reject;
        }
        return Decoded::Simulate { exec: exec_bx_half, cond: cond_always };
    }
    if hw & 0xf000 == 0xd000 {
        let cond = (hw >> 8) & 0xf;
        if cond >= 0xe {
            // 0xe is permanently undefined, 0xf a supervisor call.
            return Decoded::Reject;
        }
        return Decoded::Simulate { exec: exec_branch_cond_half, cond: cond_half_branch };
    }
    if hw & 0xf800 == 0xe000 {
        return Decoded::Simulate { exec: exec_branch_half, cond: cond_always };
    }
    if hw & 0xf800 == 0x2000 {
        return Decoded::Slot { exec: exec_mov_imm_half, cond: cond_always };
    }
    if hw & 0xf800 == 0x3000 {
        return Decoded::Slot { exec: exec_add_imm_half, cond: cond_always };
    }
    if hw & 0xf800 == 0x3800 {
        return Decoded::Slot { exec: exec_sub_imm_half, cond: cond_always };
    }
    Decoded::Reject
}

fn classify_half_wide(insn: u32) -> Decoded {
    if insn == BREAK_HALF_WIDE {
        return Decoded::Reject;
    }
    let hw1 = (insn >> 16) as u16;
    let hw2 = insn as u16;
    if hw1 & 0xf800 == 0xf000 && hw2 & 0xd000 == 0xd000 {
        return Decoded::Simulate { exec: exec_bl_wide, cond: cond_always };
    }
    Decoded::Reject
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoMem;
    impl TargetMem for NoMem {
        fn read_u32(&self, addr: u32) -> Result<u32, MemFault> {
            Err(MemFault { addr })
        }
        fn write_u32(&self, addr: u32, _val: u32) -> Result<(), MemFault> {
            Err(MemFault { addr })
        }
    }

    fn exec_of(d: Decoded) -> (ExecFn, CondFn) {
        match d {
            Decoded::Simulate { exec, cond } | Decoded::Slot { exec, cond } => (exec, cond),
            Decoded::Reject => panic!("instruction unexpectedly rejected"),
        }
    }

    #[test]
    fn breakpoints_are_rejected() {
        assert!(matches!(classify(BREAK_WORD, InsnMode::Word), Decoded::Reject));
        assert!(matches!(classify(BREAK_HALF as u32, InsnMode::Half), Decoded::Reject));
        assert!(matches!(classify(BREAK_HALF_WIDE, InsnMode::Half), Decoded::Reject));
    }

    #[test]
    fn pc_destination_is_rejected() {
        // mov pc, #0: a plain pc write the displacer cannot honor.
        let insn = 0xe3a0_f000;
        assert!(matches!(classify(insn, InsnMode::Word), Decoded::Reject));
    }

    #[test]
    fn branch_simulates_against_original_address() {
        // b .+0x20 from 0x8000: offset field (0x20 - 8) >> 2 = 6.
        let insn = 0xea00_0006;
        let d = classify(insn, InsnMode::Word);
        assert!(matches!(d, Decoded::Simulate { .. }));
        let (exec, _) = exec_of(d);
        let mut regs = Regs::new();
        exec(insn, 0x8000, &mut regs, &NoMem).unwrap();
        assert_eq!(regs.pc, 0x8020);
    }

    #[test]
    fn link_branch_saves_return_address() {
        let insn = 0xeb00_0006; // bl
        let (exec, _) = exec_of(classify(insn, InsnMode::Word));
        let mut regs = Regs::new();
        exec(insn, 0x8000, &mut regs, &NoMem).unwrap();
        assert_eq!(regs.lr, 0x8004);
        assert_eq!(regs.pc, 0x8020);
    }

    #[test]
    fn mov_imm_needs_slot_and_advances_pc() {
        let insn = 0xe3a0_0029; // mov r0, #0x29
        let d = classify(insn, InsnMode::Word);
        assert!(matches!(d, Decoded::Slot { .. }));
        let (exec, _) = exec_of(d);
        let mut regs = Regs::new();
        exec(insn, 0x8000, &mut regs, &NoMem).unwrap();
        assert_eq!(regs.r[0], 0x29);
        assert_eq!(regs.pc, 0x8004);
    }

    #[test]
    fn cmp_sets_flags() {
        let insn = 0xe350_0005; // cmp r0, #5
        let (exec, _) = exec_of(classify(insn, InsnMode::Word));
        let mut regs = Regs::new();
        regs.r[0] = 5;
        exec(insn, 0x8000, &mut regs, &NoMem).unwrap();
        assert!(regs.condition_passes(0x0)); // EQ after equal compare
        assert!(regs.condition_passes(0xa)); // GE
    }

    #[test]
    fn load_fault_reports_effective_address() {
        let insn = 0xe590_1008; // ldr r1, [r0, #8]
        let (exec, _) = exec_of(classify(insn, InsnMode::Word));
        let mut regs = Regs::new();
        regs.r[0] = 0xdead_0000;
        let err = exec(insn, 0x8000, &mut regs, &NoMem).unwrap_err();
        assert_eq!(err.addr, 0xdead_0008);
    }

    #[test]
    fn pc_relative_load_is_rejected() {
        let insn = 0xe59f_1008; // ldr r1, [pc, #8]
        assert!(matches!(classify(insn, InsnMode::Word), Decoded::Reject));
    }

    #[test]
    fn conditional_branch_condition_is_separate_from_effect() {
        let insn = 0x0a00_0006; // beq .+0x20
        let d = classify(insn, InsnMode::Word);
        let (_, cond) = exec_of(d);
        let mut regs = Regs::new();
        assert!(!cond(insn, &regs));
        regs.cpsr |= crate::regs::FLAG_Z;
        assert!(cond(insn, &regs));
    }

    #[test]
    fn half_mode_width_detection() {
        assert_eq!(insn_len(InsnMode::Half, 0x2005), 2);
        assert!(wide_half(0xf000));
        assert!(!wide_half(0x2000));
        assert_eq!(insn_len(InsnMode::Half, 0xf000_d000), 4);
    }

    #[test]
    fn half_mov_and_branch() {
        let mov = 0x2107; // movs r1, #7
        let (exec, _) = exec_of(classify(mov, InsnMode::Half));
        let mut regs = Regs::new();
        exec(mov, 0x9000, &mut regs, &NoMem).unwrap();
        assert_eq!(regs.r[1], 7);
        assert_eq!(regs.pc, 0x9002);

        let b = 0xe004; // b .+0xc
        let (exec, _) = exec_of(classify(b, InsnMode::Half));
        exec(b, 0x9000, &mut regs, &NoMem).unwrap();
        assert_eq!(regs.pc, 0x900c);
    }

    #[test]
    fn wide_link_branch_round_trip() {
        // bl .+0x100 encoded in the wide form: imm11 = 0x80, J1 = J2 = 1.
        let insn = 0xf000_f880u32;
        assert!(wide_half((insn >> 16) as u16));
        let d = classify(insn, InsnMode::Half);
        assert!(matches!(d, Decoded::Simulate { .. }));
        let (exec, _) = exec_of(d);
        let mut regs = Regs::new();
        exec(insn, 0x9000, &mut regs, &NoMem).unwrap();
        assert_eq!(regs.lr, 0x9004 | 1);
        assert_eq!(regs.pc, 0x9004 + 0x100);
    }

    #[test]
    fn breakpoint_bytes_geometry() {
        let (b, len) = breakpoint_bytes(InsnMode::Word, 4);
        assert_eq!(len, 4);
        assert_eq!(u32::from_le_bytes(b), BREAK_WORD);

        let (b, len) = breakpoint_bytes(InsnMode::Half, 2);
        assert_eq!(len, 2);
        assert_eq!(u16::from_le_bytes([b[0], b[1]]), BREAK_HALF);

        let (_, len) = breakpoint_bytes(InsnMode::Half, 4);
        assert_eq!(len, 4);
    }
}
