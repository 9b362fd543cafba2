//! Saved register context of the probed target.
//!
//! The probed ISA is a 32-bit conditional-execution machine: thirteen
//! general registers, a stack pointer, a link register holding return
//! addresses, a program counter, and a status register whose top four
//! bits are the N/Z/C/V condition flags. Bit 5 of the status register
//! selects the compressed ("half") encoding, mirroring bit 0 of tagged
//! code addresses.

/// Number of general-purpose registers (r0..r12).
pub const NUM_GPRS: usize = 13;

/// Negative flag.
pub const FLAG_N: u32 = 1 << 31;
/// Zero flag.
pub const FLAG_Z: u32 = 1 << 30;
/// Carry flag.
pub const FLAG_C: u32 = 1 << 29;
/// Overflow flag.
pub const FLAG_V: u32 = 1 << 28;
/// Compressed-encoding state bit.
pub const FLAG_T: u32 = 1 << 5;

/// Register context captured at trap entry and handed to every handler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Regs {
    /// General registers r0..r12. r0..r3 carry call arguments, r0 the
    /// return value.
    pub r: [u32; NUM_GPRS],
    /// Stack pointer.
    pub sp: u32,
    /// Link register (return address of the current call).
    pub lr: u32,
    /// Program counter.
    pub pc: u32,
    /// Status register (condition flags + encoding state).
    pub cpsr: u32,
}

impl Regs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Call argument `n` (0..=3) per the calling convention.
    #[inline]
    pub fn arg(&self, n: usize) -> u32 {
        self.r[n]
    }

    /// Function return value slot.
    #[inline]
    pub fn retval(&self) -> u32 {
        self.r[0]
    }

    #[inline]
    pub fn set_retval(&mut self, val: u32) {
        self.r[0] = val;
    }

    /// Whether the compressed-encoding state bit is set.
    #[inline]
    pub fn half_mode(&self) -> bool {
        self.cpsr & FLAG_T != 0
    }

    /// Set the program counter from a mode-tagged address: bit 0 selects
    /// the compressed encoding and is stripped from the stored pc.
    pub fn set_pc_tagged(&mut self, addr: u32) {
        if addr & 1 != 0 {
            self.cpsr |= FLAG_T;
        } else {
            self.cpsr &= !FLAG_T;
        }
        self.pc = addr & !1;
    }

    /// Evaluate a 4-bit condition field against the current flags.
    ///
    /// Field 0b1110 is "always"; 0b1111 never reaches here because the
    /// classifier rejects that encoding space outright.
    pub fn condition_passes(&self, cond: u8) -> bool {
        let n = self.cpsr & FLAG_N != 0;
        let z = self.cpsr & FLAG_Z != 0;
        let c = self.cpsr & FLAG_C != 0;
        let v = self.cpsr & FLAG_V != 0;
        match cond & 0xf {
            0x0 => z,            // EQ
            0x1 => !z,           // NE
            0x2 => c,            // CS
            0x3 => !c,           // CC
            0x4 => n,            // MI
            0x5 => !n,           // PL
            0x6 => v,            // VS
            0x7 => !v,           // VC
            0x8 => c && !z,      // HI
            0x9 => !c || z,      // LS
            0xa => n == v,       // GE
            0xb => n != v,       // LT
            0xc => !z && n == v, // GT
            0xd => z || n != v,  // LE
            _ => true,           // AL
        }
    }
}
