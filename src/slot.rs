//! Instruction slot pool for out-of-line execution.
//!
//! When a probe displaces an instruction that cannot be simulated in
//! place, the original encoding is copied to a scratch "instruction
//! slot" in executable memory. The pool hands out fixed-size slots from
//! a region the host designates at startup; a bitmap tracks occupancy.

use spin::Mutex;

/// Size of each instruction slot in bytes.
/// One instruction plus room for a completion breakpoint.
pub const SLOT_SIZE: usize = 32;

/// Number of slots in a pool. 64 slots at 32 bytes is 2 KiB, enough for
/// typical probe counts.
pub const NUM_SLOTS: usize = 64;

/// Bitmap-backed allocator over a fixed executable region.
pub struct SlotPool {
    base: u32,
    /// Bit N set means slot N is in use.
    bitmap: Mutex<u64>,
}

impl SlotPool {
    /// Create a pool over `NUM_SLOTS * SLOT_SIZE` bytes starting at `base`.
    pub const fn new(base: u32) -> Self {
        Self { base, bitmap: Mutex::new(0) }
    }

    /// Allocate a slot, returning its address, or `None` when exhausted.
    pub fn alloc(&self) -> Option<u32> {
        let mut bitmap = self.bitmap.lock();
        for i in 0..NUM_SLOTS {
            if *bitmap & (1u64 << i) == 0 {
                *bitmap |= 1u64 << i;
                let addr = self.base + (i * SLOT_SIZE) as u32;
                log::debug!("slot: allocated slot {} at {:#x}", i, addr);
                return Some(addr);
            }
        }
        log::warn!("slot: no free slots available");
        None
    }

    /// Free a previously allocated slot.
    pub fn free(&self, addr: u32) {
        if !self.contains(addr) {
            log::warn!("slot: invalid slot address {:#x}", addr);
            return;
        }
        let idx = (addr - self.base) as usize / SLOT_SIZE;
        let mut bitmap = self.bitmap.lock();
        *bitmap &= !(1u64 << idx);
        log::debug!("slot: freed slot {} at {:#x}", idx, addr);
    }

    /// Whether an address falls inside the pool region.
    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.base && addr < self.base + (NUM_SLOTS * SLOT_SIZE) as u32
    }

    /// Base address of the pool region.
    pub fn base(&self) -> u32 {
        self.base
    }

    /// Number of slots currently free.
    pub fn free_count(&self) -> usize {
        NUM_SLOTS - self.bitmap.lock().count_ones() as usize
    }
}
