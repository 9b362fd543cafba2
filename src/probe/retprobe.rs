//! Return probes: intercepting a function's return.
//!
//! A return probe is an ordinary entry probe whose hit captures the
//! caller's return address, pushes an instance onto a task-keyed list,
//! and rewrites the return-address slot to point at a shared trampoline.
//! When the function returns it lands on the trampoline; the dispatch
//! walks the task's instances newest-first, invoking handlers, until it
//! finds the instance holding a non-trampoline address, which is the
//! real return target. Instances retired by the walk are freed only
//! after the bucket lock is released, keeping the hot path
//! allocation-free under the lock.

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

use crate::regs::Regs;

/// Handler invoked when a probed function returns.
pub trait ReturnHandler: Send + Sync {
    /// Runs on the trampoline with `regs.retval()` holding the probed
    /// function's return value.
    fn on_return(&self, regs: &mut Regs);
}

/// One return-probe registration.
pub struct ReturnProbe {
    pub(crate) id: u64,
    handler: Arc<dyn ReturnHandler>,
    /// Cleared at unregistration. Captured instances still unwind the
    /// return chain; only the handler invocation is skipped.
    enabled: AtomicBool,
}

impl ReturnProbe {
    pub(crate) fn new(id: u64, handler: Arc<dyn ReturnHandler>) -> Self {
        Self {
            id,
            handler,
            enabled: AtomicBool::new(true),
        }
    }

    pub(crate) fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub(crate) fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }
}

/// A captured return address awaiting the matching return.
pub(crate) struct RetInstance {
    pub task: u64,
    pub ret_addr: u32,
    pub rp: Arc<ReturnProbe>,
}

/// Bucket count of the instance table; must be a power of two.
const RET_BUCKETS: usize = 64;

/// Lock `m` guaranteeing room for one more element. Growing the backing
/// storage happens only while the lock is released; the swapped-out
/// buffer is likewise freed unlocked.
fn lock_for_push<T>(m: &Mutex<Vec<T>>) -> spin::MutexGuard<'_, Vec<T>> {
    loop {
        let guard = m.lock();
        if guard.len() < guard.capacity() {
            return guard;
        }
        let want = (guard.capacity() * 2).max(8);
        drop(guard);
        let mut spare = Vec::with_capacity(want);
        let mut guard = m.lock();
        if guard.len() < spare.capacity() {
            // No allocation: spare has room for every element.
            spare.append(&mut *guard);
            core::mem::swap(&mut *guard, &mut spare);
        }
        drop(guard);
        drop(spare);
    }
}

/// Task-keyed instance lists. Instances for one task retire in strict
/// LIFO order relative to the real call stack; the newest instance sits
/// at the tail of its bucket's vector.
pub(crate) struct InstanceTable {
    buckets: [Mutex<Vec<RetInstance>>; RET_BUCKETS],
}

impl InstanceTable {
    pub(crate) const fn new() -> Self {
        Self {
            buckets: [const { Mutex::new(Vec::new()) }; RET_BUCKETS],
        }
    }

    fn bucket(&self, task: u64) -> &Mutex<Vec<RetInstance>> {
        &self.buckets[task as usize & (RET_BUCKETS - 1)]
    }

    pub(crate) fn push(&self, inst: RetInstance) {
        let mut guard = lock_for_push(self.bucket(inst.task));
        guard.push(inst);
    }

    /// Total captured instances across all tasks.
    pub(crate) fn pending(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().len()).sum()
    }

    /// Trampoline dispatch for `task`: walk newest-first, invoke
    /// handlers, detach every visited instance, and return the first
    /// captured address that is not the trampoline itself.
    ///
    /// Panics if the walk exhausts the task's instances without finding
    /// a real address: the return-address chain is corrupted and no
    /// safe resumption target exists.
    pub(crate) fn retire(&self, task: u64, trampoline: u32, regs: &mut Regs) -> u32 {
        let mut reclaimed: Vec<RetInstance> = Vec::new();
        let mut real = None;

        {
            // Size the side buffer with the lock released; the walk
            // itself must not touch the allocator.
            let mut bucket = self.bucket(task).lock();
            loop {
                let need = bucket.len();
                if reclaimed.capacity() >= need {
                    break;
                }
                drop(bucket);
                reclaimed.reserve(need);
                bucket = self.bucket(task).lock();
            }
            let mut i = bucket.len();
            while i > 0 {
                i -= 1;
                if bucket[i].task != task {
                    // Another task hashed into this bucket; not ours.
                    continue;
                }
                let inst = bucket.remove(i);
                if inst.rp.enabled() {
                    inst.rp.handler.on_return(regs);
                }
                let ra = inst.ret_addr;
                reclaimed.push(inst);
                if ra != trampoline {
                    real = Some(ra);
                    break;
                }
            }
        }

        // Deferred deallocation: the lock is gone before instances drop.
        drop(reclaimed);

        match real {
            Some(ra) => {
                log::trace!("retprobe: task {} resumes at {:#x}", task, ra);
                ra
            }
            None => panic!(
                "return probe: instance chain for task {} holds no real return address",
                task
            ),
        }
    }
}
