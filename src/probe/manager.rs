//! Probe registry: registration, arming, and teardown.
//!
//! One `ProbeManager` owns the set of registered probes for a target.
//! Registration validates the address, reads and classifies the
//! original instruction, prepares an out-of-line copy when one is
//! needed, and only then patches the breakpoint in. Teardown restores
//! the original bytes under the global barrier before any resources
//! are released, so no context can trap on a breakpoint whose probe is
//! already gone.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::error::{ProbeError, Result};
use crate::insn::{self, Decoded, InsnMode};
use crate::ops::ProbeOps;
use crate::patch::CodePatch;
use crate::probe::retprobe::{InstanceTable, ReturnHandler, ReturnProbe};
use crate::probe::{DecodedAction, Probe, ProbeHandle, ProbeHandlers, ProbeKind, ReturnProbeHandle};

/// Registry and lifecycle manager for one probed target.
pub struct ProbeManager<O: ProbeOps> {
    pub(crate) ops: O,
    /// Registered probes keyed by untagged address.
    probes: Mutex<BTreeMap<u32, Arc<Probe>>>,
    /// Captured return-probe instances, keyed by task.
    pub(crate) instances: InstanceTable,
    next_ret_id: AtomicU64,
}

impl<O: ProbeOps> ProbeManager<O> {
    pub fn new(ops: O) -> Self {
        Self {
            ops,
            probes: Mutex::new(BTreeMap::new()),
            instances: InstanceTable::new(),
            next_ret_id: AtomicU64::new(1),
        }
    }

    /// The host services this manager patches through.
    pub fn ops(&self) -> &O {
        &self.ops
    }

    /// Register a probe with user handlers at a tagged address.
    ///
    /// Bit 0 of `addr` selects the half (compressed) encoding and is
    /// stripped before use.
    pub fn register_probe(
        &self,
        addr: u32,
        handlers: Arc<dyn ProbeHandlers>,
    ) -> Result<ProbeHandle> {
        self.insert_and_arm(addr, ProbeKind::User(handlers))
    }

    /// Remove a probe, restore the original instruction, and release
    /// its slot.
    pub fn unregister_probe(&self, handle: ProbeHandle) -> Result<()> {
        let key = handle.0 & !1;
        let probe = self
            .probes
            .lock()
            .remove(&key)
            .ok_or(ProbeError::NotRegistered)?;
        self.disarm_and_release(&probe);
        Ok(())
    }

    /// Register a return probe on the function entry at `addr`.
    ///
    /// Several return probes may share one function; they attach to the
    /// same underlying entry probe and each fires on every return.
    pub fn register_return_probe(
        &self,
        addr: u32,
        handler: Arc<dyn ReturnHandler>,
    ) -> Result<ReturnProbeHandle> {
        let key = addr & !1;
        let id = self.next_ret_id.fetch_add(1, Ordering::Relaxed);
        let rp = Arc::new(ReturnProbe::new(id, handler));

        {
            let map = self.probes.lock();
            if let Some(probe) = map.get(&key) {
                match &probe.kind {
                    ProbeKind::Return(list) => {
                        list.lock().push(rp);
                        return Ok(ReturnProbeHandle { addr, id });
                    }
                    // The address is held by a plain or substitute
                    // probe; return probes cannot share it.
                    _ => return Err(ProbeError::AlreadyRegistered),
                }
            }
        }

        self.insert_and_arm(addr, ProbeKind::Return(Mutex::new(vec![rp])))?;
        Ok(ReturnProbeHandle { addr, id })
    }

    /// Detach one return-probe registration. Instances already captured
    /// for it still unwind the return chain, but its handler no longer
    /// fires. The underlying entry probe is torn down once the last
    /// registration on the function is gone.
    pub fn unregister_return_probe(&self, handle: ReturnProbeHandle) -> Result<()> {
        let key = handle.addr & !1;
        // The map lock is held from observing the list become empty
        // through removing the entry, so a concurrent registration on
        // the same function either attaches before the removal decision
        // or finds the address free and creates a fresh entry probe.
        let removed = {
            let mut map = self.probes.lock();
            let now_empty = {
                let probe = map.get(&key).ok_or(ProbeError::NotRegistered)?;
                let ProbeKind::Return(list) = &probe.kind else {
                    return Err(ProbeError::NotRegistered);
                };
                let mut list = list.lock();
                let pos = list
                    .iter()
                    .position(|rp| rp.id == handle.id)
                    .ok_or(ProbeError::NotRegistered)?;
                let rp = list.remove(pos);
                rp.disable();
                list.is_empty()
            };
            if now_empty { map.remove(&key) } else { None }
        };
        if let Some(probe) = removed {
            // Disarm outside the lock, as everywhere else.
            self.disarm_and_release(&probe);
        }
        Ok(())
    }

    /// Register a call substitution: hits on `addr` divert execution to
    /// the replacement function at `target` (tagged address).
    pub fn register_substitute(&self, addr: u32, target: u32) -> Result<ProbeHandle> {
        self.insert_and_arm(addr, ProbeKind::Substitute { target })
    }

    /// Completed dispatches of the probe behind `handle`.
    pub fn probe_hits(&self, handle: ProbeHandle) -> Result<u64> {
        let map = self.probes.lock();
        let probe = map.get(&(handle.0 & !1)).ok_or(ProbeError::NotRegistered)?;
        Ok(probe.hits())
    }

    /// Hits the probe behind `handle` could not fully dispatch.
    pub fn probe_missed(&self, handle: ProbeHandle) -> Result<u64> {
        let map = self.probes.lock();
        let probe = map.get(&(handle.0 & !1)).ok_or(ProbeError::NotRegistered)?;
        Ok(probe.missed())
    }

    /// Snapshot of all registered probes: address, encoding mode, hit
    /// and missed counts.
    pub fn list_probes(&self) -> Vec<(u32, InsnMode, u64, u64)> {
        self.probes
            .lock()
            .values()
            .map(|p| (p.addr(), p.mode(), p.hits(), p.missed()))
            .collect()
    }

    /// Number of registered probes.
    pub fn registered_count(&self) -> usize {
        self.probes.lock().len()
    }

    /// Return-probe instances captured but not yet retired.
    pub fn pending_return_instances(&self) -> usize {
        self.instances.pending()
    }

    /// Resolve the probe covering a trap at `pc`. Registration stores
    /// the untagged address, so both the tagged and untagged aliases hit
    /// the same entry; the trap's encoding state must still agree with
    /// the probe's mode, otherwise the trap is someone else's.
    pub(crate) fn lookup(&self, pc: u32, half: bool) -> Option<Arc<Probe>> {
        let probe = self.probes.lock().get(&(pc & !1))?.clone();
        let mode_matches = match probe.mode() {
            InsnMode::Word => !half,
            InsnMode::Half => half,
        };
        mode_matches.then_some(probe)
    }

    fn insert_and_arm(&self, tagged: u32, kind: ProbeKind) -> Result<ProbeHandle> {
        let key = tagged & !1;
        if self.probes.lock().contains_key(&key) {
            return Err(ProbeError::AlreadyRegistered);
        }

        let probe = Arc::new(self.prepare(tagged, kind)?);
        {
            let mut map = self.probes.lock();
            if map.contains_key(&key) {
                // Lost a registration race while preparing.
                if let Some(slot) = probe.action.slot() {
                    self.ops.free_insn_slot(slot);
                }
                return Err(ProbeError::AlreadyRegistered);
            }
            map.insert(key, probe.clone());
        }

        // Arm with the registry lock released. The stop-all barrier has
        // to wait for every other context to quiesce, and a context
        // mid-trap needs the registry to finish its dispatch first; the
        // unarmed entry is inert until the breakpoint lands.
        let patch = CodePatch::new(&self.ops);
        if patch.arm(&probe).is_err() {
            self.probes.lock().remove(&key);
            if let Some(slot) = probe.action.slot() {
                self.ops.free_insn_slot(slot);
            }
            return Err(ProbeError::InvalidTarget);
        }

        log::info!(
            "probe: armed {:?}-mode probe at {:#x}",
            probe.mode(),
            key
        );
        Ok(ProbeHandle(tagged))
    }

    /// Validate, read, and classify the target; build the unarmed probe.
    fn prepare(&self, tagged: u32, kind: ProbeKind) -> Result<Probe> {
        let mode = if tagged & 1 != 0 {
            InsnMode::Half
        } else {
            InsnMode::Word
        };
        let addr = tagged & !1;
        let align = match mode {
            InsnMode::Word => 4,
            InsnMode::Half => 2,
        };
        if addr % align != 0 {
            return Err(ProbeError::Misaligned);
        }
        if self.ops.in_exception_text(addr) || addr == self.ops.trampoline_addr() {
            return Err(ProbeError::InvalidTarget);
        }

        let mut saved = [0u8; 4];
        let insn = match mode {
            InsnMode::Word => {
                self.ops
                    .read_bytes(addr, &mut saved)
                    .map_err(|_| ProbeError::InvalidTarget)?;
                u32::from_le_bytes(saved)
            }
            InsnMode::Half => {
                self.ops
                    .read_bytes(addr, &mut saved[..2])
                    .map_err(|_| ProbeError::InvalidTarget)?;
                let hw1 = u16::from_le_bytes([saved[0], saved[1]]);
                if insn::wide_half(hw1) {
                    self.ops
                        .read_bytes(addr + 2, &mut saved[2..])
                        .map_err(|_| ProbeError::InvalidTarget)?;
                    let hw2 = u16::from_le_bytes([saved[2], saved[3]]);
                    ((hw1 as u32) << 16) | hw2 as u32
                } else {
                    hw1 as u32
                }
            }
        };
        let len = insn::insn_len(mode, insn);

        let action = match insn::classify(insn, mode) {
            Decoded::Reject => {
                log::debug!("probe: unprobeable encoding {:#x} at {:#x}", insn, addr);
                return Err(ProbeError::InvalidTarget);
            }
            Decoded::Simulate { exec, cond } => DecodedAction::Simulated { exec, cond },
            Decoded::Slot { exec, cond } => {
                let slot = self.ops.alloc_insn_slot().ok_or(ProbeError::OutOfSlots)?;
                if self.ops.write_bytes(slot, &saved[..len]).is_err() {
                    self.ops.free_insn_slot(slot);
                    return Err(ProbeError::InvalidTarget);
                }
                self.ops.flush_icache(slot, len);
                DecodedAction::Relocated { slot, exec, cond }
            }
        };

        Ok(Probe::new(addr, mode, len, saved, action, kind))
    }

    fn disarm_and_release(&self, probe: &Probe) {
        let patch = CodePatch::new(&self.ops);
        if patch.disarm(probe).is_err() {
            // The breakpoint stays in place; leak the slot rather than
            // hand out a slot a live breakpoint still steps into.
            log::error!(
                "probe: failed to restore original bytes at {:#x}",
                probe.addr()
            );
            return;
        }
        if let Some(slot) = probe.action.slot() {
            self.ops.free_insn_slot(slot);
        }
        log::info!("probe: unregistered probe at {:#x}", probe.addr());
    }
}
