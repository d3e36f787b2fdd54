//! The per-cell access state machine.
//!
//! Everything here runs under the cell's stripe lock; slot atomics are
//! accessed relaxed. Slot order is age order: occupied slots form a prefix,
//! new records go to the back, eviction shifts the survivors left.

use std::sync::atomic::{AtomicU8, Ordering::Relaxed};

use arrayvec::ArrayVec;

use super::{PrevAccess, RaceBuf, Slot, FLAG_WRITE, META_NO_WRITE, META_READ_SHARED};
use crate::clock::{Epoch, VectorClock};
use crate::config::HISTORY_MAX;

fn load(slot: &Slot) -> Option<PrevAccess> {
    let epoch = Epoch::from_raw(slot.epoch.load(Relaxed));
    (!epoch.is_zero()).then(|| PrevAccess {
        epoch,
        is_write: slot.flags.load(Relaxed) & FLAG_WRITE != 0,
        stack: slot.stack.load(Relaxed),
    })
}

// Recomputed after every mutation: low nibble is the write slot index (0xF
// when none), bit 7 flags two or more reads.
fn refresh_meta(slots: &[Slot], meta: &AtomicU8) {
    let mut write_idx = META_NO_WRITE;
    let mut reads = 0u8;
    for (i, slot) in slots.iter().enumerate() {
        let Some(prev) = load(slot) else { continue };
        if prev.is_write {
            if write_idx == META_NO_WRITE {
                write_idx = i as u8;
            }
        } else {
            reads += 1;
        }
    }
    let shared = if reads >= 2 { META_READ_SHARED } else { 0 };
    meta.store(shared | write_idx, Relaxed);
}

fn remove_and_shift(slots: &[Slot], index: usize) {
    for i in index..slots.len() - 1 {
        let next = &slots[i + 1];
        slots[i].stack.store(next.stack.load(Relaxed), Relaxed);
        slots[i].flags.store(next.flags.load(Relaxed), Relaxed);
        slots[i].epoch.store(next.epoch.load(Relaxed), Relaxed);
    }
    slots[slots.len() - 1].clear();
}

fn first_empty(slots: &[Slot]) -> Option<usize> {
    slots.iter().position(|s| s.epoch.load(Relaxed) == 0)
}

/// Applies one access to one cell, pushing any races found into `races`.
pub(super) fn apply(
    slots: &[Slot],
    meta: &AtomicU8,
    vc: &VectorClock,
    epoch: Epoch,
    is_write: bool,
    stack: u64,
    races: &mut RaceBuf,
) {
    let tid = epoch.tid();
    let mut saw_reads = false;

    for slot in slots {
        let Some(prev) = load(slot) else { continue };

        if prev.epoch.tid() == tid {
            // This thread touched this byte before: fold into its slot. The
            // prior record was already checked against every other slot when
            // it was made.
            slot.stack.store(stack, Relaxed);
            if is_write && !prev.is_write {
                slot.flags.store(FLAG_WRITE, Relaxed);
            }
            slot.epoch.store(epoch.raw(), Relaxed);
            refresh_meta(slots, meta);
            return;
        }

        match (is_write, prev.is_write) {
            (true, true) => {
                if !vc.happens_before(prev.epoch) {
                    races.push(prev);
                }
                // The newer write supersedes the recorded one either way.
                slot.fill(epoch, true, stack);
                refresh_meta(slots, meta);
                return;
            }
            (true, false) => {
                if !vc.happens_before(prev.epoch) {
                    races.push(prev);
                }
                // Keep scanning: a write must be checked against every
                // concurrent read before it takes over the cell.
                saw_reads = true;
            }
            (false, true) => {
                if !vc.happens_before(prev.epoch) {
                    races.push(prev);
                }
                append_read(slots, meta, vc, epoch, stack);
                return;
            }
            (false, false) => {}
        }
    }

    if is_write && saw_reads {
        compact_for_write(slots, meta, vc, epoch, stack);
        return;
    }

    insert(slots, meta, vc, epoch, is_write, stack);
}

/// Records a read next to an existing write record.
fn append_read(slots: &[Slot], meta: &AtomicU8, vc: &VectorClock, epoch: Epoch, stack: u64) {
    let index = match first_empty(slots) {
        Some(i) => i,
        None => {
            // Prefer a read the current access already subsumes; otherwise
            // the oldest read. Writes are never evicted for a read; in the
            // degenerate all-write cell the read goes unrecorded.
            let victim = slots
                .iter()
                .position(|s| {
                    load(s).is_some_and(|p| !p.is_write && vc.happens_before(p.epoch))
                })
                .or_else(|| slots.iter().position(|s| load(s).is_some_and(|p| !p.is_write)));
            let Some(victim) = victim else { return };
            remove_and_shift(slots, victim);
            slots.len() - 1
        }
    };
    slots[index].fill(epoch, false, stack);
    refresh_meta(slots, meta);
}

/// A write that scanned past read records takes over the cell: it becomes the
/// sole write slot, and reads it raced with are dropped (they have been
/// reported; future conflicts will be caught against this write). Reads
/// ordered before the write are kept.
fn compact_for_write(slots: &[Slot], meta: &AtomicU8, vc: &VectorClock, epoch: Epoch, stack: u64) {
    let mut kept: ArrayVec<PrevAccess, HISTORY_MAX> = ArrayVec::new();
    for slot in slots {
        let Some(prev) = load(slot) else { continue };
        if !prev.is_write && vc.happens_before(prev.epoch) {
            kept.push(prev);
        }
    }
    // Oldest kept reads fall off first if the write needs the room.
    while kept.len() > slots.len() - 1 {
        kept.remove(0);
    }

    slots[0].fill(epoch, true, stack);
    for (i, prev) in kept.iter().enumerate() {
        slots[i + 1].fill(prev.epoch, false, prev.stack);
    }
    for slot in &slots[1 + kept.len()..] {
        slot.clear();
    }
    refresh_meta(slots, meta);
}

/// No slot matched during the scan: record the access fresh.
fn insert(
    slots: &[Slot],
    meta: &AtomicU8,
    vc: &VectorClock,
    epoch: Epoch,
    is_write: bool,
    stack: u64,
) {
    let index = match first_empty(slots) {
        Some(i) => i,
        None => {
            let victim = slots
                .iter()
                .position(|s| load(s).is_some_and(|p| vc.happens_before(p.epoch)))
                .or_else(|| slots.iter().position(|s| load(s).is_some_and(|p| !p.is_write)));
            let Some(victim) = victim else { return };
            remove_and_shift(slots, victim);
            slots.len() - 1
        }
    };
    slots[index].fill(epoch, is_write, stack);
    refresh_meta(slots, meta);
}
