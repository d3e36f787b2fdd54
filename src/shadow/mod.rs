//! Sparse shadow memory: one bounded access history per monitored byte.
//!
//! The layout is page-granular. A page covers 64 KB of application address
//! space and holds `K` slots per byte, allocated on first touch and never
//! migrated. Lookups are two-level: the upper address bits key a concurrent
//! page map, the lower 16 bits index into the page.
//!
//! Slot words are atomics so the same-epoch fast path (a repeat access by the
//! same thread at the same clock) never takes a lock; every mutation happens
//! under a short stripe lock covering [`STRIPE_CELLS`] neighboring cells.

#[cfg(test)]
mod test;

mod cell;

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering::Relaxed};
use std::sync::Arc;

use arrayvec::ArrayVec;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};

use crate::clock::{Epoch, VectorClock};
use crate::config::HISTORY_MAX;
use crate::engine::Fault;

/// Bytes of application address space covered by one shadow page.
pub const PAGE_SPAN: usize = 1 << 16;

const PAGE_MASK: usize = PAGE_SPAN - 1;

/// Cells sharing one stripe lock. Mutations on a hot cell serialize with at
/// most 15 neighbors, which keeps the lock array at 4096 words per page.
pub(crate) const STRIPE_CELLS: usize = 16;

const FLAG_WRITE: u8 = 1;

// Meta byte per cell: bit 7 marks a cell holding two or more reads, the low
// nibble is the index of the current write slot (0xF when none).
const META_READ_SHARED: u8 = 0x80;
const META_NO_WRITE: u8 = 0x0f;

/// One recorded access: packed epoch, stack-depot hash, and a write flag.
/// Epoch zero means the slot is empty.
#[derive(Default)]
pub(crate) struct Slot {
    epoch: AtomicU64,
    stack: AtomicU64,
    flags: AtomicU8,
}

impl Slot {
    fn clear(&self) {
        self.epoch.store(0, Relaxed);
        self.stack.store(0, Relaxed);
        self.flags.store(0, Relaxed);
    }

    fn fill(&self, epoch: Epoch, is_write: bool, stack: u64) {
        self.stack.store(stack, Relaxed);
        self.flags.store(if is_write { FLAG_WRITE } else { 0 }, Relaxed);
        self.epoch.store(epoch.raw(), Relaxed);
    }
}

/// A previously recorded access that the current one races with.
#[derive(Clone, Copy, Debug)]
pub struct PrevAccess {
    pub epoch: Epoch,
    pub is_write: bool,
    pub stack: u64,
}

/// Races found by one access check. A single scan reports at most one race
/// per slot, so the history bound also bounds this.
pub type RaceBuf = ArrayVec<PrevAccess, HISTORY_MAX>;

struct Page {
    k: usize,
    slots: Box<[Slot]>,
    meta: Box<[AtomicU8]>,
    locks: Box<[Mutex<()>]>,
}

impl Page {
    fn try_new(k: usize) -> Result<Self, Fault> {
        // The slot array is the big allocation (megabytes per page); failing
        // it must disable the detector, not abort the user program.
        fn try_alloc<T: Default>(n: usize) -> Result<Box<[T]>, Fault> {
            let mut v = Vec::new();
            v.try_reserve_exact(n).map_err(|_| Fault::ShadowAlloc)?;
            v.resize_with(n, T::default);
            Ok(v.into_boxed_slice())
        }
        Ok(Page {
            k,
            slots: try_alloc(PAGE_SPAN * k)?,
            meta: try_alloc(PAGE_SPAN)?,
            locks: {
                let mut v = Vec::new();
                v.try_reserve_exact(PAGE_SPAN / STRIPE_CELLS)
                    .map_err(|_| Fault::ShadowAlloc)?;
                v.resize_with(PAGE_SPAN / STRIPE_CELLS, || Mutex::new(()));
                v.into_boxed_slice()
            },
        })
    }

    #[inline]
    fn cell(&self, index: usize) -> &[Slot] {
        &self.slots[index * self.k..(index + 1) * self.k]
    }

    #[inline]
    fn lock(&self, index: usize) -> MutexGuard<'_, ()> {
        self.locks[index / STRIPE_CELLS].lock()
    }

    /// Lock-free repeat check: the hottest path is the same thread touching
    /// the same byte again within the same epoch.
    ///
    /// A concurrent mutation can tear the epoch/flag pair, but epochs only
    /// ever hold values that were genuinely recorded for this cell, and a
    /// same-epoch slot being overwritten concurrently means the conflicting
    /// access was already checked against this thread's record at this very
    /// epoch. A spurious hit therefore never hides an unchecked conflict.
    #[inline]
    fn same_epoch_hit(&self, index: usize, epoch: Epoch, is_write: bool) -> bool {
        for slot in self.cell(index) {
            if slot.epoch.load(Relaxed) == epoch.raw() {
                // Any same-epoch record subsumes a read; a write needs the
                // write flag already set.
                return !is_write || slot.flags.load(Relaxed) & FLAG_WRITE != 0;
            }
        }
        false
    }
}

/// The process-wide shadow: a concurrent map of lazily allocated pages.
pub struct ShadowMemory {
    k: usize,
    pages: DashMap<usize, Arc<Page>>,
}

impl ShadowMemory {
    /// `history_size` is the per-cell slot count `K`, validated by config.
    pub fn new(history_size: usize) -> Self {
        ShadowMemory {
            k: history_size,
            pages: DashMap::new(),
        }
    }

    fn page(&self, addr: usize) -> Result<Arc<Page>, Fault> {
        let key = addr / PAGE_SPAN;
        if let Some(page) = self.pages.get(&key) {
            return Ok(page.value().clone());
        }
        use dashmap::mapref::entry::Entry;
        match self.pages.entry(key) {
            Entry::Occupied(e) => Ok(e.get().clone()),
            Entry::Vacant(e) => {
                let page = Arc::new(Page::try_new(self.k)?);
                e.insert(page.clone());
                Ok(page)
            }
        }
    }

    /// Runs the access state machine for one byte. Any races found against
    /// recorded accesses are pushed into `races`; the caller emits them after
    /// this returns, off the stripe lock.
    pub fn check_access(
        &self,
        addr: usize,
        vc: &VectorClock,
        epoch: Epoch,
        is_write: bool,
        stack: u64,
        races: &mut RaceBuf,
    ) -> Result<(), Fault> {
        let page = self.page(addr)?;
        let index = addr & PAGE_MASK;

        if page.same_epoch_hit(index, epoch, is_write) {
            return Ok(());
        }

        let guard = page.lock(index);
        cell::apply(
            page.cell(index),
            &page.meta[index],
            vc,
            epoch,
            is_write,
            stack,
            races,
        );
        drop(guard);
        Ok(())
    }

    /// Number of pages touched so far.
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Drops all shadow state. Tests only.
    pub fn clear(&self) {
        self.pages.clear();
    }

    /// Snapshot of one cell's live slots, oldest first. Tests only.
    #[cfg(test)]
    pub(crate) fn cell_snapshot(&self, addr: usize) -> Vec<PrevAccess> {
        let Some(page) = self.pages.get(&(addr / PAGE_SPAN)) else {
            return Vec::new();
        };
        let index = addr & PAGE_MASK;
        let _guard = page.lock(index);
        page.cell(index)
            .iter()
            .filter_map(|slot| {
                let epoch = Epoch::from_raw(slot.epoch.load(Relaxed));
                (!epoch.is_zero()).then(|| PrevAccess {
                    epoch,
                    is_write: slot.flags.load(Relaxed) & FLAG_WRITE != 0,
                    stack: slot.stack.load(Relaxed),
                })
            })
            .collect()
    }
}
