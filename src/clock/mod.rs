//! Logical time: packed epochs and sparse vector clocks.


mod epoch;

pub use epoch::*;

/// A thread's view of logical time: the highest clock it has observed from
/// every other thread, keyed by [`Tid`].
///
/// The representation is a vec of `(tid, clock)` pairs sorted by tid, with
/// zero as the default for absent entries. All operations are linear in the
/// number of threads this clock has actually observed, which stays small for
/// programs that do not make every thread talk to every other thread. A dense
/// 65536-entry array would be quadratic in live threads across the whole
/// process and is deliberately avoided.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct VectorClock {
    // Sorted by tid; no entry holds clock 0.
    entries: Vec<(Tid, u64)>,
}

impl VectorClock {
    pub const fn new() -> Self {
        VectorClock { entries: Vec::new() }
    }

    #[inline]
    fn index_of(&self, tid: Tid) -> Result<usize, usize> {
        self.entries.binary_search_by_key(&tid, |&(t, _)| t)
    }

    pub fn get(&self, tid: Tid) -> u64 {
        match self.index_of(tid) {
            Ok(i) => self.entries[i].1,
            Err(_) => 0,
        }
    }

    pub fn set(&mut self, tid: Tid, clock: u64) {
        match self.index_of(tid) {
            Ok(i) => {
                if clock == 0 {
                    self.entries.remove(i);
                } else {
                    self.entries[i].1 = clock;
                }
            }
            Err(i) => {
                if clock != 0 {
                    self.entries.insert(i, (tid, clock));
                }
            }
        }
    }

    /// Adds 1 to the entry for `tid` and returns the new value.
    ///
    /// Callers on the release path must check the returned value against
    /// [`Epoch::MAX_CLOCK`]; overflow is a hard fault, not a wrap.
    #[must_use]
    pub fn inc(&mut self, tid: Tid) -> u64 {
        match self.index_of(tid) {
            Ok(i) => {
                self.entries[i].1 += 1;
                self.entries[i].1
            }
            Err(i) => {
                self.entries.insert(i, (tid, 1));
                1
            }
        }
    }

    /// Pointwise max. Required on every acquire-style event; this is what
    /// closes happens-before under transitivity.
    pub fn join(&mut self, other: &VectorClock) {
        // Both sides are sorted, so this is a linear merge.
        let mut merged = Vec::with_capacity(self.entries.len().max(other.entries.len()));
        let (mut i, mut j) = (0, 0);
        while i < self.entries.len() && j < other.entries.len() {
            let (lt, lc) = self.entries[i];
            let (rt, rc) = other.entries[j];
            if lt < rt {
                merged.push((lt, lc));
                i += 1;
            } else if rt < lt {
                merged.push((rt, rc));
                j += 1;
            } else {
                merged.push((lt, lc.max(rc)));
                i += 1;
                j += 1;
            }
        }
        merged.extend_from_slice(&self.entries[i..]);
        merged.extend_from_slice(&other.entries[j..]);
        self.entries = merged;
    }

    /// Replaces contents with a copy of `other`. Never aliases.
    pub fn copy_from(&mut self, other: &VectorClock) {
        self.entries.clear();
        self.entries.extend_from_slice(&other.entries);
    }

    /// Pointwise ≤.
    pub fn leq(&self, other: &VectorClock) -> bool {
        self.entries.iter().all(|&(t, c)| c <= other.get(t))
    }

    /// Whether the access named by `e` is ordered before everything this
    /// clock has observed: `clock(e) ≤ self[tid(e)]`.
    #[inline]
    pub fn happens_before(&self, e: Epoch) -> bool {
        e.clock() <= self.get(e.tid())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Tid, u64)> + '_ {
        self.entries.iter().copied()
    }
}

impl std::fmt::Debug for VectorClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|&(t, c)| (t.0, c)))
            .finish()
    }
}
