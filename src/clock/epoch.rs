use std::fmt;

/// Identifier of a live per-thread context, drawn from the bounded pool.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Tid(pub u16);

impl Tid {
    /// The initial thread. Allocated at init, never returned to the pool.
    pub const MAIN: Self = Tid(0);
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One point in one thread's history, packed into a single machine word.
///
/// Layout:
///
/// ```text
/// 63             16 15            0
/// +----------------+---------------+
/// |  clock (48 b)  |   tid (16 b)  |
/// +----------------+---------------+
/// ```
///
/// The all-zero word is reserved: it never names a real access, since every
/// context starts with `vc[tid] = 1`. Shadow slots use it as "empty".
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Epoch(u64);

impl Epoch {
    /// The reserved "uninitialized" epoch.
    pub const ZERO: Self = Epoch(0);

    /// Largest clock value an epoch can carry. Incrementing past this is a
    /// hard fault that disables the detector (§ failure semantics); at one
    /// event per nanosecond it takes over three days per thread to get there.
    pub const MAX_CLOCK: u64 = (1 << 48) - 1;

    #[inline]
    pub fn new(tid: Tid, clock: u64) -> Self {
        debug_assert!(clock <= Self::MAX_CLOCK);
        Epoch(clock << 16 | tid.0 as u64)
    }

    #[inline]
    pub fn tid(self) -> Tid {
        Tid(self.0 as u16)
    }

    #[inline]
    pub fn clock(self) -> u64 {
        self.0 >> 16
    }

    #[inline]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// The raw packed word, as stored in shadow slots.
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Epoch(raw)
    }
}

impl fmt::Debug for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            write!(f, "Epoch(0)")
        } else {
            write!(f, "Epoch({}@{})", self.tid(), self.clock())
        }
    }
}
