//! Deduplicated storage for captured call stacks.
//!
//! Every access hook captures where it came from; storing the frames inline
//! in shadow slots would multiply their footprint, so slots carry a 64-bit
//! hash into this depot instead. Hash collisions are tolerated by contract: a
//! collision can at most attach a misleading stack to a race report. Stacks
//! are never consulted by the race decision itself.


use arrayvec::ArrayVec;
use dashmap::DashMap;

/// Frames kept per captured stack.
pub const MAX_FRAMES: usize = 8;

/// Program counters of one captured stack, innermost first.
pub type Stack = ArrayVec<usize, MAX_FRAMES>;

/// Depot hash meaning "no stack captured".
pub const NO_STACK: u64 = 0;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a over the little-endian bytes of each frame pointer.
fn fnv1a(frames: &[usize]) -> u64 {
    let mut hash = FNV_OFFSET;
    for frame in frames {
        for byte in frame.to_le_bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
    }
    hash
}

/// Hash-keyed store of call stacks. Grows monotonically within a run; only
/// explicit [`clear`][Self::clear] (tests) empties it.
#[derive(Default)]
pub struct StackDepot {
    stacks: DashMap<u64, Stack>,
}

impl StackDepot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Captures the calling stack, stores it if unseen, and returns its hash.
    ///
    /// `skip` innermost frames are dropped so reports start at user code
    /// rather than at the hook machinery. Returns [`NO_STACK`] if nothing
    /// could be captured.
    pub fn capture(&self, skip: usize) -> u64 {
        let mut frames = Stack::new();
        let mut seen = 0usize;
        backtrace::trace(|frame| {
            seen += 1;
            if seen <= skip {
                return true;
            }
            frames.push(frame.ip() as usize);
            !frames.is_full()
        });
        self.intern(frames)
    }

    /// Stores an already-materialized stack and returns its hash.
    pub fn intern(&self, frames: Stack) -> u64 {
        if frames.is_empty() {
            return NO_STACK;
        }
        let mut hash = fnv1a(&frames);
        if hash == NO_STACK {
            // The zero hash is the "no stack" sentinel.
            hash = FNV_OFFSET;
        }
        self.stacks.entry(hash).or_insert(frames);
        hash
    }

    /// Returns the stack stored under `hash`, if any.
    pub fn get(&self, hash: u64) -> Option<Stack> {
        if hash == NO_STACK {
            return None;
        }
        self.stacks.get(&hash).map(|s| s.value().clone())
    }

    pub fn len(&self) -> usize {
        self.stacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }

    /// Drops every stored stack. Tests only.
    pub fn clear(&self) {
        self.stacks.clear();
    }
}
