//! Per-address synchronization-object state.
//!
//! A sync object is keyed by the address of the user's mutex, channel, wait
//! group, or once cell. Records are created on the first event that targets
//! an address and live until process exit. Each record is guarded by its own
//! lock; event handlers hold it for O(active-threads) clock work and nothing
//! else.
//!
//! The table does not police pairing: it updates clocks on whatever events
//! the instrumentation delivers. Mis-paired lock/unlock is the user program's
//! bug to find with a different tool.


use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::clock::VectorClock;

/// What kind of object an address is currently used as.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum SyncKind {
    /// Exclusive and shared mutexes. The hook set cannot tell them apart
    /// until a release-merge arrives, so both share one record shape.
    Mutex,
    Channel,
    WaitGroup,
    Once,
}

/// Clock state carried by one sync object.
pub(crate) enum SyncState {
    Mutex {
        /// Pointwise ≥ the clock of every release (and, for shared mutexes,
        /// every reader release-merge) performed on this object.
        release: VectorClock,
        /// Union of reader releases only. Bookkeeping for shared mutexes.
        read_release: VectorClock,
        locked: bool,
    },
    Channel {
        /// Joined by every send; receivers acquire it.
        send: VectorClock,
        /// Union of receiver clocks. Bookkeeping.
        recv: VectorClock,
        /// Set at close; receivers that observe the closed state acquire it.
        close: VectorClock,
        closed: bool,
        /// Messages sent so far. Diagnostics and future stricter matching;
        /// the baseline joins all prior sends into every recv.
        seq: u64,
    },
    WaitGroup {
        /// Union of the clock of every `Done`.
        done: VectorClock,
        /// Mirrors the user-visible counter. Diagnostics only.
        count: i64,
    },
    Once {
        completion: VectorClock,
        done: bool,
    },
}

impl SyncState {
    fn new(kind: SyncKind) -> Self {
        match kind {
            SyncKind::Mutex => SyncState::Mutex {
                release: VectorClock::new(),
                read_release: VectorClock::new(),
                locked: false,
            },
            SyncKind::Channel => SyncState::Channel {
                send: VectorClock::new(),
                recv: VectorClock::new(),
                close: VectorClock::new(),
                closed: false,
                seq: 0,
            },
            SyncKind::WaitGroup => SyncState::WaitGroup {
                done: VectorClock::new(),
                count: 0,
            },
            SyncKind::Once => SyncState::Once {
                completion: VectorClock::new(),
                done: false,
            },
        }
    }

    pub(crate) fn kind(&self) -> SyncKind {
        match self {
            SyncState::Mutex { .. } => SyncKind::Mutex,
            SyncState::Channel { .. } => SyncKind::Channel,
            SyncState::WaitGroup { .. } => SyncKind::WaitGroup,
            SyncState::Once { .. } => SyncKind::Once,
        }
    }

    // The event operations below run under the owning SyncVar's lock. The
    // caller has already advanced the thread's own clock for release-style
    // events. A kind mismatch is impossible through SyncTable::var; the
    // defensive arms are no-ops because the detector never aborts.

    pub(crate) fn acquire(&mut self, vc: &mut VectorClock) {
        if let SyncState::Mutex { release, locked, .. } = self {
            vc.join(release);
            *locked = true;
        }
    }

    pub(crate) fn release(&mut self, vc: &VectorClock) {
        if let SyncState::Mutex { release, locked, .. } = self {
            release.copy_from(vc);
            *locked = false;
        }
    }

    pub(crate) fn release_merge(&mut self, vc: &VectorClock) {
        if let SyncState::Mutex { release, read_release, .. } = self {
            release.join(vc);
            read_release.join(vc);
        }
    }

    pub(crate) fn chan_send(&mut self, vc: &VectorClock) {
        if let SyncState::Channel { send, seq, .. } = self {
            *seq += 1;
            send.join(vc);
        }
    }

    pub(crate) fn chan_recv(&mut self, vc: &mut VectorClock, observed_close: bool) {
        if let SyncState::Channel { send, recv, close, .. } = self {
            vc.join(send);
            if observed_close {
                vc.join(close);
            }
            recv.join(vc);
        }
    }

    pub(crate) fn chan_close(&mut self, vc: &VectorClock) {
        if let SyncState::Channel { send, close, closed, .. } = self {
            if *closed {
                // Closing twice is the program's bug, not ours; the clocks
                // stay as the first close left them.
                return;
            }
            *closed = true;
            close.join(vc);
            // A recv that drains after close must still see the closer's
            // writes even if it does not observe the closed state.
            send.join(vc);
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        matches!(self, SyncState::Channel { closed: true, .. })
    }

    pub(crate) fn wg_add(&mut self, delta: i64) {
        if let SyncState::WaitGroup { count, .. } = self {
            *count += delta;
        }
    }

    pub(crate) fn wg_done(&mut self, vc: &VectorClock) {
        if let SyncState::WaitGroup { done, count } = self {
            *count -= 1;
            done.join(vc);
        }
    }

    pub(crate) fn wg_wait(&mut self, vc: &mut VectorClock) {
        if let SyncState::WaitGroup { done, .. } = self {
            vc.join(done);
        }
    }

    pub(crate) fn once_done(&mut self, vc: &VectorClock) {
        if let SyncState::Once { completion, done } = self {
            *done = true;
            completion.join(vc);
        }
    }

    pub(crate) fn once_wait(&mut self, vc: &mut VectorClock) {
        if let SyncState::Once { completion, .. } = self {
            vc.join(completion);
        }
    }
}

pub(crate) struct SyncVar {
    pub(crate) state: Mutex<SyncState>,
}

/// Concurrent map from object address to its sync record.
pub struct SyncTable {
    vars: DashMap<usize, Arc<SyncVar>>,
}

impl Default for SyncTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncTable {
    pub fn new() -> Self {
        SyncTable { vars: DashMap::new() }
    }

    /// Returns the record for `addr`, creating it on first use.
    ///
    /// An address that reappears as a different kind (the program reused the
    /// storage) gets a fresh record: carrying clocks across unrelated objects
    /// could only fabricate happens-before edges.
    pub(crate) fn var(&self, addr: usize, kind: SyncKind) -> Arc<SyncVar> {
        use dashmap::mapref::entry::Entry;
        match self.vars.entry(addr) {
            Entry::Occupied(mut e) => {
                if e.get().state.lock().kind() != kind {
                    e.insert(Arc::new(SyncVar {
                        state: Mutex::new(SyncState::new(kind)),
                    }));
                }
                e.get().clone()
            }
            Entry::Vacant(e) => {
                let var = Arc::new(SyncVar {
                    state: Mutex::new(SyncState::new(kind)),
                });
                e.insert(var.clone());
                var
            }
        }
    }

    /// Number of tracked objects.
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Drops every record. Tests only.
    pub fn clear(&self) {
        self.vars.clear();
    }
}
