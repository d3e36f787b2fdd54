//! Per-thread contexts, the identifier pool, and context reclamation.


mod pool;
mod sweep;

pub(crate) use sweep::host_tid;

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::clock::{Epoch, Tid, VectorClock};
use crate::engine::Fault;
use pool::TidPool;

/// A background sweep is kicked after this many context allocations.
pub const SWEEP_EVERY: u64 = 1000;

/// How long a published spawn clock waits for its child before expiring.
pub const SPAWN_TTL: Duration = Duration::from_millis(100);

/// Detector-side state of one runtime thread.
///
/// The vector clock is mutated through an `UnsafeCell`: every access to it
/// goes through the thread the context belongs to (hooks run inline on that
/// thread), so the cell is never contended. What other threads may need
/// (the packed epoch, the death flag, the last stack) is mirrored in
/// atomics next to it.
pub struct ThreadCtx {
    tid: Tid,
    host: i32,
    epoch: AtomicU64,
    vc: UnsafeCell<VectorClock>,
    last_stack: AtomicU64,
    dead: AtomicBool,
}

// The UnsafeCell is confined to the owning thread (see above); everything
// else is atomic.
unsafe impl Send for ThreadCtx {}
unsafe impl Sync for ThreadCtx {}

impl ThreadCtx {
    fn new(tid: Tid, host: i32, vc: VectorClock) -> Self {
        let epoch = Epoch::new(tid, vc.get(tid));
        ThreadCtx {
            tid,
            host,
            epoch: AtomicU64::new(epoch.raw()),
            vc: UnsafeCell::new(vc),
            last_stack: AtomicU64::new(0),
            dead: AtomicBool::new(false),
        }
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    /// The thread's current `(tid, vc[tid])`, readable from any thread.
    pub fn epoch(&self) -> Epoch {
        Epoch::from_raw(self.epoch.load(Relaxed))
    }

    /// Only the owning thread may call this.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn vc_mut(&self) -> &mut VectorClock {
        &mut *self.vc.get()
    }

    /// Only the owning thread may call this.
    pub(crate) unsafe fn vc(&self) -> &VectorClock {
        &*self.vc.get()
    }

    /// Re-mirrors the epoch after the owner changed `vc[tid]`.
    pub(crate) fn refresh_epoch(&self) {
        // Owner-only, like vc_mut.
        let clock = unsafe { self.vc() }.get(self.tid);
        self.epoch.store(Epoch::new(self.tid, clock).raw(), Relaxed);
    }

    pub(crate) fn set_last_stack(&self, hash: u64) {
        self.last_stack.store(hash, Relaxed);
    }

    pub(crate) fn last_stack(&self) -> u64 {
        self.last_stack.load(Relaxed)
    }

    /// No further events may target the context once this is set; the sweep
    /// will reclaim it.
    pub(crate) fn mark_dead(&self) {
        self.dead.store(true, Relaxed);
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.dead.load(Relaxed)
    }
}

impl std::fmt::Debug for ThreadCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadCtx")
            .field("tid", &self.tid)
            .field("host", &self.host)
            .field("epoch", &self.epoch())
            .field("dead", &self.is_dead())
            .finish()
    }
}

struct SpawnClock {
    expires: Instant,
    clock: VectorClock,
}

/// Maps host threads to contexts and owns the identifier pool.
pub struct ThreadTable {
    contexts: DashMap<i32, Arc<ThreadCtx>>,
    pool: Mutex<TidPool>,
    spawn_clocks: Mutex<VecDeque<SpawnClock>>,
    allocs: AtomicU64,
    sweep_pending: Mutex<u64>,
    sweep_cv: Condvar,
    generation: AtomicU64,
}

impl Default for ThreadTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadTable {
    pub fn new() -> Self {
        ThreadTable {
            contexts: DashMap::new(),
            pool: Mutex::new(TidPool::new()),
            spawn_clocks: Mutex::new(VecDeque::new()),
            allocs: AtomicU64::new(0),
            sweep_pending: Mutex::new(0),
            sweep_cv: Condvar::new(),
            generation: AtomicU64::new(0),
        }
    }

    /// Bumped on reset so cached context handles revalidate.
    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Relaxed)
    }

    /// Installs the initial thread's context under identifier 0.
    pub(crate) fn init_main(&self, host: i32) -> Arc<ThreadCtx> {
        let mut vc = VectorClock::new();
        vc.set(Tid::MAIN, 1);
        let ctx = Arc::new(ThreadCtx::new(Tid::MAIN, host, vc));
        self.contexts.insert(host, ctx.clone());
        ctx
    }

    pub(crate) fn get(&self, host: i32) -> Option<Arc<ThreadCtx>> {
        self.contexts.get(&host).map(|c| c.value().clone())
    }

    /// The calling thread's context, created on first use.
    ///
    /// A dead context found under this host id belongs to an exited thread
    /// whose kernel id was recycled; it is replaced, not adopted.
    pub(crate) fn current(&self) -> Result<Arc<ThreadCtx>, Fault> {
        let host = host_tid();
        match self.get(host) {
            Some(ctx) if !ctx.is_dead() => Ok(ctx),
            _ => self.create(host),
        }
    }

    /// Creates a context for `host`: allocates an identifier, seeds the
    /// vector clock from a pending spawn clock if one is waiting, and
    /// registers the context.
    pub(crate) fn create(&self, host: i32) -> Result<Arc<ThreadCtx>, Fault> {
        let (tid, base) = self.alloc_tid();

        let mut vc = self.take_spawn_clock().unwrap_or_default();
        // Resume above both the retired holder's final clock and whatever
        // the spawn clock already knew about this identifier.
        let start = base.max(vc.get(tid)) + 1;
        if start > Epoch::MAX_CLOCK {
            return Err(Fault::ClockOverflow(tid));
        }
        vc.set(tid, start);

        let ctx = Arc::new(ThreadCtx::new(tid, host, vc));
        if let Some(stale) = self.contexts.insert(host, ctx.clone()) {
            // The OS reused a thread id whose old context was never swept.
            // Its owner is gone, so its identifier can go back.
            self.pool.lock().free(stale.tid(), stale.epoch().clock());
        }
        Ok(ctx)
    }

    fn alloc_tid(&self) -> (Tid, u64) {
        if let Some(allocated) = self.pool.lock().alloc() {
            let n = self.allocs.fetch_add(1, Relaxed) + 1;
            if n % SWEEP_EVERY == 0 {
                self.kick_sweep();
            }
            return allocated;
        }

        // Exhausted: reclaim synchronously, then retry once.
        warn!("tid pool exhausted; sweeping");
        self.sweep();
        if let Some(allocated) = self.pool.lock().alloc() {
            return allocated;
        }

        // Still nothing. Aliasing the initial thread degrades precision but
        // never stops the program.
        warn!("tid pool still exhausted after sweep; degrading to tid 0");
        (Tid::MAIN, 0)
    }

    /// Deposits a parent's clock snapshot for the next child context.
    pub(crate) fn publish_spawn_clock(&self, snapshot: VectorClock) {
        let mut queue = self.spawn_clocks.lock();
        let now = Instant::now();
        queue.retain(|s| s.expires > now);
        queue.push_back(SpawnClock {
            expires: now + SPAWN_TTL,
            clock: snapshot,
        });
    }

    /// Consumes the most recent unexpired spawn clock, if any.
    fn take_spawn_clock(&self) -> Option<VectorClock> {
        let mut queue = self.spawn_clocks.lock();
        let now = Instant::now();
        queue.retain(|s| s.expires > now);
        queue.pop_back().map(|s| s.clock)
    }

    /// Live contexts, for diagnostics and tests.
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub(crate) fn kick_sweep(&self) {
        *self.sweep_pending.lock() += 1;
        self.sweep_cv.notify_one();
    }

    /// Parks the sweeper thread until the next kick.
    pub(crate) fn wait_for_sweep_kick(&self) {
        let mut pending = self.sweep_pending.lock();
        while *pending == 0 {
            self.sweep_cv.wait(&mut pending);
        }
        *pending = 0;
    }

    /// Drops every context and restores the pool, then installs a fresh
    /// context for the calling thread. Tests only.
    pub(crate) fn reset(&self) -> Arc<ThreadCtx> {
        self.contexts.clear();
        *self.pool.lock() = TidPool::new();
        self.spawn_clocks.lock().clear();
        self.allocs.store(0, Relaxed);
        self.generation.fetch_add(1, Relaxed);
        self.init_main(host_tid())
    }
}
