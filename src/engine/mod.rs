//! The happens-before engine: every instrumentation event lands here.
//!
//! The engine owns the shadow, the sync-object table, the thread table and
//! the stack depot, and wires them to a [`Reporter`] chosen at construction.
//! Event handlers are non-blocking, touch at most one sync object or one
//! shadow stripe, and never call the reporter while holding either lock.


use std::sync::atomic::{AtomicBool, AtomicU64, Ordering::Relaxed};
use std::sync::Arc;

use dashmap::DashSet;
use thiserror::Error;
use tracing::error;

use crate::clock::{Epoch, Tid};
use crate::config::Opts;
use crate::depot::StackDepot;
use crate::report::{Access, RaceKind, RaceRecord, Reporter};
use crate::shadow::{PrevAccess, RaceBuf, ShadowMemory};
use crate::sync::{SyncKind, SyncTable};
use crate::thread::{ThreadCtx, ThreadTable};

/// Internal invariant violations. Any of these disables the detector; none
/// of them ever aborts the user program.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum Fault {
    /// A thread ran past 2^48 - 1 logical clock ticks.
    #[error("logical clock overflow on thread {0}")]
    ClockOverflow(Tid),

    /// A shadow page could not be allocated.
    #[error("shadow memory allocation failed")]
    ShadowAlloc,
}

/// The detector core, parameterized by the reporter at construction so race
/// emission costs no dynamic dispatch.
pub struct Engine<R: Reporter> {
    opts: Opts,
    reporter: R,
    shadow: ShadowMemory,
    sync: SyncTable,
    threads: Arc<ThreadTable>,
    depot: StackDepot,
    enabled: AtomicBool,
    races: AtomicU64,
    // One report per (addr, kind, previous tid, current tid): a hot racy
    // pair would otherwise flood the log on every iteration.
    reported: DashSet<(usize, RaceKind, u16, u16)>,
}

impl<R: Reporter> Engine<R> {
    pub fn new(opts: Opts, reporter: R) -> Self {
        Engine {
            shadow: ShadowMemory::new(opts.history_size),
            opts,
            reporter,
            sync: SyncTable::new(),
            threads: Arc::new(ThreadTable::new()),
            depot: StackDepot::new(),
            enabled: AtomicBool::new(true),
            races: AtomicU64::new(0),
            reported: DashSet::new(),
        }
    }

    pub fn opts(&self) -> &Opts {
        &self.opts
    }

    pub fn reporter(&self) -> &R {
        &self.reporter
    }

    pub fn threads(&self) -> &ThreadTable {
        &self.threads
    }

    pub(crate) fn threads_shared(&self) -> Arc<ThreadTable> {
        self.threads.clone()
    }

    pub fn depot(&self) -> &StackDepot {
        &self.depot
    }

    #[cfg(test)]
    pub(crate) fn shadow(&self) -> &ShadowMemory {
        &self.shadow
    }

    #[inline]
    pub fn enabled(&self) -> bool {
        self.enabled.load(Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Relaxed);
    }

    pub fn races_detected(&self) -> u64 {
        self.races.load(Relaxed)
    }

    /// The calling thread's context. `None` only after the engine disabled
    /// itself while creating one.
    pub fn current(&self) -> Option<Arc<ThreadCtx>> {
        match self.threads.current() {
            Ok(ctx) => Some(ctx),
            Err(fault) => {
                self.fail(fault);
                None
            }
        }
    }

    /// Disables the detector and emits the one diagnostic this run gets.
    fn fail(&self, fault: Fault) {
        if !self.enabled.swap(false, Relaxed) {
            return;
        }
        error!(fault = %fault, "internal fault, disabling detector");
        self.reporter.diagnostic(&fault.to_string());
    }

    /// Advances the thread's own clock; required before release-style
    /// events so acquirers observe a fresh epoch.
    fn bump(&self, ctx: &ThreadCtx) -> Result<(), Fault> {
        // Hooks run inline on the owning thread.
        let clock = unsafe { ctx.vc_mut() }.inc(ctx.tid());
        if clock > Epoch::MAX_CLOCK {
            return Err(Fault::ClockOverflow(ctx.tid()));
        }
        ctx.refresh_epoch();
        Ok(())
    }

    // ---- access events ----

    pub fn read(&self, ctx: &ThreadCtx, addr: usize) {
        self.access(ctx, addr, false);
    }

    pub fn write(&self, ctx: &ThreadCtx, addr: usize) {
        self.access(ctx, addr, true);
    }

    pub fn read_range(&self, ctx: &ThreadCtx, addr: usize, len: usize) {
        for addr in addr..addr.saturating_add(len) {
            self.access(ctx, addr, false);
        }
    }

    pub fn write_range(&self, ctx: &ThreadCtx, addr: usize, len: usize) {
        for addr in addr..addr.saturating_add(len) {
            self.access(ctx, addr, true);
        }
    }

    fn access(&self, ctx: &ThreadCtx, addr: usize, is_write: bool) {
        if !self.enabled() {
            return;
        }
        let mut races = RaceBuf::new();
        // Owner-thread read of the clock; the shadow only borrows it for
        // happens-before checks.
        let vc = unsafe { ctx.vc() };
        let checked = self.shadow.check_access(
            addr,
            vc,
            ctx.epoch(),
            is_write,
            ctx.last_stack(),
            &mut races,
        );
        match checked {
            Ok(()) => {
                for prev in races {
                    self.emit(addr, ctx, is_write, prev);
                }
            }
            Err(fault) => self.fail(fault),
        }
    }

    /// Builds and delivers one race report. Runs with no locks held.
    fn emit(&self, addr: usize, ctx: &ThreadCtx, is_write: bool, prev: PrevAccess) {
        let kind = RaceKind::of(is_write, prev.is_write);
        if !self.reported.insert((addr, kind, prev.epoch.tid().0, ctx.tid().0)) {
            return;
        }

        let record = RaceRecord {
            addr,
            kind,
            curr: Access {
                epoch: ctx.epoch(),
                is_write,
                stack: ctx.last_stack(),
            },
            prev: Access {
                epoch: prev.epoch,
                is_write: prev.is_write,
                stack: prev.stack,
            },
        };
        self.races.fetch_add(1, Relaxed);

        let prev_stack = self.depot.get(prev.stack);
        let curr_stack = self.depot.get(record.curr.stack);
        self.reporter.report(&record, prev_stack.as_ref(), curr_stack.as_ref());

        if self.opts.halt_on_error {
            self.reporter.summarize(self.races_detected());
            if self.opts.atexit_sleep_ms > 0 {
                std::thread::sleep(std::time::Duration::from_millis(self.opts.atexit_sleep_ms));
            }
            std::process::exit(self.opts.exitcode);
        }
    }

    // ---- mutex events ----

    pub fn acquire(&self, ctx: &ThreadCtx, addr: usize) {
        if !self.enabled() {
            return;
        }
        let var = self.sync.var(addr, SyncKind::Mutex);
        var.state.lock().acquire(unsafe { ctx.vc_mut() });
        ctx.refresh_epoch();
    }

    pub fn release(&self, ctx: &ThreadCtx, addr: usize) {
        if !self.enabled() {
            return;
        }
        if let Err(fault) = self.bump(ctx) {
            return self.fail(fault);
        }
        let var = self.sync.var(addr, SyncKind::Mutex);
        var.state.lock().release(unsafe { ctx.vc() });
    }

    /// Reader unlock of a shared mutex: the object's clock accumulates
    /// instead of being replaced.
    pub fn release_merge(&self, ctx: &ThreadCtx, addr: usize) {
        if !self.enabled() {
            return;
        }
        if let Err(fault) = self.bump(ctx) {
            return self.fail(fault);
        }
        let var = self.sync.var(addr, SyncKind::Mutex);
        var.state.lock().release_merge(unsafe { ctx.vc() });
    }

    // ---- spawn events ----

    /// Parent side of a spawn: snapshot the clock for the child, then move
    /// past it so post-spawn work is not inherited retroactively.
    pub fn go_start(&self, ctx: &ThreadCtx) {
        if !self.enabled() {
            return;
        }
        let snapshot = unsafe { ctx.vc() }.clone();
        self.threads.publish_spawn_clock(snapshot);
        if let Err(fault) = self.bump(ctx) {
            self.fail(fault);
        }
    }

    /// Thread exit. The context stays registered until the sweep collects
    /// it; no event may target it again.
    pub fn go_end(&self, ctx: &ThreadCtx) {
        if !self.enabled() {
            return;
        }
        ctx.mark_dead();
    }

    // ---- channel events ----

    /// Present for hook-contract symmetry; the happens-before edges are all
    /// established by the `*_after` half.
    pub fn chan_send_before(&self, _ctx: &ThreadCtx, _addr: usize) {}

    pub fn chan_send_after(&self, ctx: &ThreadCtx, addr: usize) {
        if !self.enabled() {
            return;
        }
        if let Err(fault) = self.bump(ctx) {
            return self.fail(fault);
        }
        let var = self.sync.var(addr, SyncKind::Channel);
        var.state.lock().chan_send(unsafe { ctx.vc() });
    }

    /// See [`chan_send_before`][Self::chan_send_before].
    pub fn chan_recv_before(&self, _ctx: &ThreadCtx, _addr: usize) {}

    /// `observed_close` is whether this receive returned because the channel
    /// was closed (it then also acquires the closer's clock).
    pub fn chan_recv_after(&self, ctx: &ThreadCtx, addr: usize, observed_close: bool) {
        if !self.enabled() {
            return;
        }
        let var = self.sync.var(addr, SyncKind::Channel);
        var.state.lock().chan_recv(unsafe { ctx.vc_mut() }, observed_close);
        ctx.refresh_epoch();
    }

    pub fn chan_close(&self, ctx: &ThreadCtx, addr: usize) {
        if !self.enabled() {
            return;
        }
        if let Err(fault) = self.bump(ctx) {
            return self.fail(fault);
        }
        let var = self.sync.var(addr, SyncKind::Channel);
        var.state.lock().chan_close(unsafe { ctx.vc() });
    }

    // ---- wait-group events ----

    /// Counter bookkeeping only; `Add` has no clock effect.
    pub fn wg_add(&self, _ctx: &ThreadCtx, addr: usize, delta: i64) {
        if !self.enabled() {
            return;
        }
        let var = self.sync.var(addr, SyncKind::WaitGroup);
        var.state.lock().wg_add(delta);
    }

    pub fn wg_done(&self, ctx: &ThreadCtx, addr: usize) {
        if !self.enabled() {
            return;
        }
        if let Err(fault) = self.bump(ctx) {
            return self.fail(fault);
        }
        let var = self.sync.var(addr, SyncKind::WaitGroup);
        var.state.lock().wg_done(unsafe { ctx.vc() });
    }

    pub fn wg_wait_after(&self, ctx: &ThreadCtx, addr: usize) {
        if !self.enabled() {
            return;
        }
        let var = self.sync.var(addr, SyncKind::WaitGroup);
        var.state.lock().wg_wait(unsafe { ctx.vc_mut() });
        ctx.refresh_epoch();
    }

    // ---- once events ----

    pub fn once_done(&self, ctx: &ThreadCtx, addr: usize) {
        if !self.enabled() {
            return;
        }
        if let Err(fault) = self.bump(ctx) {
            return self.fail(fault);
        }
        let var = self.sync.var(addr, SyncKind::Once);
        var.state.lock().once_done(unsafe { ctx.vc() });
    }

    pub fn once_wait(&self, ctx: &ThreadCtx, addr: usize) {
        if !self.enabled() {
            return;
        }
        let var = self.sync.var(addr, SyncKind::Once);
        var.state.lock().once_wait(unsafe { ctx.vc_mut() });
        ctx.refresh_epoch();
    }

    // ---- lifecycle ----

    /// Clears shadow, sync objects, contexts, depot, counters and report
    /// throttling. Tests only.
    pub fn reset(&self) {
        self.shadow.clear();
        self.sync.clear();
        self.depot.clear();
        self.reported.clear();
        self.races.store(0, Relaxed);
        self.threads.reset();
        self.set_enabled(true);
    }
}
