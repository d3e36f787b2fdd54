//! The process-global runtime surface consumed by instrumentation.
//!
//! Every hook is shaped the same way: load the enabled flag, resolve the
//! calling thread's context (cached in TLS), call the engine. Hooks return
//! without allocating when the detector is absent or disabled, and they are
//! not themselves instrumented: nothing in this crate calls back into the
//! hook surface.

#[cfg(test)]
mod test;

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::{Opts, OptsError};
use crate::engine::Engine;
use crate::report::{LogReporter, Reporter};
use crate::thread::{host_tid, ThreadCtx, ThreadTable};

/// Innermost frames to drop from captured stacks so reports start at the
/// instrumented call site rather than inside the hook.
const STACK_SKIP: usize = 3;

struct Detector {
    engine: Engine<LogReporter>,
    finalized: AtomicBool,
}

static DETECTOR: OnceLock<Detector> = OnceLock::new();

/// TLS cache of this thread's context. The drop guard marks the context
/// dead when the OS thread unwinds without an explicit `race_go_end`, so
/// the sweep can reclaim its identifier.
struct Bound {
    generation: u64,
    ctx: Arc<ThreadCtx>,
}

impl Drop for Bound {
    fn drop(&mut self) {
        self.ctx.mark_dead();
    }
}

thread_local! {
    static BOUND: RefCell<Option<Bound>> = const { RefCell::new(None) };
}

fn current_ctx(d: &Detector) -> Option<Arc<ThreadCtx>> {
    let generation = d.engine.threads().generation();
    let cached = BOUND.try_with(|slot| {
        let mut slot = slot.borrow_mut();
        if let Some(bound) = &*slot {
            if bound.generation == generation {
                return Some(bound.ctx.clone());
            }
        }
        let ctx = d.engine.current()?;
        *slot = Some(Bound {
            generation,
            ctx: ctx.clone(),
        });
        Some(ctx)
    });
    match cached {
        Ok(ctx) => ctx,
        // TLS is already torn down (thread exit path); skip the cache.
        Err(_) => d.engine.current(),
    }
}

/// Initializes the detector from the `RACETRACK` environment variable and
/// enables it. Idempotent; later calls keep the first configuration.
///
/// On a configuration error the detector stays disabled and the error is
/// returned.
pub fn init() -> Result<(), OptsError> {
    init_with(Opts::from_env()?)
}

/// Initializes the detector with explicit options.
pub fn init_with(opts: Opts) -> Result<(), OptsError> {
    opts.validate()?;
    if DETECTOR.get().is_some() {
        return Ok(());
    }

    let reporter = match &opts.log_path {
        Some(path) => LogReporter::file(path).map_err(|source| OptsError::LogPath {
            path: path.clone(),
            source,
        })?,
        None => LogReporter::stderr(),
    };

    let mut fresh = false;
    let detector = DETECTOR.get_or_init(|| {
        fresh = true;
        let engine = Engine::new(opts, reporter);
        engine.threads().init_main(host_tid());
        Detector {
            engine,
            finalized: AtomicBool::new(false),
        }
    });

    if fresh {
        spawn_sweeper(detector.engine.threads_shared());
        debug!("detector initialized");
    }
    Ok(())
}

fn spawn_sweeper(table: Arc<ThreadTable>) {
    let spawned = std::thread::Builder::new()
        .name("racetrack-sweeper".into())
        .spawn(move || loop {
            table.wait_for_sweep_kick();
            table.sweep();
        });
    if let Err(err) = spawned {
        // Reclamation degrades to the synchronous exhaustion path.
        warn!(%err, "could not spawn sweeper thread");
    }
}

/// Disables the detector and emits the terminal summary. Idempotent.
pub fn finalize() {
    let Some(d) = DETECTOR.get() else { return };
    if d.finalized.swap(true, Relaxed) {
        return;
    }
    d.engine.set_enabled(false);
    d.engine.reporter().summarize(d.engine.races_detected());
    let ms = d.engine.opts().atexit_sleep_ms;
    if ms > 0 {
        std::thread::sleep(Duration::from_millis(ms));
    }
}

pub fn enable() {
    if let Some(d) = DETECTOR.get() {
        d.engine.set_enabled(true);
    }
}

pub fn disable() {
    if let Some(d) = DETECTOR.get() {
        d.engine.set_enabled(false);
    }
}

/// Races reported so far.
pub fn races_detected() -> u64 {
    DETECTOR.get().map_or(0, |d| d.engine.races_detected())
}

/// Clears all detector state (shadow, sync objects, contexts, depot,
/// counters) and re-enables. Tests only.
pub fn reset() {
    if let Some(d) = DETECTOR.get() {
        d.engine.reset();
        d.finalized.store(false, Relaxed);
    }
}

macro_rules! hooks {
    ($($(#[$doc:meta])* $name:ident($($arg:ident: $ty:ty),*) => $method:ident;)*) => {
        $(
            $(#[$doc])*
            pub fn $name($($arg: $ty),*) {
                let Some(d) = DETECTOR.get() else { return };
                if !d.engine.enabled() {
                    return;
                }
                let Some(ctx) = current_ctx(d) else { return };
                d.engine.$method(&ctx, $($arg),*);
            }
        )*
    };
}

/// Memory read of one byte.
pub fn race_read(addr: usize) {
    access(addr, false);
}

/// Memory write of one byte.
pub fn race_write(addr: usize) {
    access(addr, true);
}

/// Memory read of `len` bytes starting at `addr`.
pub fn race_read_range(addr: usize, len: usize) {
    let Some(d) = DETECTOR.get() else { return };
    if !d.engine.enabled() {
        return;
    }
    let Some(ctx) = current_ctx(d) else { return };
    ctx.set_last_stack(d.engine.depot().capture(STACK_SKIP));
    d.engine.read_range(&ctx, addr, len);
}

/// Memory write of `len` bytes starting at `addr`.
pub fn race_write_range(addr: usize, len: usize) {
    let Some(d) = DETECTOR.get() else { return };
    if !d.engine.enabled() {
        return;
    }
    let Some(ctx) = current_ctx(d) else { return };
    ctx.set_last_stack(d.engine.depot().capture(STACK_SKIP));
    d.engine.write_range(&ctx, addr, len);
}

fn access(addr: usize, is_write: bool) {
    let Some(d) = DETECTOR.get() else { return };
    if !d.engine.enabled() {
        return;
    }
    let Some(ctx) = current_ctx(d) else { return };
    ctx.set_last_stack(d.engine.depot().capture(STACK_SKIP));
    if is_write {
        d.engine.write(&ctx, addr);
    } else {
        d.engine.read(&ctx, addr);
    }
}

hooks! {
    /// Mutex (or shared-mutex writer) lock.
    race_acquire(addr: usize) => acquire;
    /// Mutex (or shared-mutex writer) unlock.
    race_release(addr: usize) => release;
    /// Shared-mutex reader unlock.
    race_release_merge(addr: usize) => release_merge;

    /// About to perform a channel send. No clock effect.
    race_chan_send_before(ch: usize) => chan_send_before;
    /// A channel send completed.
    race_chan_send_after(ch: usize) => chan_send_after;
    /// About to perform a channel receive. No clock effect.
    race_chan_recv_before(ch: usize) => chan_recv_before;
    /// A channel receive completed. `observed_close` is whether it returned
    /// because the channel was closed.
    race_chan_recv_after(ch: usize, observed_close: bool) => chan_recv_after;
    /// The channel was closed.
    race_chan_close(ch: usize) => chan_close;

    /// Wait-group counter adjustment.
    race_wg_add(wg: usize, delta: i64) => wg_add;
    /// One wait-group task finished.
    race_wg_done(wg: usize) => wg_done;
    /// A wait-group wait returned.
    race_wg_wait_after(wg: usize) => wg_wait_after;

    /// A once-initializer ran to completion on this thread.
    race_once_done(addr: usize) => once_done;
    /// A once-initializer was observed complete without running it.
    race_once_wait(addr: usize) => once_wait;

    /// About to spawn a thread (called in the parent).
    race_go_start() => go_start;
}

/// The current thread is exiting; its context will be reclaimed.
pub fn race_go_end() {
    let Some(d) = DETECTOR.get() else { return };
    if !d.engine.enabled() {
        return;
    }
    let Some(ctx) = current_ctx(d) else { return };
    d.engine.go_end(&ctx);
    let _ = BOUND.try_with(|slot| slot.borrow_mut().take());
}
