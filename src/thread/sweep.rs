//! Context reclamation.
//!
//! The sweep walks the registry and reclaims contexts whose thread has been
//! marked dead or has vanished from the host's live-thread list, returning
//! their identifiers to the pool. It runs on a dedicated background thread
//! (kicked every [`SWEEP_EVERY`][super::SWEEP_EVERY] allocations) and
//! synchronously when the pool runs dry.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use tracing::debug;

use super::ThreadTable;

/// Identity of the calling OS thread, as the host kernel names it.
pub(crate) fn host_tid() -> i32 {
    // gettid(2) cannot fail.
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}

/// Thread ids of every live thread in this process.
fn live_host_tids() -> HashSet<i32> {
    let mut live = HashSet::new();
    if let Ok(entries) = fs::read_dir("/proc/self/task") {
        for entry in entries.flatten() {
            if let Some(tid) = entry.file_name().to_str().and_then(|s| s.parse().ok()) {
                live.insert(tid);
            }
        }
    }
    live
}

fn is_live(host: i32) -> bool {
    Path::new("/proc/self/task").join(host.to_string()).exists()
}

impl ThreadTable {
    /// One reclamation pass. Safe to run concurrently with hook activity:
    /// a context is only removed when its thread is marked dead or absent
    /// from the live list, and absence is re-checked right before removal
    /// to shrink the window against a thread that appeared mid-pass.
    pub fn sweep(&self) {
        let live = live_host_tids();
        if live.is_empty() {
            // /proc is unreadable; better to leak contexts than to reclaim
            // a live thread's.
            return;
        }

        let victims: Vec<i32> = self
            .contexts
            .iter()
            .filter(|entry| entry.value().is_dead() || !live.contains(entry.key()))
            .map(|entry| *entry.key())
            .collect();

        let mut reclaimed = 0usize;
        for host in victims {
            let removed = self
                .contexts
                .remove_if(&host, |_, ctx| ctx.is_dead() || !is_live(host));
            if let Some((_, ctx)) = removed {
                self.pool.lock().free(ctx.tid(), ctx.epoch().clock());
                reclaimed += 1;
            }
        }

        if reclaimed > 0 {
            debug!(
                reclaimed,
                live = self.contexts.len(),
                available = self.pool.lock().available(),
                "sweep reclaimed contexts"
            );
        }
    }
}
