//! Race records and the reporter contract.
//!
//! The engine compiles against any [`Reporter`]: a null one, a buffering one,
//! or the formatted [`LogReporter`]. Reporters are invoked off the engine's
//! lock-holding paths, at most once per detected race, and must not panic.

#[cfg(test)]
mod test;

use std::fmt;
use std::fs::File;
use std::io::{self, Stderr, Write};
use std::path::Path;

use parking_lot::Mutex;

use crate::clock::Epoch;
use crate::depot::{Stack, NO_STACK};

/// Which sides of a conflicting pair wrote, current access first.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RaceKind {
    /// Current write vs. previous write.
    WriteWrite,
    /// Current write vs. previous read.
    WriteRead,
    /// Current read vs. previous write.
    ReadWrite,
}

impl RaceKind {
    pub(crate) fn of(curr_is_write: bool, prev_is_write: bool) -> Self {
        match (curr_is_write, prev_is_write) {
            (true, true) => RaceKind::WriteWrite,
            (true, false) => RaceKind::WriteRead,
            (false, true) => RaceKind::ReadWrite,
            // Two reads never race; the shadow never emits this pair.
            (false, false) => RaceKind::ReadWrite,
        }
    }
}

impl fmt::Display for RaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RaceKind::WriteWrite => "write-write",
            RaceKind::WriteRead => "write-read",
            RaceKind::ReadWrite => "read-write",
        };
        f.write_str(s)
    }
}

/// One side of a detected race.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Access {
    pub epoch: Epoch,
    pub is_write: bool,
    /// Depot hash of the access's call stack; [`NO_STACK`] if none.
    pub stack: u64,
}

/// A detected pair of conflicting, unordered accesses.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RaceRecord {
    /// The shadowed byte both sides touched.
    pub addr: usize,
    pub kind: RaceKind,
    /// The access that completed the race (the one being checked).
    pub curr: Access,
    /// The access already recorded in the shadow.
    pub prev: Access,
}

/// Consumes race records. Supplied to the engine at construction.
///
/// Implementations must be non-blocking in spirit (buffer or enqueue; never
/// wait on user code) and must not panic.
pub trait Reporter: Send + Sync + 'static {
    /// Called once per detected race, with the resolved depot stacks of both
    /// sides when available.
    fn report(&self, record: &RaceRecord, prev_stack: Option<&Stack>, curr_stack: Option<&Stack>);

    /// Called by `finalize` with the final race count.
    fn summarize(&self, total_races: u64);

    /// Called at most once, when the engine disables itself on an internal
    /// fault.
    fn diagnostic(&self, _message: &str) {}
}

/// Discards everything.
#[derive(Default)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn report(&self, _: &RaceRecord, _: Option<&Stack>, _: Option<&Stack>) {}
    fn summarize(&self, _: u64) {}
}

/// Collects records in memory for later inspection. Useful in tests and for
/// embedders that render reports themselves.
#[derive(Default)]
pub struct BufferedReporter {
    records: Mutex<Vec<RaceRecord>>,
    summary: Mutex<Option<u64>>,
    diagnostics: Mutex<Vec<String>>,
}

impl BufferedReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<RaceRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn summary(&self) -> Option<u64> {
        *self.summary.lock()
    }

    pub fn diagnostics(&self) -> Vec<String> {
        self.diagnostics.lock().clone()
    }
}

impl Reporter for BufferedReporter {
    fn report(&self, record: &RaceRecord, _: Option<&Stack>, _: Option<&Stack>) {
        self.records.lock().push(*record);
    }

    fn summarize(&self, total_races: u64) {
        *self.summary.lock() = Some(total_races);
    }

    fn diagnostic(&self, message: &str) {
        self.diagnostics.lock().push(message.to_string());
    }
}

enum Sink {
    Stderr(Stderr),
    File(File),
}

impl Sink {
    fn write(&mut self, buf: &[u8]) {
        // A failed report write is not worth disturbing the user program for.
        let _ = match self {
            Sink::Stderr(s) => s.write_all(buf).and_then(|()| s.flush()),
            Sink::File(f) => f.write_all(buf).and_then(|()| f.flush()),
        };
    }
}

/// Formats races to standard error or to a log file.
///
/// Formatting and symbol resolution happen here, on the reporting path only;
/// the engine never pays for them on clean accesses.
pub struct LogReporter {
    sink: Mutex<Sink>,
}

impl LogReporter {
    pub fn stderr() -> Self {
        LogReporter {
            sink: Mutex::new(Sink::Stderr(io::stderr())),
        }
    }

    pub fn file(path: &Path) -> io::Result<Self> {
        Ok(LogReporter {
            sink: Mutex::new(Sink::File(File::create(path)?)),
        })
    }

    fn render_side(out: &mut String, label: &str, access: &Access, stack: Option<&Stack>) {
        let what = if access.is_write { "write" } else { "read" };
        out.push_str(&format!(
            "  {label} {what} by thread {} at clock {}:\n",
            access.epoch.tid(),
            access.epoch.clock(),
        ));
        match stack {
            Some(stack) => {
                for &pc in stack.iter() {
                    let mut line = format!("    #{pc:#x}");
                    backtrace::resolve(pc as *mut _, |symbol| {
                        if let Some(name) = symbol.name() {
                            line = format!("    {name} ({pc:#x})");
                        }
                    });
                    out.push_str(&line);
                    out.push('\n');
                }
            }
            None if access.stack == NO_STACK => out.push_str("    <no stack>\n"),
            None => out.push_str("    <stack evicted>\n"),
        }
    }
}

impl Reporter for LogReporter {
    fn report(&self, record: &RaceRecord, prev_stack: Option<&Stack>, curr_stack: Option<&Stack>) {
        let mut out = String::new();
        out.push_str("==================\n");
        out.push_str(&format!(
            "WARNING: DATA RACE ({}) at {:#x}\n",
            record.kind, record.addr
        ));
        Self::render_side(&mut out, "current", &record.curr, curr_stack);
        Self::render_side(&mut out, "previous", &record.prev, prev_stack);
        out.push_str("==================\n");
        self.sink.lock().write(out.as_bytes());
    }

    fn summarize(&self, total_races: u64) {
        if total_races > 0 {
            let line = format!("Found {total_races} data race(s)\n");
            self.sink.lock().write(line.as_bytes());
        }
    }

    fn diagnostic(&self, message: &str) {
        let line = format!("racetrack: {message}; detector disabled\n");
        self.sink.lock().write(line.as_bytes());
    }
}
