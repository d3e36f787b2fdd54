//! Dynamic happens-before data-race detection for instrumented concurrent
//! programs.
//!
//! The detector consumes a stream of events (memory reads and writes,
//! mutex acquire/release, channel send/recv/close, wait-group done/wait,
//! thread spawn/exit) delivered through the flat hook surface at the crate
//! root, and reports every pair of accesses to the same byte, at least one
//! of them a write, that the observed synchronization does not order.
//!
//! ## Example
//!
//! ```rust
//! use std::thread;
//!
//! racetrack::init().unwrap();
//!
//! let data = Box::leak(Box::new(0u8)) as *mut u8 as usize;
//!
//! thread::spawn(move || racetrack::race_write(data))
//!     .join()
//!     .unwrap();
//!
//! // Joining the OS thread is invisible to the detector: no release/acquire
//! // hook ran, so the second write is unordered with the first.
//! thread::spawn(move || racetrack::race_write(data))
//!     .join()
//!     .unwrap();
//!
//! assert_eq!(racetrack::races_detected(), 1);
//! ```
//!
//! Had the two threads synchronized through an instrumented mutex
//! ([`race_acquire`]/[`race_release`]) or channel, the report would not
//! fire.
//!
//! ## Pieces
//!
//! - [`clock`]: packed epochs and sparse vector clocks.
//! - [`shadow`]: per-byte bounded access histories.
//! - [`sync`]: per-address mutex/channel/wait-group/once clock state.
//! - [`thread`]: the bounded thread-identifier pool and context registry.
//! - [`depot`]: deduplicated call-stack storage.
//! - [`engine`]: the state machine tying the above together.
//! - [`report`]: race records and the [`Reporter`] contract.
//!
//! The hooks are meant to be inserted by a compiler or runtime
//! instrumentation pass; nothing in this crate blocks on user code, and a
//! disabled detector reduces every hook to one atomic load.
//!
//! ## Configuration
//!
//! See [`Opts`]. The `RACETRACK` environment variable configures [`init`],
//! e.g. `RACETRACK="halt_on_error=1 log_path=/tmp/races.log"`.

pub mod clock;
pub mod config;
pub mod depot;
pub mod engine;
pub mod report;
mod rt;
pub mod shadow;
pub mod sync;
pub mod thread;

pub use config::{Opts, OptsError};
pub use engine::{Engine, Fault};
pub use report::{
    Access, BufferedReporter, LogReporter, NullReporter, RaceKind, RaceRecord, Reporter,
};
pub use rt::*;
