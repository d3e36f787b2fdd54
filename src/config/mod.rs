//! Detector configuration.


use std::path::PathBuf;

use thiserror::Error;

/// Name of the environment variable read by [`Opts::from_env`].
pub const ENV_VAR: &str = "RACETRACK";

/// Smallest allowed shadow history size (slots per shadow cell).
pub const HISTORY_MIN: usize = 2;
/// Largest allowed shadow history size.
pub const HISTORY_MAX: usize = 8;

/// Detector options.
///
/// Options can be set programmatically or through the `RACETRACK` environment
/// variable, which holds whitespace- or comma-separated `key=value` pairs:
///
/// ```text
/// RACETRACK="halt_on_error=1 history_size=8 log_path=/tmp/races.log"
/// ```
///
/// Unrecognized keys and malformed values are rejected at init; the detector
/// then stays disabled.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Opts {
    /// Call `finalize` and terminate the process on the first reported race.
    pub halt_on_error: bool,

    /// Slots per shadow cell: how many concurrent-access records one byte of
    /// monitored memory can remember. Range [2, 8].
    pub history_size: usize,

    /// Where race reports are written. `None` means standard error.
    pub log_path: Option<PathBuf>,

    /// Process exit code when `halt_on_error` triggers.
    pub exitcode: i32,

    /// Delay before `finalize` returns, to let asynchronous report consumers
    /// drain.
    pub atexit_sleep_ms: u64,
}

impl Default for Opts {
    fn default() -> Self {
        Opts {
            halt_on_error: false,
            history_size: 4,
            log_path: None,
            exitcode: 66,
            atexit_sleep_ms: 0,
        }
    }
}

/// Configuration rejected at init.
#[derive(Debug, Error)]
pub enum OptsError {
    #[error("unknown option `{0}`")]
    UnknownKey(String),

    #[error("malformed option `{key}={value}`")]
    InvalidValue { key: String, value: String },

    #[error("history_size {0} outside [{HISTORY_MIN}, {HISTORY_MAX}]")]
    HistorySize(usize),

    #[error("cannot open log_path {}: {source}", path.display())]
    LogPath {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl Opts {
    /// Builds options from the `RACETRACK` environment variable, on top of
    /// the defaults. An absent variable yields the defaults.
    pub fn from_env() -> Result<Self, OptsError> {
        match std::env::var(ENV_VAR) {
            Ok(val) => Self::parse(&val),
            Err(_) => Ok(Self::default()),
        }
    }

    /// Parses `key=value` pairs separated by whitespace or commas.
    pub fn parse(s: &str) -> Result<Self, OptsError> {
        let mut opts = Self::default();
        for pair in s.split([' ', '\t', ',']).filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').ok_or_else(|| OptsError::InvalidValue {
                key: pair.into(),
                value: String::new(),
            })?;
            let invalid = || OptsError::InvalidValue {
                key: key.into(),
                value: value.into(),
            };
            match key {
                "halt_on_error" => opts.halt_on_error = parse_bool(value).ok_or_else(invalid)?,
                "history_size" => opts.history_size = value.parse().map_err(|_| invalid())?,
                "log_path" => opts.log_path = Some(PathBuf::from(value)),
                "exitcode" => opts.exitcode = value.parse().map_err(|_| invalid())?,
                "atexit_sleep_ms" => opts.atexit_sleep_ms = value.parse().map_err(|_| invalid())?,
                _ => return Err(OptsError::UnknownKey(key.into())),
            }
        }
        opts.validate()?;
        Ok(opts)
    }

    pub fn validate(&self) -> Result<(), OptsError> {
        if !(HISTORY_MIN..=HISTORY_MAX).contains(&self.history_size) {
            return Err(OptsError::HistorySize(self.history_size));
        }
        Ok(())
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}
