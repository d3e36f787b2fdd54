use std::io::Read;

use super::{Access, BufferedReporter, LogReporter, RaceKind, RaceRecord, Reporter};
use crate::clock::{Epoch, Tid};
use crate::depot::{Stack, NO_STACK};

fn record() -> RaceRecord {
    RaceRecord {
        addr: 0xdead_b00c,
        kind: RaceKind::WriteWrite,
        curr: Access {
            epoch: Epoch::new(Tid(2), 7),
            is_write: true,
            stack: NO_STACK,
        },
        prev: Access {
            epoch: Epoch::new(Tid(1), 3),
            is_write: true,
            stack: NO_STACK,
        },
    }
}

#[test]
fn test_kind_of() {
    assert_eq!(RaceKind::of(true, true), RaceKind::WriteWrite);
    assert_eq!(RaceKind::of(true, false), RaceKind::WriteRead);
    assert_eq!(RaceKind::of(false, true), RaceKind::ReadWrite);
}

#[test]
fn test_buffered_reporter_collects() {
    let reporter = BufferedReporter::new();
    assert!(reporter.is_empty());
    reporter.report(&record(), None, None);
    reporter.report(&record(), None, None);
    reporter.summarize(2);
    assert_eq!(reporter.len(), 2);
    assert_eq!(reporter.records()[0].addr, 0xdead_b00c);
    assert_eq!(reporter.summary(), Some(2));
}

#[test]
fn test_log_reporter_writes_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("races.log");
    let reporter = LogReporter::file(&path).unwrap();

    let stack: Stack = [0x1000usize, 0x2000].into_iter().collect();
    reporter.report(&record(), Some(&stack), None);
    reporter.summarize(1);

    let mut text = String::new();
    std::fs::File::open(&path)
        .unwrap()
        .read_to_string(&mut text)
        .unwrap();
    assert!(text.contains("DATA RACE (write-write)"));
    assert!(text.contains("current write by thread 2 at clock 7"));
    assert!(text.contains("previous write by thread 1 at clock 3"));
    assert!(text.contains("Found 1 data race(s)"));
}

#[test]
fn test_log_reporter_quiet_summary_when_clean() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clean.log");
    let reporter = LogReporter::file(&path).unwrap();
    reporter.summarize(0);

    let mut text = String::new();
    std::fs::File::open(&path)
        .unwrap()
        .read_to_string(&mut text)
        .unwrap();
    assert!(text.is_empty());
}

#[test]
fn test_diagnostic_format() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("diag.log");
    let reporter = LogReporter::file(&path).unwrap();
    reporter.diagnostic("logical clock overflow on thread 3");

    let mut text = String::new();
    std::fs::File::open(&path)
        .unwrap()
        .read_to_string(&mut text)
        .unwrap();
    assert!(text.contains("logical clock overflow"));
    assert!(text.contains("detector disabled"));
}
