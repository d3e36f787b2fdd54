use super::{PrevAccess, RaceBuf, ShadowMemory};
use crate::clock::{Epoch, Tid, VectorClock};

fn vc(entries: &[(u16, u64)]) -> VectorClock {
    let mut vc = VectorClock::new();
    for &(tid, clock) in entries {
        vc.set(Tid(tid), clock);
    }
    vc
}

fn check(
    shadow: &ShadowMemory,
    addr: usize,
    vc: &VectorClock,
    tid: u16,
    clock: u64,
    is_write: bool,
) -> Vec<PrevAccess> {
    let mut races = RaceBuf::new();
    shadow
        .check_access(addr, vc, Epoch::new(Tid(tid), clock), is_write, 0, &mut races)
        .unwrap();
    races.into_iter().collect()
}

const X: usize = 0x1000;

#[test]
fn test_unordered_writes_race() {
    let shadow = ShadowMemory::new(4);
    assert!(check(&shadow, X, &vc(&[(1, 1)]), 1, 1, true).is_empty());

    let races = check(&shadow, X, &vc(&[(2, 1)]), 2, 1, true);
    assert_eq!(races.len(), 1);
    assert_eq!(races[0].epoch, Epoch::new(Tid(1), 1));
    assert!(races[0].is_write);

    // The newer write took the slot over.
    let cell = shadow.cell_snapshot(X);
    assert_eq!(cell.len(), 1);
    assert_eq!(cell[0].epoch, Epoch::new(Tid(2), 1));
}

#[test]
fn test_ordered_writes_no_race() {
    let shadow = ShadowMemory::new(4);
    assert!(check(&shadow, X, &vc(&[(1, 1)]), 1, 1, true).is_empty());
    // Thread 2 has observed thread 1's clock 1, e.g. through a release.
    assert!(check(&shadow, X, &vc(&[(1, 1), (2, 1)]), 2, 1, true).is_empty());
}

#[test]
fn test_write_after_read_race() {
    let shadow = ShadowMemory::new(4);
    assert!(check(&shadow, X, &vc(&[(1, 1)]), 1, 1, false).is_empty());

    let races = check(&shadow, X, &vc(&[(2, 1)]), 2, 1, true);
    assert_eq!(races.len(), 1);
    assert!(!races[0].is_write);
}

#[test]
fn test_read_after_write_race() {
    let shadow = ShadowMemory::new(4);
    assert!(check(&shadow, X, &vc(&[(1, 1)]), 1, 1, true).is_empty());

    let races = check(&shadow, X, &vc(&[(2, 1)]), 2, 1, false);
    assert_eq!(races.len(), 1);
    assert!(races[0].is_write);

    // Both the write and the racing read are recorded.
    let cell = shadow.cell_snapshot(X);
    assert_eq!(cell.len(), 2);
    assert!(cell.iter().any(|s| s.is_write));
    assert!(cell.iter().any(|s| !s.is_write));
}

#[test]
fn test_reads_never_race() {
    let shadow = ShadowMemory::new(4);
    for tid in 1..=4u16 {
        assert!(check(&shadow, X, &vc(&[(tid, 1)]), tid, 1, false).is_empty());
    }
    assert_eq!(shadow.cell_snapshot(X).len(), 4);
}

#[test]
fn test_repeat_access_idempotent() {
    let shadow = ShadowMemory::new(4);
    let clock = vc(&[(1, 3)]);
    for _ in 0..5 {
        assert!(check(&shadow, X, &clock, 1, 3, false).is_empty());
    }
    let cell = shadow.cell_snapshot(X);
    assert_eq!(cell.len(), 1);
    assert_eq!(cell[0].epoch, Epoch::new(Tid(1), 3));
}

#[test]
fn test_same_thread_folds_into_one_slot() {
    let shadow = ShadowMemory::new(4);
    assert!(check(&shadow, X, &vc(&[(1, 1)]), 1, 1, false).is_empty());
    // The same thread later writes; no self-race, one slot, write flag set.
    assert!(check(&shadow, X, &vc(&[(1, 2)]), 1, 2, true).is_empty());

    let cell = shadow.cell_snapshot(X);
    assert_eq!(cell.len(), 1);
    assert_eq!(cell[0].epoch, Epoch::new(Tid(1), 2));
    assert!(cell[0].is_write);
}

#[test]
fn test_racing_write_reports_every_concurrent_read() {
    let shadow = ShadowMemory::new(4);
    for tid in 1..=3u16 {
        assert!(check(&shadow, X, &vc(&[(tid, 1)]), tid, 1, false).is_empty());
    }

    let races = check(&shadow, X, &vc(&[(4, 1)]), 4, 1, true);
    assert_eq!(races.len(), 3);

    // Racing reads are dropped; the write owns the cell.
    let cell = shadow.cell_snapshot(X);
    assert_eq!(cell.len(), 1);
    assert!(cell[0].is_write);
    assert_eq!(cell[0].epoch, Epoch::new(Tid(4), 1));
}

#[test]
fn test_ordered_write_keeps_ordered_reads() {
    let shadow = ShadowMemory::new(4);
    assert!(check(&shadow, X, &vc(&[(1, 1)]), 1, 1, false).is_empty());

    // Thread 2 saw thread 1's read before writing.
    assert!(check(&shadow, X, &vc(&[(1, 1), (2, 1)]), 2, 1, true).is_empty());

    let cell = shadow.cell_snapshot(X);
    assert_eq!(cell.len(), 2);
    assert!(cell.iter().any(|s| s.is_write && s.epoch == Epoch::new(Tid(2), 1)));
    assert!(cell.iter().any(|s| !s.is_write && s.epoch == Epoch::new(Tid(1), 1)));
}

#[test]
fn test_full_cell_evicts_oldest_read() {
    let shadow = ShadowMemory::new(4);
    for tid in 1..=4u16 {
        assert!(check(&shadow, X, &vc(&[(tid, 1)]), tid, 1, false).is_empty());
    }

    // A fifth unordered read pushes out the oldest one.
    assert!(check(&shadow, X, &vc(&[(5, 1)]), 5, 1, false).is_empty());

    let cell = shadow.cell_snapshot(X);
    assert_eq!(cell.len(), 4);
    assert!(!cell.iter().any(|s| s.epoch.tid() == Tid(1)));
    assert!(cell.iter().any(|s| s.epoch.tid() == Tid(5)));
}

#[test]
fn test_full_cell_prefers_subsumed_victim() {
    let shadow = ShadowMemory::new(4);
    for tid in 1..=4u16 {
        assert!(check(&shadow, X, &vc(&[(tid, 1)]), tid, 1, false).is_empty());
    }

    // Thread 5 has observed thread 2's read, so that slot is subsumed and
    // should be the one to go, not the oldest.
    assert!(check(&shadow, X, &vc(&[(2, 1), (5, 1)]), 5, 1, false).is_empty());

    let cell = shadow.cell_snapshot(X);
    assert_eq!(cell.len(), 4);
    assert!(cell.iter().any(|s| s.epoch.tid() == Tid(1)));
    assert!(!cell.iter().any(|s| s.epoch.tid() == Tid(2)));
    assert!(cell.iter().any(|s| s.epoch.tid() == Tid(5)));
}

#[test]
fn test_write_survives_read_pressure() {
    let shadow = ShadowMemory::new(4);
    assert!(check(&shadow, X, &vc(&[(1, 1)]), 1, 1, true).is_empty());

    // Unordered reads keep racing the write and filling the cell; the write
    // record must never be evicted in their favor.
    for tid in 2..=6u16 {
        let races = check(&shadow, X, &vc(&[(tid, 1)]), tid, 1, false);
        assert_eq!(races.len(), 1, "read by thread {tid} must race the write");
    }

    let cell = shadow.cell_snapshot(X);
    assert!(cell.iter().any(|s| s.is_write && s.epoch == Epoch::new(Tid(1), 1)));
}

#[test]
fn test_pages_allocate_lazily() {
    let shadow = ShadowMemory::new(4);
    assert_eq!(shadow.page_count(), 0);
    check(&shadow, X, &vc(&[(1, 1)]), 1, 1, false);
    check(&shadow, X + 1, &vc(&[(1, 1)]), 1, 1, false);
    assert_eq!(shadow.page_count(), 1);
    check(&shadow, X + super::PAGE_SPAN, &vc(&[(1, 1)]), 1, 1, false);
    assert_eq!(shadow.page_count(), 2);
}

#[test]
fn test_neighboring_bytes_are_independent() {
    let shadow = ShadowMemory::new(4);
    assert!(check(&shadow, X, &vc(&[(1, 1)]), 1, 1, true).is_empty());
    // A write by another thread to the next byte never conflicts.
    assert!(check(&shadow, X + 1, &vc(&[(2, 1)]), 2, 1, true).is_empty());
}

#[test]
fn test_clear() {
    let shadow = ShadowMemory::new(4);
    check(&shadow, X, &vc(&[(1, 1)]), 1, 1, true);
    shadow.clear();
    assert_eq!(shadow.page_count(), 0);
    // After a clear the old write is forgotten entirely.
    assert!(check(&shadow, X, &vc(&[(2, 1)]), 2, 1, true).is_empty());
}

#[test]
fn test_history_size_two() {
    let shadow = ShadowMemory::new(2);
    assert!(check(&shadow, X, &vc(&[(1, 1)]), 1, 1, false).is_empty());
    assert!(check(&shadow, X, &vc(&[(2, 1)]), 2, 1, false).is_empty());
    assert!(check(&shadow, X, &vc(&[(3, 1)]), 3, 1, false).is_empty());
    assert_eq!(shadow.cell_snapshot(X).len(), 2);
}
