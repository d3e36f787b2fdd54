//! Hook-surface tests. The detector is process-global, so every test takes
//! the serial lock and starts from a fresh reset.

use std::thread;

use parking_lot::{Mutex, MutexGuard};

use super::*;

static SERIAL: Mutex<()> = Mutex::new(());

fn setup() -> MutexGuard<'static, ()> {
    let guard = SERIAL.lock();
    init_with(Opts::default()).unwrap();
    reset();
    guard
}

#[test]
fn test_init_idempotent() {
    let _guard = setup();
    init_with(Opts::default()).unwrap();
    init().unwrap();
    assert_eq!(races_detected(), 0);
}

#[test]
fn test_unsynchronized_threads_race() {
    let _guard = setup();
    let x = 0x5100_0000usize;

    race_write(x);
    thread::spawn(move || race_write(x)).join().unwrap();

    // Joining the OS thread is invisible to the detector; only hook-visible
    // synchronization orders accesses.
    assert_eq!(races_detected(), 1);
}

#[test]
fn test_spawn_hook_orders_child() {
    let _guard = setup();
    let x = 0x5200_0000usize;

    race_write(x);
    race_go_start();
    thread::spawn(move || {
        race_read(x);
        race_go_end();
    })
    .join()
    .unwrap();

    assert_eq!(races_detected(), 0);
}

#[test]
fn test_post_spawn_write_races_child() {
    let _guard = setup();
    let x = 0x5300_0000usize;

    race_go_start();
    race_write(x);
    thread::spawn(move || race_read(x)).join().unwrap();

    assert_eq!(races_detected(), 1);
}

#[test]
fn test_mutex_hooks_order_threads() {
    let _guard = setup();
    let x = 0x5400_0000usize;
    let m = 0x5400_1000usize;

    race_acquire(m);
    race_write(x);
    race_release(m);

    thread::spawn(move || {
        race_acquire(m);
        race_write(x);
        race_release(m);
    })
    .join()
    .unwrap();

    assert_eq!(races_detected(), 0);
}

#[test]
fn test_channel_hooks_order_threads() {
    let _guard = setup();
    let x = 0x5500_0000usize;
    let ch = 0x5500_1000usize;

    race_write(x);
    race_chan_send_before(ch);
    race_chan_send_after(ch);

    thread::spawn(move || {
        race_chan_recv_before(ch);
        race_chan_recv_after(ch, false);
        race_read(x);
    })
    .join()
    .unwrap();

    assert_eq!(races_detected(), 0);
}

#[test]
fn test_wait_group_hooks_order_threads() {
    let _guard = setup();
    let x = 0x5600_0000usize;
    let wg = 0x5600_1000usize;

    race_wg_add(wg, 1);
    race_go_start();
    thread::spawn(move || {
        race_write(x);
        race_wg_done(wg);
    })
    .join()
    .unwrap();

    race_wg_wait_after(wg);
    race_read(x);

    assert_eq!(races_detected(), 0);
}

#[test]
fn test_once_hooks_order_threads() {
    let _guard = setup();
    let x = 0x5700_0000usize;
    let once = 0x5700_1000usize;

    race_write(x);
    race_once_done(once);

    thread::spawn(move || {
        race_once_wait(once);
        race_read(x);
    })
    .join()
    .unwrap();

    assert_eq!(races_detected(), 0);
}

#[test]
fn test_ranged_hooks() {
    let _guard = setup();
    let x = 0x5800_0000usize;

    race_write_range(x, 8);
    thread::spawn(move || race_read_range(x + 4, 2)).join().unwrap();

    assert!(races_detected() >= 1);
}

#[test]
fn test_disable_is_observable() {
    let _guard = setup();
    let x = 0x5900_0000usize;

    race_write(x);
    disable();

    thread::spawn(move || race_write(x)).join().unwrap();
    assert_eq!(races_detected(), 0);

    enable();
    thread::spawn(move || race_write(x)).join().unwrap();
    assert_eq!(races_detected(), 1);
}

#[test]
fn test_finalize_idempotent() {
    let _guard = setup();
    finalize();
    finalize();
    assert_eq!(races_detected(), 0);

    // Hooks are inert after finalize.
    let x = 0x5a00_0000usize;
    race_write(x);
    thread::spawn(move || race_write(x)).join().unwrap();
    assert_eq!(races_detected(), 0);

    // Reset re-arms the detector for the remaining tests.
    reset();
    assert_eq!(races_detected(), 0);
}

#[test]
fn test_thread_exit_reclaims_context() {
    let _guard = setup();

    for _ in 0..3 {
        thread::spawn(|| {
            race_read(0x5b00_0000);
            race_go_end();
        })
        .join()
        .unwrap();
    }

    // All exited threads are marked dead; a sweep returns their ids.
    let d = DETECTOR.get().unwrap();
    d.engine.threads().sweep();
    assert_eq!(d.engine.threads().len(), 1);
}
