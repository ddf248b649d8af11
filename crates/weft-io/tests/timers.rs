//! Reactor-driven timer behavior: recurring firing cadence and the
//! weak-condition guard.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;
use weft_io::IoManager;

#[test]
fn recurring_timer_fires_on_cadence() {
    let iom = IoManager::new(1, false, "recurring_test");

    let fired = Arc::new(AtomicU32::new(0));
    let f = fired.clone();
    let timer = iom.timers().add_timer(
        20,
        move || {
            f.fetch_add(1, Ordering::SeqCst);
        },
        true,
    );

    sleep(Duration::from_millis(110));
    timer.cancel();
    iom.stop();

    let count = fired.load(Ordering::SeqCst);
    assert!((4..=6).contains(&count), "fired {} times", count);
}

#[test]
fn condition_timer_skips_dead_referent() {
    let iom = IoManager::new(1, false, "condition_test");

    let fired = Arc::new(AtomicU32::new(0));
    let referent = Arc::new(());

    let f = fired.clone();
    iom.timers().add_condition_timer(
        50,
        move || {
            f.fetch_add(1, Ordering::SeqCst);
        },
        Arc::downgrade(&referent),
        false,
    );

    sleep(Duration::from_millis(10));
    drop(referent);

    sleep(Duration::from_millis(190));
    iom.stop();

    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn condition_timer_fires_while_referent_lives() {
    let iom = IoManager::new(1, false, "condition_live_test");

    let fired = Arc::new(AtomicU32::new(0));
    let referent = Arc::new(());

    let f = fired.clone();
    iom.timers().add_condition_timer(
        20,
        move || {
            f.fetch_add(1, Ordering::SeqCst);
        },
        Arc::downgrade(&referent),
        false,
    );

    sleep(Duration::from_millis(100));
    iom.stop();

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    drop(referent);
}
