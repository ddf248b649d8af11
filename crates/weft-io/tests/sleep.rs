//! A fiber sleeping through the facade must suspend, not block its worker,
//! and everything must tear down clean.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use weft_io::{hook, IoManager};
use weft_runtime::{Fiber, ScheduleExt};

#[test]
fn sleep_yields_and_stops_clean() {
    let iom = IoManager::new(1, false, "sleep_test");

    let woke = Arc::new(AtomicBool::new(false));
    let w = woke.clone();
    let started = Instant::now();
    iom.schedule(move || {
        assert_eq!(hook::sleep(1), 0);
        w.store(true, Ordering::SeqCst);
    });

    // A second task proves the worker stayed responsive during the sleep
    let side = Arc::new(AtomicBool::new(false));
    let s = side.clone();
    iom.schedule(move || {
        s.store(true, Ordering::SeqCst);
    });

    iom.stop();
    let elapsed = started.elapsed();

    assert!(woke.load(Ordering::SeqCst));
    assert!(side.load(Ordering::SeqCst));
    assert!(
        elapsed.as_millis() >= 1000,
        "slept only {} ms",
        elapsed.as_millis()
    );

    // All fibers (workers' main fibers included) are gone after stop
    drop(iom);
    assert_eq!(Fiber::total_fibers(), 0);
}
