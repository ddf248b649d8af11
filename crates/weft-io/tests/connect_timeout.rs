//! Connecting to a non-routable address must come back as a timed-out (or
//! refused) connect within the configured budget, not hang the worker.

use std::mem;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use weft_core::config::Config;
use weft_io::{hook, IoManager};
use weft_runtime::ScheduleExt;

#[test]
fn connect_times_out_within_budget() {
    Config::lookup::<i32>("tcp.connect.timeout", 5000, "tcp connect timeout").set(100);

    let iom = IoManager::new(2, false, "connect_test");

    let result = Arc::new(AtomicI32::new(0));
    let err = Arc::new(AtomicI32::new(0));
    let elapsed_ms = Arc::new(AtomicU64::new(0));

    let (result2, err2, elapsed2) = (result.clone(), err.clone(), elapsed_ms.clone());
    iom.schedule(move || {
        let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0);

        // 10.255.255.1:1 is reserved and non-routable
        let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_port = 1u16.to_be();
        addr.sin_addr.s_addr = u32::from_be_bytes([10, 255, 255, 1]).to_be();

        let started = Instant::now();
        let rt = unsafe {
            hook::connect(
                fd,
                &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);

        result2.store(rt, Ordering::SeqCst);
        err2.store(errno, Ordering::SeqCst);
        elapsed2.store(started.elapsed().as_millis() as u64, Ordering::SeqCst);

        hook::close(fd);
    });

    iom.stop();

    assert_eq!(result.load(Ordering::SeqCst), -1);
    let errno = err.load(Ordering::SeqCst);
    // Sandboxes without a default route fail fast with unreachable errors
    assert!(
        matches!(
            errno,
            libc::ETIMEDOUT | libc::ECONNREFUSED | libc::ENETUNREACH | libc::EHOSTUNREACH
        ),
        "unexpected errno {}",
        errno
    );
    if errno == libc::ETIMEDOUT {
        let ms = elapsed_ms.load(Ordering::SeqCst);
        assert!((100..=300).contains(&ms), "timed out after {} ms", ms);
    }
}
