//! Wall-clock helpers
//!
//! Timer deadlines are absolute wall-clock milliseconds. The timer manager
//! detects the clock being stepped backwards, which only makes sense on a
//! settable clock, so these read `gettimeofday` rather than a monotonic
//! source.

/// Current wall-clock time in milliseconds.
#[inline]
pub fn current_ms() -> u64 {
    let mut tv = libc::timeval {
        tv_sec: 0,
        tv_usec: 0,
    };
    // gettimeofday only fails on a bad pointer
    unsafe {
        libc::gettimeofday(&mut tv, core::ptr::null_mut());
    }
    tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000
}

/// Current wall-clock time in microseconds.
#[inline]
pub fn current_us() -> u64 {
    let mut tv = libc::timeval {
        tv_sec: 0,
        tv_usec: 0,
    };
    unsafe {
        libc::gettimeofday(&mut tv, core::ptr::null_mut());
    }
    tv.tv_sec as u64 * 1_000_000 + tv.tv_usec as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_ms_advances() {
        let a = current_ms();
        std::thread::sleep(std::time::Duration::from_millis(15));
        let b = current_ms();
        assert!(b >= a + 10, "clock did not advance: {} -> {}", a, b);
    }

    #[test]
    fn test_us_ms_agree() {
        let us = current_us();
        let ms = current_ms();
        // Same clock, so the scaled values stay close
        assert!(ms.abs_diff(us / 1000) < 1000);
    }
}
