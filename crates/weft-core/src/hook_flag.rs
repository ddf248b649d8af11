//! Per-thread gate for the blocking-I/O facade
//!
//! Scheduler workers flip this on when they enter their run loop; foreign
//! threads keep it off and the facade falls through to the raw syscalls.

use std::cell::Cell;

thread_local! {
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

/// Enable or disable cooperative I/O for the current thread.
#[inline]
pub fn set_hook_enabled(flag: bool) {
    HOOK_ENABLED.with(|cell| cell.set(flag));
}

/// Is cooperative I/O enabled for the current thread?
#[inline]
pub fn hook_enabled() -> bool {
    HOOK_ENABLED.with(|cell| cell.get())
}
