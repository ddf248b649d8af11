//! Worker thread wrapper
//!
//! Thin layer over `std::thread` that names the thread, records its kernel
//! tid (the id task pinning compares against), and holds the spawner on a
//! semaphore until the new thread is actually running.

use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use weft_core::sync::Semaphore;
use weft_core::{WeftError, WeftResult};

thread_local! {
    static TID: Cell<i64> = const { Cell::new(-1) };
    static NAME: RefCell<String> = const { RefCell::new(String::new()) };
}

/// Kernel thread id of the calling thread, cached after the first call.
#[inline]
pub fn tid() -> i64 {
    TID.with(|cell| {
        let cached = cell.get();
        if cached != -1 {
            return cached;
        }
        let id = unsafe { libc::syscall(libc::SYS_gettid) as i64 };
        cell.set(id);
        id
    })
}

/// Name of the calling thread ("" when never set).
pub fn name() -> String {
    NAME.with(|cell| cell.borrow().clone())
}

/// Set the calling thread's name, visible to [`name`] and log lines.
pub fn set_name(name: &str) {
    NAME.with(|cell| *cell.borrow_mut() = name.to_string());
}

/// A named, joinable worker thread.
pub struct Thread {
    name: String,
    tid: i64,
    handle: Option<JoinHandle<()>>,
}

impl Thread {
    /// Spawn a named thread and wait until it is running.
    ///
    /// On return the thread has published its tid and name, so the spawner
    /// can immediately use [`Thread::tid`] for pinning.
    pub fn spawn<F>(name: &str, f: F) -> WeftResult<Thread>
    where
        F: FnOnce() + Send + 'static,
    {
        let started = Arc::new(Semaphore::new(0));
        let tid_slot = Arc::new(AtomicI64::new(-1));

        let thread_name = name.to_string();
        let started2 = started.clone();
        let tid_slot2 = tid_slot.clone();

        let handle = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                set_name(&thread_name);
                tid_slot2.store(tid(), Ordering::Release);
                started2.post();
                f();
            })
            .map_err(|source| WeftError::SpawnThread {
                name: name.to_string(),
                source,
            })?;

        started.wait();
        Ok(Thread {
            name: name.to_string(),
            tid: tid_slot.load(Ordering::Acquire),
            handle: Some(handle),
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kernel tid of the spawned thread.
    #[inline]
    pub fn tid(&self) -> i64 {
        self.tid
    }

    /// Wait for the thread to finish.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tid_is_stable() {
        let a = tid();
        let b = tid();
        assert_eq!(a, b);
        assert!(a > 0);
    }

    #[test]
    fn test_spawn_publishes_identity() {
        let t = Thread::spawn("weft-test-worker", || {
            assert_eq!(name(), "weft-test-worker");
        })
        .unwrap();
        assert_eq!(t.name(), "weft-test-worker");
        assert!(t.tid() > 0);
        assert_ne!(t.tid(), tid());
        t.join();
    }

    #[test]
    fn test_tids_differ_across_threads() {
        let mine = tid();
        let theirs = std::thread::spawn(tid).join().unwrap();
        assert_ne!(mine, theirs);
    }
}
