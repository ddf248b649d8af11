//! # weft-io
//!
//! The I/O side of the weft runtime: a deadline-ordered timer set, an
//! epoll reactor that extends the scheduler, the per-fd registry, and the
//! blocking-style I/O facade that turns would-block syscalls into fiber
//! suspensions.
//!
//! ```no_run
//! use weft_io::{hook, IoManager};
//! use weft_runtime::ScheduleExt;
//!
//! let iom = IoManager::new(2, false, "io");
//! iom.schedule(|| {
//!     // Straight-line blocking style; the worker thread never blocks
//!     hook::sleep(1);
//! });
//! iom.stop();
//! ```

pub mod fd;
pub mod hook;
pub mod iomanager;
pub mod timer;

pub use fd::{fd_manager, FdEntry, FdManager};
pub use iomanager::{Event, IoManager};
pub use timer::{Timer, TimerManager, TimerTickle, NO_TIMEOUT};
