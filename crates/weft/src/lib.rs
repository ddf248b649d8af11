//! # weft: a cooperative fiber runtime
//!
//! Many lightweight stackful fibers multiplexed over a small pool of OS
//! threads, with an epoll reactor and integrated timers. Code written in a
//! straight-line blocking style runs concurrently: the I/O facade turns
//! would-block syscalls into fiber suspensions, and the reactor resumes the
//! fiber when the fd is ready, the timeout expires, or the wait is
//! cancelled.
//!
//! ## Quick start
//!
//! ```no_run
//! use weft::{hook, IoManager, ScheduleExt};
//!
//! fn main() {
//!     // Two workers plus an epoll reactor
//!     let iom = IoManager::new(2, false, "app");
//!
//!     iom.schedule(|| {
//!         // Looks blocking; suspends the fiber, not the thread
//!         hook::sleep(1);
//!         println!("one second later");
//!     });
//!
//!     iom.stop();
//! }
//! ```
//!
//! ## Pieces
//!
//! - [`Fiber`]: stackful coroutine with explicit `yield_ready` /
//!   `yield_hold` suspension points.
//! - [`Scheduler`] / [`Schedule`]: M:N work queue with optional reuse of
//!   the constructing thread (`use_caller`).
//! - [`IoManager`]: scheduler + timer manager + epoll reactor.
//! - [`hook`]: POSIX-shaped blocking-style I/O (read/write/connect/
//!   accept/sleep and friends), active on scheduler workers.
//! - [`Config`]: process-wide typed configuration registry
//!   (`fiber.stack_size`, `tcp.connect.timeout`, yours).

pub use weft_core::config::{Config, ConfigVar};
pub use weft_core::error::{WeftError, WeftResult};
pub use weft_core::sync::{Mutex, RwLock, Semaphore, SpinLock};
pub use weft_core::time::{current_ms, current_us};
pub use weft_core::{hook_enabled, set_hook_enabled};

pub use weft_runtime::scheduler::{bind_caller, current_scheduler, start, stop};
pub use weft_runtime::{Fiber, FiberState, Schedule, ScheduleExt, Scheduler, Task, Thread};

pub use weft_io::hook;
pub use weft_io::{fd_manager, Event, IoManager, Timer, TimerManager, NO_TIMEOUT};
