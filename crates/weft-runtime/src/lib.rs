//! # weft-runtime
//!
//! Stackful fibers multiplexed over a small worker pool.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                     User code                        │
//! │        schedule(), yield_ready(), yield_hold()       │
//! └──────────────────────────────────────────────────────┘
//!                          │
//!                          ▼
//! ┌──────────────────────────────────────────────────────┐
//! │                     Scheduler                        │
//! │      shared task FIFO, pin filter, idle fibers       │
//! └──────────────────────────────────────────────────────┘
//!            │                │                │
//!            ▼                ▼                ▼
//!      ┌──────────┐     ┌──────────┐     ┌──────────┐
//!      │  Worker  │     │  Worker  │     │  caller  │
//!      │  thread  │     │  thread  │     │ (opt-in) │
//!      └──────────┘     └──────────┘     └──────────┘
//!            │                │                │
//!            └────── arch::context_switch ─────┘
//! ```
//!
//! The I/O reactor lives in `weft-io`; it plugs in through the
//! [`Schedule`] trait.

pub mod arch;
pub mod fiber;
pub mod scheduler;
pub mod thread;

pub use fiber::{Fiber, FiberState};
pub use scheduler::{
    bind_caller, current_scheduler, start, stop, Schedule, ScheduleExt, Scheduler, Task,
};
pub use thread::Thread;
