//! # weft-core
//!
//! Ground-floor pieces of the weft runtime: lock primitives, the wall
//! clock, environment parsing, the typed config registry, the per-thread
//! hook gate and the shared error type.
//!
//! Nothing in this crate knows about fibers; everything here is safe to use
//! from any OS thread.

pub mod config;
pub mod env;
pub mod error;
pub mod hook_flag;
pub mod sync;
pub mod time;

pub use config::{Config, ConfigVar};
pub use env::{env_get, env_get_bool, env_get_opt};
pub use error::{WeftError, WeftResult};
pub use hook_flag::{hook_enabled, set_hook_enabled};
pub use sync::{Mutex, RwLock, Semaphore, SpinLock};
pub use time::{current_ms, current_us};
