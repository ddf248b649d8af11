//! Machine-level context switching
//!
//! A fiber's machine state is a [`Context`]: the callee-saved registers plus
//! a resume address and stack pointer. Switching fibers is a plain function
//! call into naked assembly, so only the registers the ABI makes the callee
//! preserve need to be saved.
//!
//! Contract shared by all architectures:
//!
//! - `init_context(ctx, stack_top, entry, arg)` prepares `ctx` so that the
//!   first switch into it runs `entry(arg)` on the given stack. `entry` must
//!   never return; the fiber trampoline switches away instead.
//! - `context_switch(old, new)` saves the running state into `old` and
//!   resumes `new`. A later switch back into `old` continues right after the
//!   call.

#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use x86_64::{context_switch, init_context, Context};

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "aarch64")]
pub use aarch64::{context_switch, init_context, Context};

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("weft only supports x86_64 and aarch64");
