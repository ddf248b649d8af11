//! x86_64 context switching
//!
//! Inline naked assembly, stable since Rust 1.88.

use std::arch::naked_asm;

/// Callee-saved machine state of a suspended fiber.
///
/// Field order is fixed: the assembly below addresses the struct by byte
/// offset.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Context {
    pub rsp: u64, // 0x00
    pub rip: u64, // 0x08
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
}

impl Context {
    pub const fn new() -> Self {
        Self {
            rsp: 0,
            rip: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }
}

/// Prepare a fresh context that will run `entry(arg)` on `stack_top`.
///
/// # Safety
///
/// `ctx` must point to writable `Context` memory and `stack_top` must be the
/// one-past-the-end address of a live stack allocation.
#[inline]
pub unsafe fn init_context(
    ctx: *mut Context,
    stack_top: *mut u8,
    entry: extern "C" fn(usize),
    arg: usize,
) {
    // System V: rsp must be 16-byte aligned at the `call` in the trampoline
    let aligned_sp = (stack_top as usize) & !0xF;

    let ctx = &mut *ctx;
    ctx.rsp = aligned_sp as u64;
    ctx.rip = entry_trampoline as usize as u64;
    ctx.rbx = 0;
    ctx.rbp = 0;
    ctx.r12 = entry as usize as u64; // entry function
    ctx.r13 = arg as u64; // entry argument
    ctx.r14 = 0;
    ctx.r15 = 0;
}

/// First-switch landing pad: calls `entry(arg)` from the callee-saved
/// registers `init_context` planted. The entry function switches away and
/// never returns; `ud2` traps if it ever does.
#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!("mov rdi, r13", "call r12", "ud2",);
}

/// Save the running context into `old` and resume `new`.
///
/// # Safety
///
/// `old` must be writable, `new` must hold a context produced by
/// `init_context` or a previous save, and `new`'s stack must be live.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_old: *mut Context, _new: *const Context) {
    naked_asm!(
        // Save callee-saved registers into old (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load callee-saved registers from new (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        // Jump to the resume address
        "jmp rax",
        // Resume point for the saved context
        "1:",
        "ret",
    );
}
