//! Blocking-style I/O facade
//!
//! POSIX-shaped wrappers that turn would-block conditions into fiber
//! suspensions. Call them exactly like the libc functions they mirror:
//! errors come back as `-1` with `errno` set, including `ETIMEDOUT` when a
//! per-fd timeout expires while suspended.
//!
//! Behavior is gated per-thread (see [`weft_core::hook_enabled`]): scheduler
//! workers get cooperative I/O, every other thread falls straight through to
//! libc. Calls on fds that are unknown to the registry, not sockets, or
//! explicitly set non-blocking *by the user* also fall through untouched.
//!
//! The suspension recipe for a would-block call:
//!
//! 1. optional condition timer that flags `ETIMEDOUT` and cancels the event,
//! 2. arm the fd for the needed direction with the current fiber,
//! 3. yield; on resume either surface the timeout or retry the syscall.

use crate::fd::fd_manager;
use crate::iomanager::{Event, IoManager};
use crate::timer::NO_TIMEOUT;
use libc::{c_int, c_ulong, c_void, socklen_t};
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};
use weft_core::config::Config;
use weft_core::hook_enabled;
use weft_runtime::{Fiber, ScheduleExt};

#[inline]
fn errno() -> c_int {
    unsafe { *libc::__errno_location() }
}

#[inline]
fn set_errno(v: c_int) {
    unsafe { *libc::__errno_location() = v };
}

/// Default timeout for [`connect`], fed by the `tcp.connect.timeout` config
/// key and kept current through its listener.
fn default_connect_timeout() -> u64 {
    static CURRENT_MS: AtomicI64 = AtomicI64::new(5000);
    static INIT: OnceLock<()> = OnceLock::new();
    INIT.get_or_init(|| {
        let var = Config::lookup::<i32>("tcp.connect.timeout", 5000, "tcp connect timeout");
        CURRENT_MS.store(var.value() as i64, Ordering::SeqCst);
        var.add_listener(|old, new| {
            log::info!("tcp connect timeout changed from {} to {}", old, new);
            CURRENT_MS.store(*new as i64, Ordering::SeqCst);
        });
    });
    let ms = CURRENT_MS.load(Ordering::SeqCst);
    if ms < 0 {
        NO_TIMEOUT
    } else {
        ms as u64
    }
}

/// Shared between a suspended call and its watchdog timer. A non-zero value
/// is the errno the call must surface instead of retrying.
#[derive(Default)]
struct TimerInfo {
    cancelled: AtomicI32,
}

/// The generic suspend-and-retry template shared by every read- and
/// write-like call. `fun` invokes the real syscall.
fn do_io<F>(fd: c_int, fun_name: &'static str, event: Event, timeout_kind: c_int, fun: F) -> isize
where
    F: Fn() -> isize,
{
    if !hook_enabled() {
        return fun();
    }

    let Some(ctx) = fd_manager().get(fd, false) else {
        return fun();
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return fun();
    }

    let timeout_ms = ctx.timeout(timeout_kind);
    let tinfo = Arc::new(TimerInfo::default());

    loop {
        let mut n = fun();
        while n == -1 && errno() == libc::EINTR {
            n = fun();
        }
        if !(n == -1 && errno() == libc::EAGAIN) {
            return n;
        }

        // Would block: suspend until readiness, timeout or cancellation
        let iom = IoManager::current().expect("cooperative I/O outside an I/O scheduler");

        let timer = if timeout_ms != NO_TIMEOUT {
            let winfo = Arc::downgrade(&tinfo);
            let iom2 = iom.clone();
            let cond = Arc::downgrade(&tinfo);
            Some(iom.timers().add_condition_timer(
                timeout_ms,
                move || {
                    let Some(t) = winfo.upgrade() else { return };
                    if t.cancelled.load(Ordering::Acquire) != 0 {
                        return;
                    }
                    // Publish the flag before the cancel wakes the fiber
                    t.cancelled.store(libc::ETIMEDOUT, Ordering::Release);
                    iom2.cancel_event(fd, event);
                },
                cond,
                false,
            ))
        } else {
            None
        };

        match iom.add_event(fd, event, None) {
            Err(e) => {
                log::error!("{} add_event({}, {:?}) failed: {}", fun_name, fd, event, e);
                if let Some(timer) = timer {
                    timer.cancel();
                }
                return -1;
            }
            Ok(()) => {
                Fiber::yield_hold();

                if let Some(timer) = timer {
                    timer.cancel();
                }
                let cancelled = tinfo.cancelled.load(Ordering::Acquire);
                if cancelled != 0 {
                    set_errno(cancelled);
                    return -1;
                }
                // Readiness fired: go around and retry the syscall
            }
        }
    }
}

/// Park the current fiber on a one-shot timer.
fn sleep_ms(ms: u64) {
    let iom = IoManager::current().expect("cooperative sleep outside an I/O scheduler");
    let fiber = Fiber::current();
    let iom2 = iom.clone();
    iom.timers().add_timer(
        ms,
        move || {
            iom2.schedule_fiber(fiber.clone());
        },
        false,
    );
    Fiber::yield_hold();
}

pub fn sleep(seconds: u32) -> u32 {
    if !hook_enabled() {
        return unsafe { libc::sleep(seconds) };
    }
    sleep_ms(seconds as u64 * 1000);
    0
}

pub fn usleep(usec: libc::useconds_t) -> c_int {
    if !hook_enabled() {
        return unsafe { libc::usleep(usec) };
    }
    sleep_ms(usec as u64 / 1000);
    0
}

/// `rem` is never filled in: a cooperative sleep is not interruptible by
/// signals, so the full duration always elapses.
pub fn nanosleep(req: &libc::timespec) -> c_int {
    if !hook_enabled() {
        return unsafe { libc::nanosleep(req, std::ptr::null_mut()) };
    }
    let ms = req.tv_sec as u64 * 1000 + req.tv_nsec as u64 / 1_000_000;
    sleep_ms(ms);
    0
}

/// Create a socket and register it with the fd registry.
pub fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if !hook_enabled() {
        return fd;
    }
    if fd >= 0 {
        fd_manager().get(fd, true);
    }
    fd
}

/// `connect` with an explicit timeout; [`connect`] uses the config default.
///
/// # Safety
///
/// `addr` must point to a valid sockaddr of length `addrlen`.
pub unsafe fn connect_with_timeout(
    fd: c_int,
    addr: *const libc::sockaddr,
    addrlen: socklen_t,
    timeout_ms: u64,
) -> c_int {
    if !hook_enabled() {
        return libc::connect(fd, addr, addrlen);
    }
    let Some(ctx) = fd_manager().get(fd, false) else {
        set_errno(libc::EBADF);
        return -1;
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return libc::connect(fd, addr, addrlen);
    }

    let n = libc::connect(fd, addr, addrlen);
    if n == 0 {
        return 0;
    }
    if n != -1 || errno() != libc::EINPROGRESS {
        return n;
    }

    // In progress: wait for writability, bounded by the timeout
    let iom = IoManager::current().expect("cooperative connect outside an I/O scheduler");
    let tinfo = Arc::new(TimerInfo::default());

    let timer = if timeout_ms != NO_TIMEOUT {
        let winfo = Arc::downgrade(&tinfo);
        let iom2 = iom.clone();
        let cond = Arc::downgrade(&tinfo);
        Some(iom.timers().add_condition_timer(
            timeout_ms,
            move || {
                let Some(t) = winfo.upgrade() else { return };
                if t.cancelled.load(Ordering::Acquire) != 0 {
                    return;
                }
                t.cancelled.store(libc::ETIMEDOUT, Ordering::Release);
                iom2.cancel_event(fd, Event::WRITE);
            },
            cond,
            false,
        ))
    } else {
        None
    };

    match iom.add_event(fd, Event::WRITE, None) {
        Ok(()) => {
            Fiber::yield_hold();
            if let Some(timer) = timer {
                timer.cancel();
            }
            let cancelled = tinfo.cancelled.load(Ordering::Acquire);
            if cancelled != 0 {
                set_errno(cancelled);
                return -1;
            }
        }
        Err(e) => {
            if let Some(timer) = timer {
                timer.cancel();
            }
            log::error!("connect add_event({}, WRITE) failed: {}", fd, e);
        }
    }

    // Writable (or cancelled): the real outcome is in SO_ERROR
    let mut error: c_int = 0;
    let mut len = std::mem::size_of::<c_int>() as socklen_t;
    if libc::getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut error as *mut c_int as *mut c_void,
        &mut len,
    ) == -1
    {
        return -1;
    }
    if error == 0 {
        0
    } else {
        set_errno(error);
        -1
    }
}

/// # Safety
///
/// `addr` must point to a valid sockaddr of length `addrlen`.
pub unsafe fn connect(fd: c_int, addr: *const libc::sockaddr, addrlen: socklen_t) -> c_int {
    connect_with_timeout(fd, addr, addrlen, default_connect_timeout())
}

/// # Safety
///
/// `addr`/`addrlen` must be null or valid out-pointers, as for
/// `libc::accept`.
pub unsafe fn accept(fd: c_int, addr: *mut libc::sockaddr, addrlen: *mut socklen_t) -> c_int {
    let new_fd = do_io(fd, "accept", Event::READ, libc::SO_RCVTIMEO, || {
        libc::accept(fd, addr, addrlen) as isize
    }) as c_int;
    if new_fd >= 0 {
        fd_manager().get(new_fd, true);
    }
    new_fd
}

pub fn read(fd: c_int, buf: &mut [u8]) -> isize {
    let (ptr, len) = (buf.as_mut_ptr(), buf.len());
    do_io(fd, "read", Event::READ, libc::SO_RCVTIMEO, move || unsafe {
        libc::read(fd, ptr as *mut c_void, len)
    })
}

/// # Safety
///
/// `iov` must point to `iovcnt` valid iovecs.
pub unsafe fn readv(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> isize {
    do_io(fd, "readv", Event::READ, libc::SO_RCVTIMEO, move || {
        libc::readv(fd, iov, iovcnt)
    })
}

pub fn recv(fd: c_int, buf: &mut [u8], flags: c_int) -> isize {
    let (ptr, len) = (buf.as_mut_ptr(), buf.len());
    do_io(fd, "recv", Event::READ, libc::SO_RCVTIMEO, move || unsafe {
        libc::recv(fd, ptr as *mut c_void, len, flags)
    })
}

/// # Safety
///
/// Pointer arguments as for `libc::recvfrom`.
pub unsafe fn recvfrom(
    fd: c_int,
    buf: *mut c_void,
    len: usize,
    flags: c_int,
    src_addr: *mut libc::sockaddr,
    addrlen: *mut socklen_t,
) -> isize {
    do_io(fd, "recvfrom", Event::READ, libc::SO_RCVTIMEO, move || {
        libc::recvfrom(fd, buf, len, flags, src_addr, addrlen)
    })
}

/// # Safety
///
/// `msg` must point to a valid msghdr.
pub unsafe fn recvmsg(fd: c_int, msg: *mut libc::msghdr, flags: c_int) -> isize {
    do_io(fd, "recvmsg", Event::READ, libc::SO_RCVTIMEO, move || {
        libc::recvmsg(fd, msg, flags)
    })
}

pub fn write(fd: c_int, buf: &[u8]) -> isize {
    let (ptr, len) = (buf.as_ptr(), buf.len());
    do_io(fd, "write", Event::WRITE, libc::SO_SNDTIMEO, move || unsafe {
        libc::write(fd, ptr as *const c_void, len)
    })
}

/// # Safety
///
/// `iov` must point to `iovcnt` valid iovecs.
pub unsafe fn writev(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> isize {
    do_io(fd, "writev", Event::WRITE, libc::SO_SNDTIMEO, move || {
        libc::writev(fd, iov, iovcnt)
    })
}

pub fn send(fd: c_int, buf: &[u8], flags: c_int) -> isize {
    let (ptr, len) = (buf.as_ptr(), buf.len());
    do_io(fd, "send", Event::WRITE, libc::SO_SNDTIMEO, move || unsafe {
        libc::send(fd, ptr as *const c_void, len, flags)
    })
}

/// # Safety
///
/// Pointer arguments as for `libc::sendto`.
pub unsafe fn sendto(
    fd: c_int,
    buf: *const c_void,
    len: usize,
    flags: c_int,
    to: *const libc::sockaddr,
    tolen: socklen_t,
) -> isize {
    do_io(fd, "sendto", Event::WRITE, libc::SO_SNDTIMEO, move || {
        libc::sendto(fd, buf, len, flags, to, tolen)
    })
}

/// # Safety
///
/// `msg` must point to a valid msghdr.
pub unsafe fn sendmsg(fd: c_int, msg: *const libc::msghdr, flags: c_int) -> isize {
    do_io(fd, "sendmsg", Event::WRITE, libc::SO_SNDTIMEO, move || {
        libc::sendmsg(fd, msg, flags)
    })
}

/// Close, after cancelling any armed events and dropping the registry
/// entry.
pub fn close(fd: c_int) -> c_int {
    if !hook_enabled() {
        return unsafe { libc::close(fd) };
    }
    if fd_manager().get(fd, false).is_some() {
        if let Some(iom) = IoManager::current() {
            iom.cancel_all(fd);
        }
        fd_manager().del(fd);
    }
    unsafe { libc::close(fd) }
}

/// `fcntl` for the int-argument commands. `F_SETFL`/`F_GETFL` keep the
/// user's view of `O_NONBLOCK` separate from the forced system state;
/// pointer-argument commands (`F_SETLK`...) should go to libc directly.
pub fn fcntl(fd: c_int, cmd: c_int, arg: c_int) -> c_int {
    match cmd {
        libc::F_SETFL => {
            let mut arg = arg;
            match fd_manager().get(fd, false) {
                Some(ctx) if !ctx.is_closed() && ctx.is_socket() => {
                    ctx.set_user_nonblock(arg & libc::O_NONBLOCK != 0);
                    // The fd stays non-blocking underneath regardless
                    if ctx.sys_nonblock() {
                        arg |= libc::O_NONBLOCK;
                    } else {
                        arg &= !libc::O_NONBLOCK;
                    }
                    unsafe { libc::fcntl(fd, cmd, arg) }
                }
                _ => unsafe { libc::fcntl(fd, cmd, arg) },
            }
        }
        libc::F_GETFL => {
            let flags = unsafe { libc::fcntl(fd, cmd) };
            match fd_manager().get(fd, false) {
                Some(ctx) if !ctx.is_closed() && ctx.is_socket() => {
                    if ctx.user_nonblock() {
                        flags | libc::O_NONBLOCK
                    } else {
                        flags & !libc::O_NONBLOCK
                    }
                }
                _ => flags,
            }
        }
        _ => unsafe { libc::fcntl(fd, cmd, arg) },
    }
}

/// # Safety
///
/// `arg` must be valid for `request`, as for `libc::ioctl`.
pub unsafe fn ioctl(fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
    if request == libc::FIONBIO as c_ulong {
        let user_nonblock = *(arg as *mut c_int) != 0;
        if let Some(ctx) = fd_manager().get(fd, false) {
            if !ctx.is_closed() && ctx.is_socket() {
                ctx.set_user_nonblock(user_nonblock);
            }
        }
    }
    libc::ioctl(fd, request, arg)
}

/// # Safety
///
/// Pointer arguments as for `libc::getsockopt`.
pub unsafe fn getsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *mut c_void,
    optlen: *mut socklen_t,
) -> c_int {
    libc::getsockopt(fd, level, optname, optval, optlen)
}

/// `setsockopt`, mirroring `SO_RCVTIMEO`/`SO_SNDTIMEO` into the registry so
/// suspended calls can enforce them.
///
/// # Safety
///
/// Pointer arguments as for `libc::setsockopt`.
pub unsafe fn setsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> c_int {
    if hook_enabled()
        && level == libc::SOL_SOCKET
        && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
    {
        if let Some(ctx) = fd_manager().get(fd, false) {
            let tv = &*(optval as *const libc::timeval);
            ctx.set_timeout(optname, tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000);
        }
    }
    libc::setsockopt(fd, level, optname, optval, optlen)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_thread_delegates() {
        assert!(!hook_enabled());

        let mut fds = [0 as c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        assert_eq!(write(fds[1], b"x"), 1);
        let mut buf = [0u8; 4];
        assert_eq!(read(fds[0], &mut buf), 1);
        assert_eq!(buf[0], b'x');

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_fcntl_hides_forced_nonblock() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);
        fd_manager().get(fd, true);

        // The registry forced O_NONBLOCK on, but the user never asked
        let visible = fcntl(fd, libc::F_GETFL, 0);
        assert_eq!(visible & libc::O_NONBLOCK, 0);
        let real = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        assert_ne!(real & libc::O_NONBLOCK, 0);

        // User opts in: now it is visible, and the fd stays non-blocking
        fcntl(fd, libc::F_SETFL, visible | libc::O_NONBLOCK);
        assert_ne!(fcntl(fd, libc::F_GETFL, 0) & libc::O_NONBLOCK, 0);

        // User opts back out: hidden again, system state untouched
        fcntl(fd, libc::F_SETFL, visible);
        assert_eq!(fcntl(fd, libc::F_GETFL, 0) & libc::O_NONBLOCK, 0);
        let real = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        assert_ne!(real & libc::O_NONBLOCK, 0);

        fd_manager().del(fd);
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_ioctl_fionbio_tracks_user_intent() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);
        let ctx = fd_manager().get(fd, true).unwrap();

        let mut on: c_int = 1;
        assert_eq!(
            unsafe { ioctl(fd, libc::FIONBIO as c_ulong, &mut on as *mut c_int as *mut c_void) },
            0
        );
        assert!(ctx.user_nonblock());

        let mut off: c_int = 0;
        assert_eq!(
            unsafe { ioctl(fd, libc::FIONBIO as c_ulong, &mut off as *mut c_int as *mut c_void) },
            0
        );
        assert!(!ctx.user_nonblock());

        fd_manager().del(fd);
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_setsockopt_mirrors_timeouts() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);
        let ctx = fd_manager().get(fd, true).unwrap();

        weft_core::set_hook_enabled(true);
        let tv = libc::timeval {
            tv_sec: 1,
            tv_usec: 500_000,
        };
        let rt = unsafe {
            setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const libc::timeval as *const c_void,
                std::mem::size_of::<libc::timeval>() as socklen_t,
            )
        };
        weft_core::set_hook_enabled(false);

        assert_eq!(rt, 0);
        assert_eq!(ctx.timeout(libc::SO_RCVTIMEO), 1500);

        fd_manager().del(fd);
        unsafe { libc::close(fd) };
    }
}
