//! File descriptor registry
//!
//! Every fd the I/O facade touches gets a lazily-created [`FdEntry`]. On
//! creation the fd is probed with `fstat`; sockets are forced into
//! non-blocking mode at the system level, while the *user's* non-blocking
//! request is tracked separately so `fcntl`/`ioctl` can keep lying
//! consistently about `O_NONBLOCK`.

use crate::timer::NO_TIMEOUT;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use weft_core::sync::RwLock;

/// Cached per-fd state.
pub struct FdEntry {
    fd: RawFd,
    is_init: AtomicBool,
    is_socket: AtomicBool,
    sys_nonblock: AtomicBool,
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    /// ms, [`NO_TIMEOUT`] = none
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdEntry {
    fn new(fd: RawFd) -> FdEntry {
        let entry = FdEntry {
            fd,
            is_init: AtomicBool::new(false),
            is_socket: AtomicBool::new(false),
            sys_nonblock: AtomicBool::new(false),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(NO_TIMEOUT),
            send_timeout_ms: AtomicU64::new(NO_TIMEOUT),
        };
        entry.init();
        entry
    }

    /// Probe the fd and force sockets non-blocking at the system level.
    fn init(&self) {
        if self.is_init.load(Ordering::Acquire) {
            return;
        }

        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        let rt = unsafe { libc::fstat(self.fd, &mut stat) };
        if rt != 0 {
            // Not a live fd; leave the entry unprobed
            return;
        }
        self.is_init.store(true, Ordering::Release);

        let is_socket = stat.st_mode & libc::S_IFMT == libc::S_IFSOCK;
        self.is_socket.store(is_socket, Ordering::Release);

        if is_socket {
            let flags = unsafe { libc::fcntl(self.fd, libc::F_GETFL, 0) };
            if flags & libc::O_NONBLOCK == 0 {
                unsafe { libc::fcntl(self.fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
            }
            self.sys_nonblock.store(true, Ordering::Release);
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn is_init(&self) -> bool {
        self.is_init.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_socket(&self) -> bool {
        self.is_socket.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[inline]
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Acquire)
    }

    #[inline]
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_user_nonblock(&self, flag: bool) {
        self.user_nonblock.store(flag, Ordering::Release);
    }

    /// Mirror of `SO_RCVTIMEO`/`SO_SNDTIMEO`, consulted by the facade.
    pub fn set_timeout(&self, kind: libc::c_int, ms: u64) {
        if kind == libc::SO_RCVTIMEO {
            self.recv_timeout_ms.store(ms, Ordering::Release);
        } else {
            self.send_timeout_ms.store(ms, Ordering::Release);
        }
    }

    pub fn timeout(&self, kind: libc::c_int) -> u64 {
        if kind == libc::SO_RCVTIMEO {
            self.recv_timeout_ms.load(Ordering::Acquire)
        } else {
            self.send_timeout_ms.load(Ordering::Acquire)
        }
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Dense registry of [`FdEntry`]s, indexed by fd and grown ×1.5 on demand.
pub struct FdManager {
    datas: RwLock<Vec<Option<Arc<FdEntry>>>>,
}

impl FdManager {
    fn new() -> FdManager {
        FdManager {
            datas: RwLock::new(vec![None; 64]),
        }
    }

    /// Fetch the entry for `fd`, creating it when `auto_create` is set.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdEntry>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;
        {
            let datas = self.datas.read();
            match datas.get(idx) {
                Some(Some(entry)) => return Some(entry.clone()),
                _ if !auto_create => return None,
                _ => {}
            }
        }

        let mut datas = self.datas.write();
        if idx >= datas.len() {
            datas.resize(idx * 3 / 2 + 1, None);
        }
        if let Some(entry) = &datas[idx] {
            return Some(entry.clone());
        }
        let entry = Arc::new(FdEntry::new(fd));
        datas[idx] = Some(entry.clone());
        Some(entry)
    }

    /// Forget the fd (on close). Outstanding handles see it as closed.
    pub fn del(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut datas = self.datas.write();
        if let Some(slot) = datas.get_mut(fd as usize) {
            if let Some(entry) = slot.take() {
                entry.mark_closed();
            }
        }
    }
}

/// Process-wide registry singleton.
pub fn fd_manager() -> &'static FdManager {
    static MANAGER: OnceLock<FdManager> = OnceLock::new();
    MANAGER.get_or_init(FdManager::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipe_is_not_a_socket() {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        let mgr = FdManager::new();
        let entry = mgr.get(fds[0], true).unwrap();
        assert!(entry.is_init());
        assert!(!entry.is_socket());
        assert!(!entry.sys_nonblock());

        // A pipe is left alone: still blocking at the system level
        let flags = unsafe { libc::fcntl(fds[0], libc::F_GETFL, 0) };
        assert_eq!(flags & libc::O_NONBLOCK, 0);

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_socket_forced_nonblocking() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);

        let mgr = FdManager::new();
        let entry = mgr.get(fd, true).unwrap();
        assert!(entry.is_socket());
        assert!(entry.sys_nonblock());
        assert!(!entry.user_nonblock());

        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        assert_ne!(flags & libc::O_NONBLOCK, 0);

        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_get_without_auto_create() {
        let mgr = FdManager::new();
        assert!(mgr.get(10, false).is_none());
        assert!(mgr.get(-1, true).is_none());
    }

    #[test]
    fn test_growth_and_same_entry() {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        let mgr = FdManager::new();
        let a = mgr.get(fds[0], true).unwrap();
        let b = mgr.get(fds[0], true).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_del_marks_closed() {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        let mgr = FdManager::new();
        let entry = mgr.get(fds[0], true).unwrap();
        mgr.del(fds[0]);

        assert!(entry.is_closed());
        assert!(mgr.get(fds[0], false).is_none());

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_timeout_mirror() {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        let mgr = FdManager::new();
        let entry = mgr.get(fds[0], true).unwrap();
        assert_eq!(entry.timeout(libc::SO_RCVTIMEO), NO_TIMEOUT);

        entry.set_timeout(libc::SO_RCVTIMEO, 1500);
        entry.set_timeout(libc::SO_SNDTIMEO, 2500);
        assert_eq!(entry.timeout(libc::SO_RCVTIMEO), 1500);
        assert_eq!(entry.timeout(libc::SO_SNDTIMEO), 2500);

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
