//! Error types for fallible runtime operations
//!
//! Only recoverable failures live here. Contract violations (double-arming
//! an event, destroying a running fiber) are asserts, and syscall results
//! flow through errno in the I/O facade.

use thiserror::Error;

pub type WeftResult<T> = Result<T, WeftError>;

#[derive(Debug, Error)]
pub enum WeftError {
    /// `epoll_ctl` refused an arm/rearm/removal.
    #[error("epoll_ctl(op={op}, fd={fd}) failed: {source}")]
    EpollCtl {
        op: &'static str,
        fd: i32,
        #[source]
        source: std::io::Error,
    },

    /// Worker thread could not be spawned.
    #[error("failed to spawn thread {name:?}")]
    SpawnThread {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_epoll_ctl_display() {
        let e = WeftError::EpollCtl {
            op: "EPOLL_CTL_MOD",
            fd: 9,
            source: std::io::Error::from_raw_os_error(libc::EBADF),
        };
        let msg = e.to_string();
        assert!(msg.starts_with("epoll_ctl(op=EPOLL_CTL_MOD, fd=9) failed:"));
        assert!(e.source().is_some());
    }

    #[test]
    fn test_spawn_thread_display() {
        let e = WeftError::SpawnThread {
            name: "io_3".to_string(),
            source: std::io::Error::from_raw_os_error(libc::EAGAIN),
        };
        assert_eq!(e.to_string(), "failed to spawn thread \"io_3\"");
        assert!(e.source().is_some());
    }
}
