//! TCP echo server in straight-line blocking style.
//!
//! Every connection gets its own fiber; the accept loop is a fiber too.
//! None of them ever block a worker thread: the facade suspends them on
//! would-block and the reactor resumes them on readiness.
//!
//! Usage: weft-echo [port] [workers]   (defaults: 7777, 2)

use std::mem;
use weft::{hook, IoManager, ScheduleExt};

fn listen(port: u16) -> libc::c_int {
    let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
    assert!(fd >= 0, "socket failed");

    let one: libc::c_int = 1;
    unsafe {
        hook::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }

    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_port = port.to_be();
    addr.sin_addr.s_addr = libc::INADDR_ANY.to_be();

    let rt = unsafe {
        libc::bind(
            fd,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    assert_eq!(rt, 0, "bind failed: {}", std::io::Error::last_os_error());
    assert_eq!(unsafe { libc::listen(fd, 1024) }, 0);
    fd
}

fn serve_connection(fd: libc::c_int) {
    let mut buf = [0u8; 4096];
    loop {
        let n = hook::read(fd, &mut buf);
        if n <= 0 {
            break;
        }
        let mut sent = 0usize;
        while sent < n as usize {
            let m = hook::write(fd, &buf[sent..n as usize]);
            if m <= 0 {
                hook::close(fd);
                return;
            }
            sent += m as usize;
        }
    }
    hook::close(fd);
}

fn main() {
    let mut args = std::env::args().skip(1);
    let port: u16 = args.next().and_then(|a| a.parse().ok()).unwrap_or(7777);
    let workers: usize = args.next().and_then(|a| a.parse().ok()).unwrap_or(2);

    log::info!("echo server on 0.0.0.0:{} ({} workers)", port, workers);

    let iom = IoManager::new(workers, true, "echo");
    let accept_iom = iom.clone();
    iom.schedule(move || {
        let listener = listen(port);
        loop {
            let client = unsafe { hook::accept(listener, std::ptr::null_mut(), std::ptr::null_mut()) };
            if client < 0 {
                log::error!("accept failed: {}", std::io::Error::last_os_error());
                break;
            }
            accept_iom.schedule(move || serve_connection(client));
        }
    });

    // The accept fiber keeps an event armed at all times, so this drains
    // forever: the server runs until killed
    iom.stop();
}
