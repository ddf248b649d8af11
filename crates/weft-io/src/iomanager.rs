//! epoll-driven I/O manager
//!
//! An [`IoManager`] is a [`Scheduler`] whose idle fiber runs an epoll
//! reactor. Fibers (or plain callbacks) are armed on a file descriptor for
//! READ or WRITE readiness; when epoll reports the fd (or a timeout/cancel
//! path fires first) the stored task is pushed back onto the ready queue.
//!
//! Events are armed edge-triggered and one-shot: `trigger_event` clears the
//! armed bit *before* handing the task off, so a handler that re-arms from
//! inside its wakeup sees a clean mask.
//!
//! The reactor sleeps in `epoll_wait`, bounded by the next timer deadline
//! (capped at 3 s). A byte written to the wake pipe interrupts the sleep
//! whenever work arrives or a timer becomes the new head.

use crate::timer::{TimerManager, TimerTickle, NO_TIMEOUT};
use std::any::Any;
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use weft_core::sync::{Mutex, RwLock};
use weft_core::{WeftError, WeftResult};
use weft_runtime::scheduler::{self, Schedule, Task};
use weft_runtime::{Fiber, FiberState, Scheduler};

/// Readiness directions, a subset of the epoll bits.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Event(u32);

impl Event {
    pub const NONE: Event = Event(0);
    pub const READ: Event = Event(libc::EPOLLIN as u32);
    pub const WRITE: Event = Event(libc::EPOLLOUT as u32);

    #[inline]
    pub fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn contains(self, other: Event) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl Default for Event {
    fn default() -> Self {
        Event::NONE
    }
}

impl BitOr for Event {
    type Output = Event;
    fn bitor(self, rhs: Event) -> Event {
        Event(self.0 | rhs.0)
    }
}

impl BitOrAssign for Event {
    fn bitor_assign(&mut self, rhs: Event) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Event {
    type Output = Event;
    fn bitand(self, rhs: Event) -> Event {
        Event(self.0 & rhs.0)
    }
}

impl Not for Event {
    type Output = Event;
    fn not(self) -> Event {
        Event(!self.0 & (Event::READ.0 | Event::WRITE.0))
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.contains(Event::READ), self.contains(Event::WRITE)) {
            (true, true) => write!(f, "READ|WRITE"),
            (true, false) => write!(f, "READ"),
            (false, true) => write!(f, "WRITE"),
            (false, false) => write!(f, "NONE"),
        }
    }
}

type EventCallback = Box<dyn FnOnce() + Send>;

/// What to wake when one direction fires: the scheduler that armed it plus
/// either a fiber or a callback.
#[derive(Default)]
struct EventContext {
    scheduler: Option<Weak<dyn Schedule>>,
    fiber: Option<Arc<Fiber>>,
    cb: Option<EventCallback>,
}

impl EventContext {
    fn is_empty(&self) -> bool {
        self.scheduler.is_none() && self.fiber.is_none() && self.cb.is_none()
    }

    fn clear(&mut self) {
        self.scheduler = None;
        self.fiber = None;
        self.cb = None;
    }
}

#[derive(Default)]
struct FdContextInner {
    /// Currently armed directions. A direction's context is populated iff
    /// its bit is set here.
    events: Event,
    read: EventContext,
    write: EventContext,
}

/// Per-fd state, indexed by fd number in a dense table.
pub struct FdContext {
    fd: RawFd,
    inner: Mutex<FdContextInner>,
}

impl FdContext {
    fn new(fd: RawFd) -> FdContext {
        FdContext {
            fd,
            inner: Mutex::new(FdContextInner::default()),
        }
    }

    /// Clear the armed bit, then push the stored fiber/callback onto its
    /// scheduler. Clearing first is what makes re-arming from inside the
    /// wakeup safe.
    fn trigger(&self, inner: &mut FdContextInner, event: Event) {
        assert!(
            inner.events.contains(event),
            "trigger of unarmed event {:?} on fd {}",
            event,
            self.fd
        );
        inner.events = inner.events & !event;

        let ctx = if event == Event::READ {
            &mut inner.read
        } else {
            &mut inner.write
        };
        if let Some(sched) = ctx.scheduler.take().and_then(|weak| weak.upgrade()) {
            if let Some(cb) = ctx.cb.take() {
                sched.schedule_task(Task::from_cb(cb, -1));
            } else if let Some(fiber) = ctx.fiber.take() {
                sched.schedule_task(Task::from_fiber(fiber, -1));
            }
        }
        ctx.clear();
    }
}

/// Scheduler + timer manager + epoll reactor.
pub struct IoManager {
    sched: Scheduler,
    timers: TimerManager,
    epfd: RawFd,
    /// `[read end, write end]`; one byte on the pipe is a tickle.
    tickle_fds: [RawFd; 2],
    /// Armed-but-unfired events (the wake pipe is not counted).
    pending_event_count: AtomicUsize,
    fd_contexts: RwLock<Vec<Arc<FdContext>>>,
}

const MAX_EVENTS: usize = 256;
const MAX_TIMEOUT_MS: u64 = 3000;

impl IoManager {
    /// Build the reactor and start its workers.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<IoManager> {
        let epfd = unsafe { libc::epoll_create(5000) };
        assert!(epfd >= 0, "epoll_create failed: {}", errno());

        let mut fds = [0 as RawFd; 2];
        let rt = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rt, 0, "pipe failed: {}", errno());

        // Wake pipe: read end non-blocking, registered edge-triggered
        let rt = unsafe { libc::fcntl(fds[0], libc::F_SETFL, libc::O_NONBLOCK) };
        assert_eq!(rt, 0, "fcntl(wake pipe) failed: {}", errno());

        let mut event = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: fds[0] as u64,
        };
        let rt = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, fds[0], &mut event) };
        assert_eq!(rt, 0, "epoll_ctl(wake pipe) failed: {}", errno());

        let iom = Arc::new(IoManager {
            sched: Scheduler::new(threads, use_caller, name),
            timers: TimerManager::new(),
            epfd,
            tickle_fds: fds,
            pending_event_count: AtomicUsize::new(0),
            fd_contexts: RwLock::new(Vec::new()),
        });
        iom.grow_contexts(32);

        iom.timers
            .bind_front_hook(Arc::downgrade(&iom) as Weak<dyn TimerTickle>);

        let dyn_self: Arc<dyn Schedule> = iom.clone();
        scheduler::bind_caller(&dyn_self);
        scheduler::start(&dyn_self);
        iom
    }

    /// The I/O manager owning the current worker thread.
    pub fn current() -> Option<Arc<IoManager>> {
        scheduler::current_scheduler()?
            .as_any()
            .downcast::<IoManager>()
            .ok()
    }

    pub fn timers(&self) -> &TimerManager {
        &self.timers
    }

    /// Armed events that have not fired yet.
    pub fn pending_events(&self) -> usize {
        self.pending_event_count.load(Ordering::SeqCst)
    }

    /// Drain the queue and join the workers. Must run on the constructing
    /// thread when `use_caller` was set.
    pub fn stop(self: &Arc<Self>) {
        let dyn_self: Arc<dyn Schedule> = self.clone();
        scheduler::stop(&dyn_self);
    }

    fn grow_contexts(&self, size: usize) {
        let mut table = self.fd_contexts.write();
        for fd in table.len()..size {
            table.push(Arc::new(FdContext::new(fd as RawFd)));
        }
    }

    /// Context for `fd`, growing the table ×1.5 when the fd is outside it.
    fn fd_context(&self, fd: RawFd) -> Arc<FdContext> {
        assert!(fd >= 0, "negative fd");
        {
            let table = self.fd_contexts.read();
            if let Some(ctx) = table.get(fd as usize) {
                return ctx.clone();
            }
        }
        self.grow_contexts(fd as usize * 3 / 2 + 1);
        self.fd_contexts.read()[fd as usize].clone()
    }

    /// Arm `event` on `fd`. With no callback the current fiber is stored
    /// and will be re-scheduled on readiness; it must be the one executing.
    ///
    /// Arming a direction twice on the same fd is a contract violation.
    pub fn add_event(&self, fd: RawFd, event: Event, cb: Option<EventCallback>) -> WeftResult<()> {
        let fd_ctx = self.fd_context(fd);
        let mut inner = fd_ctx.inner.lock();

        if inner.events.contains(event) {
            log::error!(
                "add_event: fd={} event={:?} already armed (mask {:?})",
                fd,
                event,
                inner.events
            );
            panic!("event {:?} double-armed on fd {}", event, fd);
        }

        let op = if inner.events.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut ep_event = libc::epoll_event {
            events: libc::EPOLLET as u32 | inner.events.bits() | event.bits(),
            u64: fd as u64,
        };
        let rt = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ep_event) };
        if rt != 0 {
            let source = std::io::Error::last_os_error();
            log::error!(
                "epoll_ctl({}, {}, {}, {:?}) failed: {}",
                self.epfd,
                op_name(op),
                fd,
                event,
                source
            );
            return Err(WeftError::EpollCtl {
                op: op_name(op),
                fd,
                source,
            });
        }

        self.pending_event_count.fetch_add(1, Ordering::SeqCst);
        inner.events |= event;

        let ctx = if event == Event::READ {
            &mut inner.read
        } else {
            &mut inner.write
        };
        assert!(ctx.is_empty(), "stale event context on fd {}", fd);

        let sched = scheduler::current_scheduler()
            .expect("add_event called outside a scheduler worker");
        ctx.scheduler = Some(Arc::downgrade(&sched));
        match cb {
            Some(cb) => ctx.cb = Some(cb),
            None => {
                let fiber = Fiber::current();
                assert_eq!(
                    fiber.state(),
                    FiberState::Exec,
                    "add_event from a non-running fiber"
                );
                ctx.fiber = Some(fiber);
            }
        }
        Ok(())
    }

    /// Disarm one direction without waking anyone.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(fd_ctx) = self.lookup_context(fd) else {
            return false;
        };
        let mut inner = fd_ctx.inner.lock();
        if !inner.events.contains(event) {
            return false;
        }

        let left = inner.events & !event;
        if !self.rearm(fd, left) {
            return false;
        }

        self.pending_event_count.fetch_sub(1, Ordering::SeqCst);
        inner.events = left;
        let ctx = if event == Event::READ {
            &mut inner.read
        } else {
            &mut inner.write
        };
        ctx.clear();
        true
    }

    /// Disarm one direction and fire its stored task. Timeout paths use
    /// this to wake the blocked fiber with the flag already set.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(fd_ctx) = self.lookup_context(fd) else {
            return false;
        };
        let mut inner = fd_ctx.inner.lock();
        if !inner.events.contains(event) {
            return false;
        }

        let left = inner.events & !event;
        if !self.rearm(fd, left) {
            return false;
        }

        fd_ctx.trigger(&mut inner, event);
        self.pending_event_count.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Disarm everything on `fd`, firing both directions.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(fd_ctx) = self.lookup_context(fd) else {
            return false;
        };
        let mut inner = fd_ctx.inner.lock();
        if inner.events.is_empty() {
            return false;
        }

        if !self.rearm(fd, Event::NONE) {
            return false;
        }

        if inner.events.contains(Event::READ) {
            fd_ctx.trigger(&mut inner, Event::READ);
            self.pending_event_count.fetch_sub(1, Ordering::SeqCst);
        }
        if inner.events.contains(Event::WRITE) {
            fd_ctx.trigger(&mut inner, Event::WRITE);
            self.pending_event_count.fetch_sub(1, Ordering::SeqCst);
        }

        assert!(inner.events.is_empty());
        true
    }

    fn lookup_context(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        self.fd_contexts.read().get(fd as usize).cloned()
    }

    /// MOD to the remaining mask or DEL when nothing is left.
    fn rearm(&self, fd: RawFd, left: Event) -> bool {
        let op = if left.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut ep_event = libc::epoll_event {
            events: libc::EPOLLET as u32 | left.bits(),
            u64: fd as u64,
        };
        let rt = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ep_event) };
        if rt != 0 {
            log::error!(
                "epoll_ctl({}, {}, {}, {:?}) failed: {}",
                self.epfd,
                op_name(op),
                fd,
                left,
                std::io::Error::last_os_error()
            );
            return false;
        }
        true
    }

    /// Reactor exit test; also reports the epoll budget for this round.
    fn stopping_with_timeout(&self) -> (bool, u64) {
        let next_timeout = self.timers.next_timer();
        let stop = next_timeout == NO_TIMEOUT
            && self.pending_events() == 0
            && self.sched.base_stopping();
        (stop, next_timeout)
    }
}

fn op_name(op: libc::c_int) -> &'static str {
    match op {
        libc::EPOLL_CTL_ADD => "EPOLL_CTL_ADD",
        libc::EPOLL_CTL_MOD => "EPOLL_CTL_MOD",
        libc::EPOLL_CTL_DEL => "EPOLL_CTL_DEL",
        _ => "EPOLL_CTL_?",
    }
}

#[inline]
fn errno() -> libc::c_int {
    unsafe { *libc::__errno_location() }
}

impl TimerTickle for IoManager {
    /// A timer became the earliest deadline: the reactor's `epoll_wait`
    /// budget is stale, wake it up.
    fn on_timer_inserted_at_front(&self) {
        self.tickle();
    }
}

impl Schedule for IoManager {
    fn base(&self) -> &Scheduler {
        &self.sched
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    /// One byte on the wake pipe. Skipped when every worker is busy: a
    /// busy worker re-checks the queue on its own.
    fn tickle(&self) {
        if !self.sched.has_idle_threads() {
            return;
        }
        let rt = unsafe { libc::write(self.tickle_fds[1], b"T".as_ptr().cast(), 1) };
        assert_eq!(rt, 1, "wake pipe write failed: {}", errno());
    }

    fn stopping(&self) -> bool {
        self.stopping_with_timeout().0
    }

    /// The reactor. Runs inside each worker's idle fiber; every iteration
    /// ends with a yield so the worker can drain whatever was scheduled.
    fn idle(&self) {
        log::debug!("{} reactor idle", self.sched.name());
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        let mut cbs: Vec<crate::timer::TimerCallback> = Vec::new();

        loop {
            let (stop, next_timeout) = self.stopping_with_timeout();
            if stop {
                log::info!("{} reactor exit", self.sched.name());
                break;
            }

            let ready = loop {
                let wait_ms = if next_timeout != NO_TIMEOUT {
                    next_timeout.min(MAX_TIMEOUT_MS)
                } else {
                    MAX_TIMEOUT_MS
                } as libc::c_int;

                let rt = unsafe {
                    libc::epoll_wait(self.epfd, events.as_mut_ptr(), MAX_EVENTS as i32, wait_ms)
                };
                if rt < 0 && errno() == libc::EINTR {
                    continue;
                }
                break rt;
            };

            // Timer expiries go first, before this round's I/O events
            self.timers.list_expired(&mut cbs);
            if !cbs.is_empty() {
                let tasks = cbs
                    .drain(..)
                    .map(|cb| Task::from_cb(move || cb(), -1))
                    .collect();
                self.schedule_batch(tasks);
            }

            for i in 0..ready.max(0) as usize {
                let ep_event = events[i];

                if ep_event.u64 == self.tickle_fds[0] as u64 {
                    // Edge-triggered: drain every pending byte
                    let mut dummy = [0u8; 256];
                    while unsafe {
                        libc::read(self.tickle_fds[0], dummy.as_mut_ptr().cast(), dummy.len())
                    } > 0
                    {}
                    continue;
                }

                let fd = ep_event.u64 as RawFd;
                let Some(fd_ctx) = self.lookup_context(fd) else {
                    continue;
                };
                let mut inner = fd_ctx.inner.lock();

                let mut bits = ep_event.events;
                // An error/hangup wakes whatever is armed on the fd
                if bits & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                    bits |= (libc::EPOLLIN | libc::EPOLLOUT) as u32 & inner.events.bits();
                }

                let mut real = Event::NONE;
                if bits & libc::EPOLLIN as u32 != 0 {
                    real |= Event::READ;
                }
                if bits & libc::EPOLLOUT as u32 != 0 {
                    real |= Event::WRITE;
                }

                if (inner.events & real).is_empty() {
                    continue;
                }

                let left = inner.events & !real;
                if !self.rearm(fd, left) {
                    continue;
                }

                if real.contains(Event::READ) {
                    fd_ctx.trigger(&mut inner, Event::READ);
                    self.pending_event_count.fetch_sub(1, Ordering::SeqCst);
                }
                if real.contains(Event::WRITE) {
                    fd_ctx.trigger(&mut inner, Event::WRITE);
                    self.pending_event_count.fetch_sub(1, Ordering::SeqCst);
                }
            }

            // Let this worker pick up whatever just became ready
            Fiber::yield_hold();
        }
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        // Workers hold strong references, so by the time this runs they
        // are gone and the fds are quiescent
        unsafe {
            libc::close(self.epfd);
            libc::close(self.tickle_fds[0]);
            libc::close(self.tickle_fds[1]);
        }
    }
}
