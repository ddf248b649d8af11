//! M:N fiber scheduler
//!
//! One shared FIFO of [`Task`]s drained by a pool of worker threads. A task
//! is either an existing fiber or a closure that gets wrapped into a fiber
//! on first run. Tasks may be pinned to a worker's kernel tid; `-1` means
//! any worker.
//!
//! With `use_caller` the constructing thread doubles as a worker: its
//! dispatch loop runs inside a dedicated *root fiber* that [`stop`] drives
//! via `call()` while draining.
//!
//! Subtype behavior (the I/O manager's reactor) hangs off the [`Schedule`]
//! trait: `tickle` wakes sleeping workers, `idle` runs inside the per-worker
//! idle fiber, `stopping` is the exit predicate.

use crate::fiber::{Fiber, FiberState};
use crate::thread::{self, Thread};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use weft_core::set_hook_enabled;
use weft_core::sync::Mutex;

thread_local! {
    /// Scheduler owning the current worker thread.
    static SCHEDULER: RefCell<Option<Arc<dyn Schedule>>> = const { RefCell::new(None) };

    /// The fiber running this thread's dispatch loop. Ordinary workers point
    /// this at their main fiber; a `use_caller` thread points it at the root
    /// fiber.
    static DISPATCH_FIBER: Cell<*const Fiber> = const { Cell::new(ptr::null()) };
}

/// Scheduler of the current worker thread, if any.
pub fn current_scheduler() -> Option<Arc<dyn Schedule>> {
    SCHEDULER.with(|s| s.borrow().clone())
}

fn set_scheduler(this: Arc<dyn Schedule>) {
    SCHEDULER.with(|s| *s.borrow_mut() = Some(this));
}

fn clear_scheduler() {
    SCHEDULER.with(|s| *s.borrow_mut() = None);
}

#[inline]
pub(crate) fn dispatch_fiber() -> *const Fiber {
    DISPATCH_FIBER.with(|c| c.get())
}

#[inline]
pub(crate) fn set_dispatch_fiber(fiber: *const Fiber) {
    DISPATCH_FIBER.with(|c| c.set(fiber));
}

/// One schedulable unit: an existing fiber or a closure, plus an optional
/// worker pin (kernel tid, -1 = any).
pub struct Task {
    fiber: Option<Arc<Fiber>>,
    cb: Option<Box<dyn FnOnce() + Send>>,
    thread: i64,
}

impl Task {
    pub fn from_fiber(fiber: Arc<Fiber>, thread: i64) -> Task {
        Task {
            fiber: Some(fiber),
            cb: None,
            thread,
        }
    }

    pub fn from_cb<F>(cb: F, thread: i64) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        Task {
            fiber: None,
            cb: Some(Box::new(cb)),
            thread,
        }
    }
}

/// Shared scheduler state. Embedded by anything implementing [`Schedule`].
pub struct Scheduler {
    name: String,
    queue: Mutex<VecDeque<Task>>,
    threads: Mutex<Vec<Thread>>,
    /// Workers to spawn (excludes the caller thread when `use_caller`).
    thread_count: usize,
    active_threads: AtomicUsize,
    idle_threads: AtomicUsize,
    /// Starts true; `start` flips it off, `stop` back on.
    stopping: AtomicBool,
    auto_stop: AtomicBool,
    use_caller: bool,
    root_fiber: OnceLock<Arc<Fiber>>,
    /// Kernel tid of the caller thread when `use_caller`, else -1.
    root_thread: i64,
}

impl Scheduler {
    /// Bare construction; prefer [`Scheduler::new_arc`], which also binds
    /// the caller thread when `use_caller`.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Scheduler {
        assert!(threads > 0, "scheduler needs at least one thread");
        Scheduler {
            name: name.to_string(),
            queue: Mutex::new(VecDeque::new()),
            threads: Mutex::new(Vec::new()),
            thread_count: threads - usize::from(use_caller),
            active_threads: AtomicUsize::new(0),
            idle_threads: AtomicUsize::new(0),
            stopping: AtomicBool::new(true),
            auto_stop: AtomicBool::new(false),
            use_caller,
            root_fiber: OnceLock::new(),
            root_thread: if use_caller { thread::tid() } else { -1 },
        }
    }

    /// Construct a plain scheduler and bind the caller thread if requested.
    /// Workers start on [`start`].
    pub fn new_arc(threads: usize, use_caller: bool, name: &str) -> Arc<Scheduler> {
        let this = Arc::new(Scheduler::new(threads, use_caller, name));
        bind_caller(&(this.clone() as Arc<dyn Schedule>));
        this
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kernel tids of the spawned workers (pin targets).
    pub fn thread_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.threads.lock().iter().map(|t| t.tid()).collect();
        if self.use_caller {
            ids.push(self.root_thread);
        }
        ids
    }

    pub fn has_idle_threads(&self) -> bool {
        self.idle_threads.load(Ordering::SeqCst) > 0
    }

    /// Base exit predicate: stop requested, queue drained, nobody mid-task.
    pub fn base_stopping(&self) -> bool {
        self.auto_stop.load(Ordering::SeqCst)
            && self.stopping.load(Ordering::SeqCst)
            && self.queue.lock().is_empty()
            && self.active_threads.load(Ordering::SeqCst) == 0
    }

    /// Append one task; true means the queue was empty and a tickle is due.
    fn push_task(&self, task: Task) -> bool {
        let mut queue = self.queue.lock();
        let need_tickle = queue.is_empty();
        queue.push_back(task);
        need_tickle
    }

    fn push_batch(&self, tasks: Vec<Task>) -> bool {
        if tasks.is_empty() {
            return false;
        }
        let mut queue = self.queue.lock();
        let need_tickle = queue.is_empty();
        queue.extend(tasks);
        need_tickle
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("threads", &self.thread_count)
            .field("active", &self.active_threads.load(Ordering::Relaxed))
            .field("idle", &self.idle_threads.load(Ordering::Relaxed))
            .field("stopping", &self.stopping.load(Ordering::Relaxed))
            .finish()
    }
}

/// Scheduler behavior, overridable by subtypes (the I/O manager).
///
/// Object-safe: workers and event contexts hold `Arc<dyn Schedule>` /
/// `Weak<dyn Schedule>`.
pub trait Schedule: Send + Sync + 'static {
    /// The embedded scheduler state.
    fn base(&self) -> &Scheduler;

    /// Upcast for thread-local downcasting (`IoManager::current`).
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    /// Wake a sleeping worker. The base scheduler busy-polls, so this is
    /// just a trace point; the I/O manager writes its wake pipe.
    fn tickle(&self) {
        log::debug!("{} tickle", self.base().name);
    }

    /// Exit predicate for the worker loop.
    fn stopping(&self) -> bool {
        self.base().base_stopping()
    }

    /// Body of the per-worker idle fiber. Runs whenever the queue has
    /// nothing runnable; the I/O manager replaces this with its reactor.
    fn idle(&self) {
        log::debug!("{} idle", self.base().name);
        while !self.stopping() {
            Fiber::yield_hold();
        }
    }

    /// Enqueue one task, waking a worker if the queue was empty.
    fn schedule_task(&self, task: Task) {
        if self.base().push_task(task) {
            self.tickle();
        }
    }

    /// Enqueue a batch, waking at most once.
    fn schedule_batch(&self, tasks: Vec<Task>) {
        if self.base().push_batch(tasks) {
            self.tickle();
        }
    }
}

/// Ergonomic scheduling helpers over any [`Schedule`].
pub trait ScheduleExt: Schedule {
    /// Schedule a closure on any worker.
    fn schedule<F>(&self, cb: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_task(Task::from_cb(cb, -1));
    }

    /// Schedule a closure pinned to a worker tid.
    fn schedule_on<F>(&self, cb: F, thread: i64)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_task(Task::from_cb(cb, thread));
    }

    /// Schedule an existing fiber on any worker.
    fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.schedule_task(Task::from_fiber(fiber, -1));
    }
}

impl<S: Schedule + ?Sized> ScheduleExt for S {}

impl Schedule for Scheduler {
    fn base(&self) -> &Scheduler {
        self
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Bind the constructing thread as a worker (`use_caller`): materialize its
/// main fiber, build the root fiber around the dispatch loop, and install
/// the thread-local back-pointers.
pub fn bind_caller(this: &Arc<dyn Schedule>) {
    let base = this.base();
    if !base.use_caller {
        return;
    }
    assert!(
        current_scheduler().is_none(),
        "thread already belongs to a scheduler"
    );
    debug_assert_eq!(base.root_thread, thread::tid());

    Fiber::current();

    let weak = Arc::downgrade(this);
    let root = Fiber::new(
        move || {
            if let Some(sched) = weak.upgrade() {
                run_worker(sched);
            }
        },
        0,
        true,
    );
    base.root_fiber
        .set(root.clone())
        .unwrap_or_else(|_| panic!("scheduler {} bound twice", base.name));

    thread::set_name(&base.name);
    set_dispatch_fiber(Arc::as_ptr(&root));
    set_scheduler(this.clone());
}

/// Spawn the worker pool. Idempotent: a running scheduler is left alone.
pub fn start(this: &Arc<dyn Schedule>) {
    let base = this.base();
    let mut threads = base.threads.lock();
    if !base.stopping.load(Ordering::SeqCst) {
        return;
    }
    base.stopping.store(false, Ordering::SeqCst);
    assert!(threads.is_empty(), "stale workers on start");

    for i in 0..base.thread_count {
        let weak = Arc::downgrade(this);
        let worker = Thread::spawn(&format!("{}_{}", base.name, i), move || {
            if let Some(sched) = weak.upgrade() {
                run_worker(sched);
            }
        })
        .expect("failed to spawn scheduler worker");
        threads.push(worker);
    }
}

/// Request shutdown, drain the queue and join the workers.
///
/// With `use_caller` this must run on the constructing thread: the root
/// fiber is driven here so the caller thread does its share of the
/// draining.
pub fn stop(this: &Arc<dyn Schedule>) {
    let base = this.base();
    base.auto_stop.store(true, Ordering::SeqCst);

    if let Some(root) = base.root_fiber.get() {
        if base.thread_count == 0
            && matches!(root.state(), FiberState::Term | FiberState::Init)
        {
            log::info!("{} stopped", base.name);
            base.stopping.store(true, Ordering::SeqCst);
            if this.stopping() {
                return;
            }
        }
    }

    if base.root_thread != -1 {
        // use_caller stop must come from the owning thread
        debug_assert_eq!(thread::tid(), base.root_thread);
    }

    base.stopping.store(true, Ordering::SeqCst);
    for _ in 0..base.thread_count {
        this.tickle();
    }
    if base.root_fiber.get().is_some() {
        this.tickle();
    }

    if let Some(root) = base.root_fiber.get() {
        if !this.stopping() {
            root.call();
        }
    }

    let threads = std::mem::take(&mut *base.threads.lock());
    for t in threads {
        t.join();
    }
}

/// The worker dispatch loop. Runs on every pool thread, and inside the root
/// fiber of a `use_caller` scheduler.
fn run_worker(this: Arc<dyn Schedule>) {
    let base = this.base();
    log::debug!("{} run", base.name);

    set_hook_enabled(true);
    set_scheduler(this.clone());

    if thread::tid() != base.root_thread {
        // Ordinary worker: the dispatch loop runs on the thread's own stack
        let main = Fiber::current();
        set_dispatch_fiber(Arc::as_ptr(&main));
    }

    let idle_weak = Arc::downgrade(&this);
    let idle_fiber = Fiber::new(
        move || {
            if let Some(sched) = idle_weak.upgrade() {
                sched.idle();
            }
        },
        0,
        false,
    );
    let mut cb_fiber: Option<Arc<Fiber>> = None;

    loop {
        let mut task: Option<Task> = None;
        let mut tickle_me = false;
        let mut is_active = false;
        {
            let mut queue = base.queue.lock();
            let mut idx = 0;
            while idx < queue.len() {
                let t = &queue[idx];

                // Pinned to another worker
                if t.thread != -1 && t.thread != thread::tid() {
                    idx += 1;
                    tickle_me = true;
                    continue;
                }

                debug_assert!(t.fiber.is_some() || t.cb.is_some());

                // Still executing elsewhere: its context is not saved yet
                if let Some(f) = &t.fiber {
                    if f.state() == FiberState::Exec {
                        idx += 1;
                        continue;
                    }
                }

                task = queue.remove(idx);
                // Counted before the lock drops so an empty queue plus a
                // task in flight never reads as stopped
                base.active_threads.fetch_add(1, Ordering::SeqCst);
                is_active = true;
                break;
            }
            tickle_me = tickle_me || idx < queue.len();
        }

        if tickle_me {
            this.tickle();
        }

        let runnable_fiber = task.as_mut().and_then(|t| {
            t.fiber
                .take_if(|f| !matches!(f.state(), FiberState::Term | FiberState::Except))
        });
        let cb = task.as_mut().and_then(|t| t.cb.take());

        if let Some(fiber) = runnable_fiber {
            fiber.swap_in();
            base.active_threads.fetch_sub(1, Ordering::SeqCst);

            match fiber.state() {
                FiberState::Ready => this.schedule_fiber(fiber),
                FiberState::Term | FiberState::Except => {}
                _ => fiber.set_state(FiberState::Hold),
            }
        } else if let Some(cb) = cb {
            let fiber = match cb_fiber.take() {
                Some(f) => {
                    f.reset(cb);
                    f
                }
                None => Fiber::new(cb, 0, false),
            };
            fiber.swap_in();
            base.active_threads.fetch_sub(1, Ordering::SeqCst);

            match fiber.state() {
                FiberState::Ready => this.schedule_fiber(fiber),
                // Finished: keep the fiber cached for the next closure
                FiberState::Term | FiberState::Except => cb_fiber = Some(fiber),
                // Held: the waker owns it now, the cache must let go
                _ => fiber.set_state(FiberState::Hold),
            }
        } else {
            if is_active {
                // Grabbed a task that turned out unrunnable
                base.active_threads.fetch_sub(1, Ordering::SeqCst);
                continue;
            }
            if idle_fiber.state() == FiberState::Term {
                log::info!("{} idle fiber term", base.name);
                break;
            }
            base.idle_threads.fetch_add(1, Ordering::SeqCst);
            idle_fiber.swap_in();
            base.idle_threads.fetch_sub(1, Ordering::SeqCst);
            if !matches!(
                idle_fiber.state(),
                FiberState::Term | FiberState::Except
            ) {
                idle_fiber.set_state(FiberState::Hold);
            }
        }
    }

    clear_scheduler();
    set_hook_enabled(false);
    log::debug!("{} run exit", base.name);
}
