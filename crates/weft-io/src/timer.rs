//! Deadline-ordered timers
//!
//! A [`TimerManager`] keeps pending timers in a set ordered by
//! `(deadline, id)`: the id tiebreak keeps the order strict for coincident
//! deadlines. The reactor asks for [`TimerManager::next_timer`] to bound its
//! `epoll_wait`, and drains due callbacks with
//! [`TimerManager::list_expired`] on every wakeup.
//!
//! Deadlines are wall-clock; a clock stepped back by more than an hour is
//! detected and treated as "everything expired" exactly once.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use weft_core::sync::{RwLock, SpinLock};
use weft_core::time::current_ms;

/// Sentinel for "no pending timer" / "no timeout".
pub const NO_TIMEOUT: u64 = u64::MAX;

const ROLLOVER_WINDOW_MS: u64 = 60 * 60 * 1000;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(0);

pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// Receiver for "a timer became the earliest deadline" notifications.
/// The I/O manager implements this to kick its wake pipe.
pub trait TimerTickle: Send + Sync {
    fn on_timer_inserted_at_front(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimerKey {
    next_ms: u64,
    id: u64,
}

/// One pending timer.
///
/// Handles are shared: the manager holds one while the timer is pending,
/// and the creator may keep another to cancel/refresh/reset it. All
/// mutation happens under the manager's set lock; a consumed callback
/// (one-shot after firing) turns every later operation into a no-op.
///
/// The callback cell is a spinlock: it is only ever held to clone or take
/// the `Arc`, never to run the callback.
pub struct Timer {
    id: u64,
    period_ms: AtomicU64,
    next_ms: AtomicU64,
    recurring: bool,
    cb: SpinLock<Option<TimerCallback>>,
    manager: Weak<TimerShared>,
}

impl Timer {
    fn key(&self) -> TimerKey {
        TimerKey {
            next_ms: self.next_ms.load(Ordering::Relaxed),
            id: self.id,
        }
    }

    pub fn recurring(&self) -> bool {
        self.recurring
    }

    /// Remove the timer before it fires. False once it already fired (or
    /// was cancelled).
    pub fn cancel(&self) -> bool {
        let Some(shared) = self.manager.upgrade() else {
            return false;
        };
        let mut set = shared.set.write();
        let mut cb = self.cb.lock();
        if cb.is_none() {
            return false;
        }
        *cb = None;
        set.timers.remove(&self.key());
        true
    }

    /// Push the deadline one full period into the future.
    pub fn refresh(&self) -> bool {
        let Some(shared) = self.manager.upgrade() else {
            return false;
        };
        let mut set = shared.set.write();
        {
            let cb = self.cb.lock();
            if cb.is_none() {
                return false;
            }
        }
        // Remove before touching the key; the set is ordered by it
        let Some(this) = set.timers.remove(&self.key()) else {
            return false;
        };
        self.next_ms
            .store(current_ms() + self.period_ms.load(Ordering::Relaxed), Ordering::Relaxed);
        set.timers.insert(self.key(), this);
        true
    }

    /// Change the period. `from_now` restarts the countdown at the current
    /// time, otherwise the original start time is kept.
    pub fn reset(&self, period_ms: u64, from_now: bool) -> bool {
        if period_ms == self.period_ms.load(Ordering::Relaxed) && !from_now {
            return true;
        }
        let Some(shared) = self.manager.upgrade() else {
            return false;
        };

        let at_front;
        {
            let mut set = shared.set.write();
            {
                let cb = self.cb.lock();
                if cb.is_none() {
                    return false;
                }
            }
            let Some(this) = set.timers.remove(&self.key()) else {
                return false;
            };
            let start = if from_now {
                current_ms()
            } else {
                self.next_ms.load(Ordering::Relaxed) - self.period_ms.load(Ordering::Relaxed)
            };
            self.period_ms.store(period_ms, Ordering::Relaxed);
            self.next_ms.store(start + period_ms, Ordering::Relaxed);
            at_front = insert_locked(&shared, &mut set, this);
        }
        if at_front {
            shared.fire_front_hook();
        }
        true
    }
}

struct TimerSet {
    timers: BTreeMap<TimerKey, Arc<Timer>>,
    /// Last drain time, for clock-rollback detection.
    previous_ms: u64,
}

struct TimerShared {
    set: RwLock<TimerSet>,
    /// Latch: a head insertion already tickled and no drain happened since.
    tickled: AtomicBool,
    front_hook: OnceLock<Weak<dyn TimerTickle>>,
}

impl TimerShared {
    fn fire_front_hook(&self) {
        if let Some(hook) = self.front_hook.get().and_then(Weak::upgrade) {
            hook.on_timer_inserted_at_front();
        }
    }
}

/// Insert under the set lock; true means the timer became the new head and
/// the latch was clear, so the caller must fire the front hook after
/// unlocking.
fn insert_locked(shared: &TimerShared, set: &mut TimerSet, timer: Arc<Timer>) -> bool {
    let key = timer.key();
    set.timers.insert(key, timer);
    let is_head = set.timers.keys().next() == Some(&key);
    is_head && !shared.tickled.swap(true, Ordering::SeqCst)
}

/// The time-ordered set of pending timers.
pub struct TimerManager {
    shared: Arc<TimerShared>,
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerManager {
    pub fn new() -> TimerManager {
        TimerManager {
            shared: Arc::new(TimerShared {
                set: RwLock::new(TimerSet {
                    timers: BTreeMap::new(),
                    previous_ms: current_ms(),
                }),
                tickled: AtomicBool::new(false),
                front_hook: OnceLock::new(),
            }),
        }
    }

    /// Install the front-insertion hook. One receiver, installed once.
    pub fn bind_front_hook(&self, hook: Weak<dyn TimerTickle>) {
        if self.shared.front_hook.set(hook).is_err() {
            panic!("timer front hook bound twice");
        }
    }

    /// Arm a timer `period_ms` from now.
    pub fn add_timer<F>(&self, period_ms: u64, cb: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_timer_cb(period_ms, Arc::new(cb), recurring)
    }

    fn add_timer_cb(&self, period_ms: u64, cb: TimerCallback, recurring: bool) -> Arc<Timer> {
        let timer = Arc::new(Timer {
            id: NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed),
            period_ms: AtomicU64::new(period_ms),
            next_ms: AtomicU64::new(current_ms() + period_ms),
            recurring,
            cb: SpinLock::new(Some(cb)),
            manager: Arc::downgrade(&self.shared),
        });

        let at_front = {
            let mut set = self.shared.set.write();
            insert_locked(&self.shared, &mut set, timer.clone())
        };
        if at_front {
            self.shared.fire_front_hook();
        }
        timer
    }

    /// Arm a timer whose callback only runs while `cond` is still alive:
    /// the weak reference is upgraded inside the callback and the closure
    /// runs only on success.
    pub fn add_condition_timer<T, F>(
        &self,
        period_ms: u64,
        cb: F,
        cond: Weak<T>,
        recurring: bool,
    ) -> Arc<Timer>
    where
        T: Send + Sync + 'static,
        F: Fn() + Send + Sync + 'static,
    {
        self.add_timer_cb(
            period_ms,
            Arc::new(move || {
                if cond.upgrade().is_some() {
                    cb();
                }
            }),
            recurring,
        )
    }

    /// Milliseconds until the earliest deadline: 0 if already due,
    /// [`NO_TIMEOUT`] if the set is empty. Clears the head-insertion latch.
    pub fn next_timer(&self) -> u64 {
        self.shared.tickled.store(false, Ordering::SeqCst);
        let set = self.shared.set.read();
        match set.timers.keys().next() {
            None => NO_TIMEOUT,
            Some(head) => {
                let now = current_ms();
                if now >= head.next_ms {
                    0
                } else {
                    head.next_ms - now
                }
            }
        }
    }

    /// Move every due callback into `cbs`, reinserting recurring timers at
    /// `now + period`. A clock rolled back past the detection window drains
    /// everything.
    pub fn list_expired(&self, cbs: &mut Vec<TimerCallback>) {
        let now = current_ms();
        {
            let set = self.shared.set.read();
            if set.timers.is_empty() {
                return;
            }
        }

        let mut set = self.shared.set.write();
        if set.timers.is_empty() {
            return;
        }

        let rollover = detect_clock_rollover(&mut set, now);
        if !rollover {
            if let Some(head) = set.timers.keys().next() {
                if head.next_ms > now {
                    return;
                }
            }
        }

        let expired: Vec<TimerKey> = if rollover {
            set.timers.keys().copied().collect()
        } else {
            // Inclusive bound picks up deadlines equal to now
            set.timers
                .range(
                    ..=TimerKey {
                        next_ms: now,
                        id: u64::MAX,
                    },
                )
                .map(|(k, _)| *k)
                .collect()
        };

        cbs.reserve(expired.len());
        for key in expired {
            let Some(timer) = set.timers.remove(&key) else {
                continue;
            };
            let cb = timer.cb.lock().clone();
            let Some(cb) = cb else { continue };
            cbs.push(cb);

            if timer.recurring {
                timer
                    .next_ms
                    .store(now + timer.period_ms.load(Ordering::Relaxed), Ordering::Relaxed);
                let reinsert = timer.clone();
                set.timers.insert(reinsert.key(), reinsert);
            } else {
                *timer.cb.lock() = None;
            }
        }
    }

    pub fn has_timer(&self) -> bool {
        !self.shared.set.read().timers.is_empty()
    }

    #[cfg(test)]
    fn force_previous_ms(&self, value: u64) {
        self.shared.set.write().previous_ms = value;
    }
}

/// True when the wall clock moved backwards by more than the detection
/// window since the previous drain. The reference point always advances, so
/// one rollback drains at most once.
fn detect_clock_rollover(set: &mut TimerSet, now: u64) -> bool {
    let rollover = now < set.previous_ms && now < set.previous_ms.saturating_sub(ROLLOVER_WINDOW_MS);
    set.previous_ms = now;
    rollover
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn drain(mgr: &TimerManager) -> Vec<TimerCallback> {
        let mut cbs = Vec::new();
        mgr.list_expired(&mut cbs);
        cbs
    }

    #[test]
    fn test_expiry_order_and_equal_deadlines() {
        let mgr = TimerManager::new();
        let fired = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let f = fired.clone();
            mgr.add_timer(
                0,
                move || {
                    f.fetch_add(1, Ordering::SeqCst);
                },
                false,
            );
        }

        std::thread::sleep(std::time::Duration::from_millis(5));
        for cb in drain(&mgr) {
            cb();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert!(!mgr.has_timer());
    }

    #[test]
    fn test_not_due_yet() {
        let mgr = TimerManager::new();
        mgr.add_timer(60_000, || {}, false);

        assert!(drain(&mgr).is_empty());
        let next = mgr.next_timer();
        assert!(next > 0 && next <= 60_000);
    }

    #[test]
    fn test_cancel_before_fire() {
        let mgr = TimerManager::new();
        let timer = mgr.add_timer(1, || panic!("must not fire"), false);

        assert!(timer.cancel());
        assert!(!timer.cancel());
        assert!(!mgr.has_timer());

        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(drain(&mgr).is_empty());
    }

    #[test]
    fn test_cancel_after_fire_is_noop() {
        let mgr = TimerManager::new();
        let timer = mgr.add_timer(0, || {}, false);

        std::thread::sleep(std::time::Duration::from_millis(2));
        assert_eq!(drain(&mgr).len(), 1);
        assert!(!timer.cancel());
        assert!(!timer.refresh());
        assert!(!timer.reset(100, true));
    }

    #[test]
    fn test_recurring_reinserts() {
        let mgr = TimerManager::new();
        mgr.add_timer(0, || {}, true);

        std::thread::sleep(std::time::Duration::from_millis(2));
        assert_eq!(drain(&mgr).len(), 1);
        assert!(mgr.has_timer());

        std::thread::sleep(std::time::Duration::from_millis(2));
        assert_eq!(drain(&mgr).len(), 1);
    }

    #[test]
    fn test_refresh_pushes_deadline() {
        let mgr = TimerManager::new();
        let timer = mgr.add_timer(40, || {}, false);

        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(timer.refresh());
        // Deadline restarted, so well over half the period remains
        assert!(mgr.next_timer() > 30);
    }

    #[test]
    fn test_reset_from_now() {
        let mgr = TimerManager::new();
        let timer = mgr.add_timer(5, || {}, false);

        assert!(timer.reset(60_000, true));
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(drain(&mgr).is_empty());
        let next = mgr.next_timer();
        assert!(next > 59_000 && next <= 60_000);
    }

    #[test]
    fn test_condition_timer_requires_live_referent() {
        let mgr = TimerManager::new();
        let fired = Arc::new(AtomicU32::new(0));

        let cond = Arc::new(());
        let f = fired.clone();
        mgr.add_condition_timer(
            0,
            move || {
                f.fetch_add(1, Ordering::SeqCst);
            },
            Arc::downgrade(&cond),
            false,
        );
        drop(cond);

        std::thread::sleep(std::time::Duration::from_millis(2));
        for cb in drain(&mgr) {
            cb();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_rollover_drains_everything_once() {
        let mgr = TimerManager::new();
        mgr.add_timer(60_000, || {}, false);
        mgr.add_timer(120_000, || {}, false);

        // Pretend the previous drain happened two hours in the future
        mgr.force_previous_ms(current_ms() + 2 * ROLLOVER_WINDOW_MS);
        assert_eq!(drain(&mgr).len(), 2);
        assert!(!mgr.has_timer());

        // Reference point advanced: no second drain
        mgr.add_timer(60_000, || {}, false);
        assert!(drain(&mgr).is_empty());
    }

    struct CountingHook(AtomicU32);

    impl TimerTickle for CountingHook {
        fn on_timer_inserted_at_front(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_front_hook_latch() {
        let mgr = TimerManager::new();
        let hook = Arc::new(CountingHook(AtomicU32::new(0)));
        mgr.bind_front_hook(Arc::downgrade(&hook) as Weak<dyn TimerTickle>);

        mgr.add_timer(1000, || {}, false);
        assert_eq!(hook.0.load(Ordering::SeqCst), 1);

        // New head, but the latch is still set: coalesced
        mgr.add_timer(500, || {}, false);
        assert_eq!(hook.0.load(Ordering::SeqCst), 1);

        // next_timer clears the latch; the next head insertion tickles again
        let _ = mgr.next_timer();
        mgr.add_timer(100, || {}, false);
        assert_eq!(hook.0.load(Ordering::SeqCst), 2);

        // Inserting behind the head never tickles
        let _ = mgr.next_timer();
        mgr.add_timer(5000, || {}, false);
        assert_eq!(hook.0.load(Ordering::SeqCst), 2);
    }
}
