//! Timers
//!
//! A mutex-guarded set of timers ordered by (next-fire, identity) on a
//! monotonic millisecond clock. Expired one-shot timers are removed;
//! recurring timers advance their key before reinsertion so the set's
//! ordering is never mutated in place.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use weft_core::log_debug;

/// Milliseconds on the monotonic clock
pub fn now_ms() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1000 + ts.tv_nsec as u64 / 1_000_000
}

/// Timer callback; recurring timers invoke it repeatedly.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

static TIMER_SEQ: AtomicU64 = AtomicU64::new(1);

/// A single timer
pub struct Timer {
    seq: u64,
    next_ms: AtomicU64,
    interval_ms: AtomicU64,
    recurring: bool,
    cancelled: AtomicBool,
    callback: Mutex<Option<TimerCallback>>,
}

impl Timer {
    fn new(timeout_ms: u64, callback: TimerCallback, recurring: bool) -> Arc<Timer> {
        Arc::new(Timer {
            seq: TIMER_SEQ.fetch_add(1, Ordering::Relaxed),
            next_ms: AtomicU64::new(now_ms() + timeout_ms),
            interval_ms: AtomicU64::new(timeout_ms),
            recurring,
            cancelled: AtomicBool::new(false),
            callback: Mutex::new(Some(callback)),
        })
    }

    /// Cancel the timer and drop its callback. A cancelled timer is
    /// skipped (and removed) the next time it would fire.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        *self.callback.lock().unwrap() = None;
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Push next-fire out to now + interval.
    pub fn refresh(&self) {
        self.next_ms
            .store(now_ms() + self.interval_ms.load(Ordering::Relaxed), Ordering::Relaxed);
    }

    /// Replace the interval and recompute next-fire.
    pub fn reset(&self, interval_ms: u64) {
        self.interval_ms.store(interval_ms, Ordering::Relaxed);
        self.next_ms.store(now_ms() + interval_ms, Ordering::Relaxed);
    }

    #[inline]
    pub fn next_time_ms(&self) -> u64 {
        self.next_ms.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn interval_ms(&self) -> u64 {
        self.interval_ms.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_recurring(&self) -> bool {
        self.recurring
    }

    /// Advance next-fire by one interval (recurring reinsertion).
    fn advance(&self) {
        self.next_ms
            .fetch_add(self.interval_ms.load(Ordering::Relaxed), Ordering::Relaxed);
    }

    /// Invoke the callback unless cancelled in the meantime.
    fn run(&self) {
        if self.is_cancelled() {
            return;
        }
        let callback = self.callback.lock().unwrap().clone();
        if let Some(cb) = callback {
            cb();
        }
    }
}

/// Ordered set of timers
pub struct TimerManager {
    timers: Mutex<BTreeMap<(u64, u64), Arc<Timer>>>,
}

impl TimerManager {
    pub fn new() -> TimerManager {
        TimerManager {
            timers: Mutex::new(BTreeMap::new()),
        }
    }

    /// Insert a timer firing `timeout_ms` from now.
    pub fn add_timer(&self, timeout_ms: u64, callback: TimerCallback, recurring: bool) -> Arc<Timer> {
        let timer = Timer::new(timeout_ms, callback, recurring);
        let mut timers = self.timers.lock().unwrap();
        timers.insert((timer.next_time_ms(), timer.seq), timer.clone());
        log_debug!(
            "timer added: timeout={}ms, recurring={}, total={}",
            timeout_ms,
            recurring,
            timers.len()
        );
        timer
    }

    /// Insert a timer whose callback only runs if `cond` still upgrades at
    /// fire time; otherwise the fire is silently skipped.
    pub fn add_condition_timer(
        &self,
        timeout_ms: u64,
        callback: TimerCallback,
        cond: Weak<dyn Any + Send + Sync>,
        recurring: bool,
    ) -> Arc<Timer> {
        let wrapped: TimerCallback = Arc::new(move || {
            if cond.upgrade().is_some() {
                callback();
            }
        });
        self.add_timer(timeout_ms, wrapped, recurring)
    }

    /// Milliseconds until the earliest timer: -1 when the set is empty, 0
    /// when the earliest has already passed.
    pub fn get_next_timeout(&self) -> i64 {
        let timers = self.timers.lock().unwrap();
        let Some((&(next, _), _)) = timers.iter().next() else {
            return -1;
        };
        let now = now_ms();
        if next <= now {
            0
        } else {
            (next - now) as i64
        }
    }

    /// Remove and return everything due by now, skipping cancelled timers
    /// and reinserting recurring ones with their key advanced.
    pub fn list_expired_callbacks(&self) -> Vec<Box<dyn FnOnce() + Send + 'static>> {
        let now = now_ms();
        let mut out: Vec<Box<dyn FnOnce() + Send + 'static>> = Vec::new();

        let mut timers = self.timers.lock().unwrap();
        loop {
            let Some((&key, _)) = timers.iter().next() else {
                break;
            };
            if key.0 > now {
                break;
            }
            let timer = timers.remove(&key).unwrap();
            if timer.is_cancelled() {
                continue;
            }

            let runner = timer.clone();
            out.push(Box::new(move || runner.run()));

            if timer.is_recurring() {
                timer.advance();
                timers.insert((timer.next_time_ms(), timer.seq), timer);
            }
        }
        out
    }

    /// Number of pending timers (cancelled ones included until they drain)
    pub fn len(&self) -> usize {
        self.timers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.lock().unwrap().is_empty()
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        TimerManager::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering::SeqCst;
    use std::time::Duration;

    fn counting_cb(counter: &Arc<AtomicUsize>) -> TimerCallback {
        let c = counter.clone();
        Arc::new(move || {
            c.fetch_add(1, SeqCst);
        })
    }

    #[test]
    fn test_next_timeout_boundaries() {
        let mgr = TimerManager::new();
        assert_eq!(mgr.get_next_timeout(), -1);

        let counter = Arc::new(AtomicUsize::new(0));
        mgr.add_timer(0, counting_cb(&counter), false);
        assert_eq!(mgr.get_next_timeout(), 0);

        let mgr = TimerManager::new();
        mgr.add_timer(10_000, counting_cb(&counter), false);
        let next = mgr.get_next_timeout();
        assert!(next > 9_000 && next <= 10_000, "next={}", next);
    }

    #[test]
    fn test_expired_one_shot_is_removed() {
        let mgr = TimerManager::new();
        let counter = Arc::new(AtomicUsize::new(0));
        mgr.add_timer(0, counting_cb(&counter), false);

        std::thread::sleep(Duration::from_millis(2));
        let expired = mgr.list_expired_callbacks();
        assert_eq!(expired.len(), 1);
        assert!(mgr.is_empty());

        for cb in expired {
            cb();
        }
        assert_eq!(counter.load(SeqCst), 1);
    }

    #[test]
    fn test_recurring_advances_and_stays() {
        let mgr = TimerManager::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let timer = mgr.add_timer(50, counting_cb(&counter), true);
        let first_fire = timer.next_time_ms();

        std::thread::sleep(Duration::from_millis(60));
        let expired = mgr.list_expired_callbacks();
        assert_eq!(expired.len(), 1);
        assert_eq!(mgr.len(), 1, "recurring timer reinserted");
        assert_eq!(timer.next_time_ms(), first_fire + 50);
    }

    #[test]
    fn test_cancelled_timer_is_skipped() {
        let mgr = TimerManager::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let timer = mgr.add_timer(0, counting_cb(&counter), false);
        timer.cancel();

        std::thread::sleep(Duration::from_millis(2));
        let expired = mgr.list_expired_callbacks();
        assert!(expired.is_empty());
        assert!(mgr.is_empty());
    }

    #[test]
    fn test_cancel_after_listing_still_suppresses_run() {
        let mgr = TimerManager::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let timer = mgr.add_timer(0, counting_cb(&counter), false);

        std::thread::sleep(Duration::from_millis(2));
        let expired = mgr.list_expired_callbacks();
        timer.cancel();
        for cb in expired {
            cb();
        }
        assert_eq!(counter.load(SeqCst), 0);
    }

    #[test]
    fn test_condition_timer_skipped_after_drop() {
        let mgr = TimerManager::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let cond: Arc<dyn Any + Send + Sync> = Arc::new(42u32);
        mgr.add_timer(0, counting_cb(&counter), false);
        mgr.add_condition_timer(0, counting_cb(&counter), Arc::downgrade(&cond), false);
        drop(cond);

        std::thread::sleep(Duration::from_millis(2));
        for cb in mgr.list_expired_callbacks() {
            cb();
        }
        // Only the unconditional timer ran.
        assert_eq!(counter.load(SeqCst), 1);
    }

    #[test]
    fn test_simultaneous_timers_fire_in_insertion_order() {
        let mgr = TimerManager::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in 0..3u32 {
            let o = order.clone();
            mgr.add_timer(
                0,
                Arc::new(move || {
                    o.lock().unwrap().push(tag);
                }),
                false,
            );
        }

        std::thread::sleep(Duration::from_millis(2));
        for cb in mgr.list_expired_callbacks() {
            cb();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_timer_reset_and_refresh() {
        let mgr = TimerManager::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let timer = mgr.add_timer(50, counting_cb(&counter), false);

        let before = timer.next_time_ms();
        timer.reset(5_000);
        assert!(timer.next_time_ms() > before);
        assert_eq!(timer.interval_ms(), 5_000);

        timer.refresh();
        assert!(timer.next_time_ms() >= now_ms() + 4_900);
    }
}
