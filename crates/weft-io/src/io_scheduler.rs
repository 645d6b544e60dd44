//! I/O scheduler
//!
//! Composition root of the reactor: a fiber [`Scheduler`], the epoll
//! poller, the timer set and the fd table, plus one dedicated reactor
//! thread. The reactor blocks in epoll up to the next timer deadline
//! (clamped to an idle default), dispatches readiness into fd contexts,
//! and schedules expired timer callbacks as closure tasks. A nonblocking
//! wake pipe, registered with a null tag, forces an early pass whenever a
//! new timer or task changes the wait window.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

use weft_core::{log_debug, log_error, log_info, log_warn, WeftError, WeftResult};
use weft_runtime::tls;
use weft_runtime::{Fiber, Scheduler};

use crate::fd_context::{Event, FdContext, Waiter};
use crate::fd_table::FdTable;
use crate::poller::EpollPoller;
use crate::timer::{Timer, TimerCallback, TimerManager};

/// epoll wait bound when no timer is pending (ms)
pub const DEFAULT_IDLE_TIMEOUT_MS: i64 = 5000;

const EPOLL_EVENT_CAPACITY: usize = 256;

struct IoInner {
    scheduler: Scheduler,
    poller: EpollPoller,
    timers: TimerManager,
    fd_table: FdTable,
    wake_read: libc::c_int,
    wake_write: libc::c_int,
    stopping: AtomicBool,
    reactor: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for IoInner {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake_read);
            libc::close(self.wake_write);
        }
    }
}

/// Cheap-clone handle to an I/O scheduler
#[derive(Clone)]
pub struct IoScheduler {
    inner: Arc<IoInner>,
}

static GLOBAL_IO: Mutex<Option<IoScheduler>> = Mutex::new(None);

impl IoScheduler {
    pub fn new(thread_count: usize, name: &str) -> WeftResult<IoScheduler> {
        let poller = EpollPoller::new(EPOLL_EVENT_CAPACITY)?;

        let mut wake_fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(wake_fds.as_mut_ptr()) } < 0 {
            return Err(WeftError::last_os_error());
        }
        for fd in wake_fds {
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL, 0);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }
        }

        // Null tag marks the wake pipe in the readiness loop.
        poller.add_event(wake_fds[0], libc::EPOLLIN as u32, std::ptr::null_mut())?;

        log_info!(
            "io scheduler[{}] created: workers={}, wake_fds=[{}, {}]",
            name,
            thread_count,
            wake_fds[0],
            wake_fds[1]
        );

        Ok(IoScheduler {
            inner: Arc::new(IoInner {
                scheduler: Scheduler::new(thread_count, name),
                poller,
                timers: TimerManager::new(),
                fd_table: FdTable::new(),
                wake_read: wake_fds[0],
                wake_write: wake_fds[1],
                stopping: AtomicBool::new(false),
                reactor: Mutex::new(None),
            }),
        })
    }

    /// Register this instance as the process-wide reactor the hook layer
    /// routes through. Nothing installs itself; callers opt in.
    pub fn install_global(&self) {
        *GLOBAL_IO.lock().unwrap() = Some(self.clone());
    }

    /// Remove the process-wide registration if it points at this instance.
    pub fn uninstall_global(&self) {
        let mut slot = GLOBAL_IO.lock().unwrap();
        if let Some(current) = slot.as_ref() {
            if Arc::ptr_eq(&current.inner, &self.inner) {
                *slot = None;
            }
        }
    }

    /// The installed process-wide reactor, if any.
    pub fn global() -> Option<IoScheduler> {
        GLOBAL_IO.lock().unwrap().clone()
    }

    #[inline]
    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    #[inline]
    pub fn fd_table(&self) -> &FdTable {
        &self.inner.fd_table
    }

    /// Start the inner scheduler and the reactor thread. Idempotent.
    pub fn start(&self) {
        self.inner.scheduler.start();

        let mut reactor = self.inner.reactor.lock().unwrap();
        if reactor.is_some() {
            log_warn!("io scheduler[{}] already started, skip", self.scheduler().name());
            return;
        }
        self.inner.stopping.store(false, Ordering::Relaxed);

        let this = self.clone();
        *reactor = Some(
            std::thread::Builder::new()
                .name(format!("{}-reactor", self.scheduler().name()))
                .spawn(move || this.reactor_main())
                .expect("failed to spawn reactor thread"),
        );
    }

    /// Stop the reactor and the inner scheduler. Safe to call repeatedly.
    pub fn stop(&self) {
        if self.inner.stopping.swap(true, Ordering::Relaxed) {
            log_debug!("io scheduler[{}] already stopping, skip", self.scheduler().name());
            return;
        }

        self.wake_up();
        if let Some(handle) = self.inner.reactor.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.inner.scheduler.stop();
        log_info!("io scheduler[{}] stopped", self.scheduler().name());
    }

    /// Schedule a closure onto the inner scheduler and nudge the reactor.
    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.scheduler.schedule(f);
        self.wake_up();
    }

    /// Schedule a fiber resumption and nudge the reactor.
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.inner.scheduler.schedule_fiber(fiber);
        self.wake_up();
    }

    /// Arm a timer and wake the reactor so it recomputes its wait window.
    pub fn add_timer(&self, timeout_ms: u64, callback: TimerCallback, recurring: bool) -> Arc<Timer> {
        let timer = self.inner.timers.add_timer(timeout_ms, callback, recurring);
        self.wake_up();
        timer
    }

    /// Arm a timer whose callback fires only while `cond` still upgrades.
    pub fn add_condition_timer(
        &self,
        timeout_ms: u64,
        callback: TimerCallback,
        cond: Weak<dyn Any + Send + Sync>,
        recurring: bool,
    ) -> Arc<Timer> {
        let timer = self
            .inner
            .timers
            .add_condition_timer(timeout_ms, callback, cond, recurring);
        self.wake_up();
        timer
    }

    /// Park a waiter on `fd` readiness.
    ///
    /// With a callback the event fires it inline; without one the current
    /// fiber becomes the awaiter and is requeued on readiness. Slot
    /// population and poller registration happen in one critical section:
    /// either both persist or neither does.
    pub fn add_event(
        &self,
        fd: libc::c_int,
        event: Event,
        callback: Option<Box<dyn FnOnce() + Send + 'static>>,
    ) -> WeftResult<()> {
        let ctx = self
            .inner
            .fd_table
            .get(fd, true)
            .ok_or(WeftError::BadFd(fd))?;

        let waiter = match callback {
            Some(f) => Waiter::Callback(f),
            None => Waiter::Fiber(tls::current_fiber().ok_or(WeftError::NoCurrentFiber)?),
        };

        let tag = Arc::as_ptr(&ctx) as *mut libc::c_void;
        ctx.register(event, waiter, |mask, is_first| {
            if is_first {
                self.inner.poller.add_event(fd, mask, tag)
            } else {
                self.inner.poller.mod_event(fd, mask, tag)
            }
        })
    }

    /// Remove a registration without firing its waiter.
    pub fn del_event(&self, fd: libc::c_int, event: Event) -> WeftResult<()> {
        let Some(ctx) = self.inner.fd_table.get(fd, false) else {
            return Ok(());
        };
        let tag = Arc::as_ptr(&ctx) as *mut libc::c_void;
        ctx.deregister(event, |mask| {
            if mask == 0 {
                self.inner.poller.del_event(fd)
            } else {
                self.inner.poller.mod_event(fd, mask, tag)
            }
        })?;
        Ok(())
    }

    /// Remove a registration and fire its pending waiter immediately.
    pub fn cancel_event(&self, fd: libc::c_int, event: Event) -> WeftResult<()> {
        let Some(ctx) = self.inner.fd_table.get(fd, false) else {
            return Ok(());
        };
        if let Some(waiter) = self.take_synced(&ctx, event) {
            waiter.dispatch();
        }
        Ok(())
    }

    /// Fire and remove every pending event on `fd`.
    pub fn cancel_all(&self, fd: libc::c_int) {
        let _ = self.cancel_event(fd, Event::Read);
        let _ = self.cancel_event(fd, Event::Write);
    }

    /// Close-path teardown: mark the context closed, fire outstanding
    /// waiters (they observe EOF-ish wakeups), and drop the table entry.
    pub fn close_fd(&self, fd: libc::c_int) {
        if let Some(ctx) = self.inner.fd_table.get(fd, false) {
            ctx.set_closed();
            self.cancel_all(fd);
            self.inner.fd_table.del(fd);
        }
    }

    /// Poke the wake pipe so the reactor revisits its timeout.
    pub fn wake_up(&self) {
        let byte = [b'W'];
        let n = unsafe {
            libc::write(
                self.inner.wake_write,
                byte.as_ptr() as *const libc::c_void,
                1,
            )
        };
        // A full pipe already guarantees a pending wakeup.
        if n != 1 && std::io::Error::last_os_error().raw_os_error() != Some(libc::EAGAIN) {
            log_warn!("reactor wake write failed");
        }
    }

    /// Take a waiter while re-syncing the epoll registration to the
    /// remaining mask inside the fd context's critical section.
    fn take_synced(&self, ctx: &FdContext, event: Event) -> Option<Waiter> {
        let fd = ctx.fd();
        let tag = ctx as *const FdContext as *mut libc::c_void;
        ctx.take(event, |mask| {
            if mask == 0 {
                self.inner.poller.del_event(fd)
            } else {
                self.inner.poller.mod_event(fd, mask, tag)
            }
        })
    }

    /// Reactor thread body.
    fn reactor_main(&self) {
        log_info!("io scheduler[{}] reactor started", self.scheduler().name());

        // Triggered fibers are requeued through the thread-context
        // scheduler handle, the same path worker threads use.
        tls::set_scheduler(Some(self.inner.scheduler.clone()));

        let mut events: Vec<libc::epoll_event> = Vec::with_capacity(EPOLL_EVENT_CAPACITY);

        while !self.inner.stopping.load(Ordering::Relaxed) {
            let mut timeout = self.inner.timers.get_next_timeout();
            if timeout < 0 {
                timeout = DEFAULT_IDLE_TIMEOUT_MS;
            }

            let n = match self.inner.poller.wait(timeout as i32, &mut events) {
                Ok(n) => n,
                Err(e) => {
                    log_error!(
                        "io scheduler[{}] epoll wait failed: {}",
                        self.scheduler().name(),
                        e
                    );
                    continue;
                }
            };

            for i in 0..n {
                let ev = events[i];
                let tag = ev.u64 as *const FdContext;

                if tag.is_null() {
                    self.drain_wake_pipe();
                    continue;
                }

                // The tag outlives the registration: close_fd deregisters
                // from epoll before the table entry drops.
                let ctx = unsafe { &*tag };
                let bits = ev.events;
                let error = bits & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0;

                if error || bits & libc::EPOLLIN as u32 != 0 {
                    if let Some(waiter) = self.take_synced(ctx, Event::Read) {
                        waiter.dispatch();
                    }
                }
                if error || bits & libc::EPOLLOUT as u32 != 0 {
                    if let Some(waiter) = self.take_synced(ctx, Event::Write) {
                        waiter.dispatch();
                    }
                }
            }

            for callback in self.inner.timers.list_expired_callbacks() {
                self.inner.scheduler.schedule_closure(callback);
            }
        }

        tls::set_scheduler(None);
        log_info!("io scheduler[{}] reactor exited", self.scheduler().name());
    }

    fn drain_wake_pipe(&self) {
        let mut sink = [0u8; 256];
        loop {
            let n = unsafe {
                libc::read(
                    self.inner.wake_read,
                    sink.as_mut_ptr() as *mut libc::c_void,
                    sink.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering::SeqCst;
    use std::time::{Duration, Instant};

    fn wait_for(cond: impl Fn() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    fn counting_cb(counter: &Arc<AtomicUsize>) -> TimerCallback {
        let c = counter.clone();
        Arc::new(move || {
            c.fetch_add(1, SeqCst);
        })
    }

    // One-shot timer: 200ms timer observed once within 400ms.
    #[test]
    fn test_one_shot_timer_fires_once() {
        let io = IoScheduler::new(1, "t-oneshot").unwrap();
        io.start();

        let counter = Arc::new(AtomicUsize::new(0));
        io.add_timer(200, counting_cb(&counter), false);

        std::thread::sleep(Duration::from_millis(400));
        assert_eq!(counter.load(SeqCst), 1);
        io.stop();
    }

    // Recurring timer at 50ms over ~275ms: 4-6 beats depending on cancel
    // timing, then silence after cancel.
    #[test]
    fn test_recurring_timer_beats_then_cancels() {
        let io = IoScheduler::new(1, "t-recur").unwrap();
        io.start();

        let counter = Arc::new(AtomicUsize::new(0));
        let timer = io.add_timer(50, counting_cb(&counter), true);

        std::thread::sleep(Duration::from_millis(275));
        timer.cancel();
        let at_cancel = counter.load(SeqCst);
        assert!(
            (3..=6).contains(&at_cancel),
            "expected ~5 beats, saw {}",
            at_cancel
        );

        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(counter.load(SeqCst), at_cancel, "cancelled timer kept firing");
        io.stop();
    }

    // An awaiter fiber parks on Read readiness and is requeued when the
    // peer writes.
    #[test]
    fn test_fiber_parks_until_socketpair_readable() {
        let io = IoScheduler::new(1, "t-park").unwrap();
        io.start();

        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) },
            0
        );
        let (rd, wr) = (fds[0], fds[1]);

        let stage = Arc::new(AtomicUsize::new(0));
        let s = stage.clone();
        let io2 = io.clone();
        io.schedule(move || {
            s.store(1, SeqCst);
            io2.add_event(rd, Event::Read, None).unwrap();
            weft_runtime::yield_now();
            s.store(2, SeqCst);
        });

        assert!(wait_for(|| stage.load(SeqCst) == 1, Duration::from_secs(2)));
        // Parked: nothing readable yet.
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(stage.load(SeqCst), 1);

        let msg = b"HELLO";
        assert_eq!(
            unsafe { libc::write(wr, msg.as_ptr() as *const libc::c_void, msg.len()) },
            5
        );

        assert!(wait_for(|| stage.load(SeqCst) == 2, Duration::from_secs(2)));
        io.stop();
        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }

    // Event callbacks fire inline from the reactor.
    #[test]
    fn test_callback_event_fires() {
        let io = IoScheduler::new(1, "t-cb").unwrap();
        io.start();

        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) },
            0
        );
        let (rd, wr) = (fds[0], fds[1]);

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        io.add_event(rd, Event::Read, Some(Box::new(move || {
            h.fetch_add(1, SeqCst);
        })))
        .unwrap();

        let byte = [1u8];
        unsafe { libc::write(wr, byte.as_ptr() as *const libc::c_void, 1) };

        assert!(wait_for(|| hits.load(SeqCst) == 1, Duration::from_secs(2)));
        // The registration is consumed with the trigger.
        assert_eq!(io.fd_table().get(rd, false).unwrap().events(), 0);

        io.stop();
        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }

    #[test]
    fn test_del_event_restores_mask() {
        let io = IoScheduler::new(1, "t-del").unwrap();
        io.start();

        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) },
            0
        );
        let rd = fds[0];

        io.add_event(rd, Event::Read, Some(Box::new(|| {}))).unwrap();
        let ctx = io.fd_table().get(rd, false).unwrap();
        assert_eq!(ctx.events(), Event::Read.bits());

        io.del_event(rd, Event::Read).unwrap();
        assert_eq!(ctx.events(), 0);
        // Deleting an absent event stays a no-op.
        io.del_event(rd, Event::Read).unwrap();

        io.stop();
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_cancel_event_fires_waiter() {
        let io = IoScheduler::new(1, "t-cancel").unwrap();
        io.start();

        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) },
            0
        );
        let rd = fds[0];

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        io.add_event(rd, Event::Read, Some(Box::new(move || {
            h.fetch_add(1, SeqCst);
        })))
        .unwrap();

        // No data ever arrives; cancellation fires the waiter by hand.
        io.cancel_event(rd, Event::Read).unwrap();
        assert_eq!(hits.load(SeqCst), 1);

        io.stop();
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_add_event_without_fiber_or_callback_fails() {
        let io = IoScheduler::new(1, "t-nofiber").unwrap();
        // Not inside a fiber and no callback given.
        let err = io.add_event(0, Event::Read, None).unwrap_err();
        assert_eq!(err, WeftError::NoCurrentFiber);
        // Negative fd is rejected outright.
        let err = io.add_event(-1, Event::Read, Some(Box::new(|| {}))).unwrap_err();
        assert_eq!(err, WeftError::BadFd(-1));
    }

    #[test]
    fn test_start_stop_cycles() {
        let io = IoScheduler::new(1, "t-cycle").unwrap();
        io.start();
        io.start();
        io.stop();
        io.stop();
        io.start();

        let counter = Arc::new(AtomicUsize::new(0));
        io.add_timer(10, counting_cb(&counter), false);
        assert!(wait_for(|| counter.load(SeqCst) == 1, Duration::from_secs(2)));
        io.stop();
    }

    #[test]
    fn test_global_install_and_uninstall() {
        let io = IoScheduler::new(1, "t-global").unwrap();
        io.install_global();
        assert!(IoScheduler::global().is_some());
        io.uninstall_global();
        assert!(IoScheduler::global().is_none());
    }
}
