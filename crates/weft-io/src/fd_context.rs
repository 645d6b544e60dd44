//! Per-descriptor readiness state
//!
//! One record per file descriptor: the registered event mask with a wait
//! slot per event, plus the socket metadata the hook layer consults
//! (socket-ness, nonblocking flags, per-direction timeouts).
//!
//! Locking discipline: mask and slots always change together under the
//! context mutex, the poller registration is updated inside the same
//! critical section, and waiters are moved out before the lock is released
//! so user code never runs under it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use weft_core::{log_debug, log_warn, WeftError, WeftResult};
use weft_runtime::tls;
use weft_runtime::Fiber;

use crate::reals;

/// Timeout sentinel: no timeout configured
const NO_TIMEOUT: u64 = u64::MAX;

/// Readiness event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Read,
    Write,
}

impl Event {
    /// The epoll bit for this event
    #[inline]
    pub fn bits(self) -> u32 {
        match self {
            Event::Read => libc::EPOLLIN as u32,
            Event::Write => libc::EPOLLOUT as u32,
        }
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Read => write!(f, "read"),
            Event::Write => write!(f, "write"),
        }
    }
}

/// What to do when an event fires: requeue a parked fiber or invoke a
/// callback inline. A slot holds exactly one of the two by construction.
pub enum Waiter {
    Fiber(Arc<Fiber>),
    Callback(Box<dyn FnOnce() + Send + 'static>),
}

impl Waiter {
    /// Fire the waiter. Callbacks run inline; fibers are requeued into the
    /// current thread's scheduler. Never call while holding an fd-context
    /// lock.
    pub fn dispatch(self) {
        match self {
            Waiter::Callback(f) => f(),
            Waiter::Fiber(fiber) => match tls::scheduler() {
                Some(sched) => sched.schedule_fiber(fiber),
                None => log_warn!(
                    "no scheduler on this thread to requeue fiber {}",
                    fiber.id()
                ),
            },
        }
    }
}

struct FdInner {
    events: u32,
    read: Option<Waiter>,
    write: Option<Waiter>,
}

impl FdInner {
    fn slot_mut(&mut self, event: Event) -> &mut Option<Waiter> {
        match event {
            Event::Read => &mut self.read,
            Event::Write => &mut self.write,
        }
    }
}

/// Per-fd record: event wait slots plus hook-side socket metadata.
pub struct FdContext {
    fd: libc::c_int,
    inner: Mutex<FdInner>,
    is_socket: bool,
    sys_nonblock: AtomicBool,
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdContext {
    /// Create the record for `fd`.
    ///
    /// Sockets are forced to `O_NONBLOCK` here via the *original* `fcntl`
    /// (the descriptor-level flag backs every hooked blocking operation);
    /// the user-visible blocking status is tracked separately.
    pub fn new(fd: libc::c_int) -> FdContext {
        let mut is_socket = false;
        let mut sys_nonblock = false;

        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut st) } == 0 {
            is_socket = (st.st_mode & libc::S_IFMT) == libc::S_IFSOCK;
        }

        if is_socket {
            unsafe {
                let flags = reals::real_fcntl_int(fd, libc::F_GETFL, 0);
                if flags >= 0 {
                    if flags & libc::O_NONBLOCK == 0 {
                        reals::real_fcntl_int(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                    }
                    sys_nonblock = true;
                }
            }
        }

        log_debug!("fd context created: fd={}, socket={}", fd, is_socket);
        FdContext {
            fd,
            inner: Mutex::new(FdInner {
                events: 0,
                read: None,
                write: None,
            }),
            is_socket,
            sys_nonblock: AtomicBool::new(sys_nonblock),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(NO_TIMEOUT),
            send_timeout_ms: AtomicU64::new(NO_TIMEOUT),
        }
    }

    #[inline]
    pub fn fd(&self) -> libc::c_int {
        self.fd
    }

    /// Currently registered event mask
    pub fn events(&self) -> u32 {
        self.inner.lock().unwrap().events
    }

    #[inline]
    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    #[inline]
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_sys_nonblock(&self, v: bool) {
        self.sys_nonblock.store(v, Ordering::Relaxed);
    }

    #[inline]
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_user_nonblock(&self, v: bool) {
        self.user_nonblock.store(v, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_closed(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    /// Per-direction timeout: Read carries the receive timeout, Write the
    /// send timeout. Zero clears.
    pub fn set_timeout(&self, event: Event, ms: u64) {
        let stored = if ms == 0 { NO_TIMEOUT } else { ms };
        match event {
            Event::Read => self.recv_timeout_ms.store(stored, Ordering::Relaxed),
            Event::Write => self.send_timeout_ms.store(stored, Ordering::Relaxed),
        }
    }

    pub fn timeout(&self, event: Event) -> Option<u64> {
        let ms = match event {
            Event::Read => self.recv_timeout_ms.load(Ordering::Relaxed),
            Event::Write => self.send_timeout_ms.load(Ordering::Relaxed),
        };
        if ms == NO_TIMEOUT {
            None
        } else {
            Some(ms)
        }
    }

    /// Register `waiter` for `event` and run `sync_poller(new_mask,
    /// is_first_event)` inside the same critical section.
    ///
    /// Transactional: if the poller update fails, the slot and the mask are
    /// rolled back before the lock is released.
    pub fn register<F>(&self, event: Event, waiter: Waiter, sync_poller: F) -> WeftResult<()>
    where
        F: FnOnce(u32, bool) -> WeftResult<()>,
    {
        let mut inner = self.inner.lock().unwrap();
        if inner.events & event.bits() != 0 {
            log_warn!("fd={} {} event already registered", self.fd, event);
            return Err(WeftError::EventExists);
        }

        let old = inner.events;
        *inner.slot_mut(event) = Some(waiter);
        inner.events = old | event.bits();

        match sync_poller(inner.events, old == 0) {
            Ok(()) => Ok(()),
            Err(e) => {
                *inner.slot_mut(event) = None;
                inner.events = old;
                Err(e)
            }
        }
    }

    /// Drop the registration for `event` without firing its waiter,
    /// syncing the poller under the lock. Absent events are a no-op.
    /// Returns the remaining mask.
    pub fn deregister<F>(&self, event: Event, sync_poller: F) -> WeftResult<u32>
    where
        F: FnOnce(u32) -> WeftResult<()>,
    {
        let mut inner = self.inner.lock().unwrap();
        if inner.events & event.bits() == 0 {
            return Ok(inner.events);
        }

        inner.events &= !event.bits();
        *inner.slot_mut(event) = None;
        if let Err(e) = sync_poller(inner.events) {
            log_debug!("fd={} poller sync failed on deregister: {}", self.fd, e);
        }
        Ok(inner.events)
    }

    /// Move the waiter for `event` out (trigger/cancel paths), clearing the
    /// mask bit and syncing the poller under the lock. The caller
    /// dispatches the returned waiter after the lock is gone; moving it out
    /// first means a re-registration from inside the waiter cannot be
    /// clobbered by a later reset.
    pub fn take<F>(&self, event: Event, sync_poller: F) -> Option<Waiter>
    where
        F: FnOnce(u32) -> WeftResult<()>,
    {
        let mut inner = self.inner.lock().unwrap();
        if inner.events & event.bits() == 0 {
            return None;
        }

        let waiter = inner.slot_mut(event).take();
        inner.events &= !event.bits();
        if let Err(e) = sync_poller(inner.events) {
            log_debug!("fd={} poller sync failed on take: {}", self.fd, e);
        }
        drop(inner);

        if waiter.is_none() {
            log_warn!("fd={} {} event had no waiter", self.fd, event);
        }
        waiter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering::SeqCst;

    fn ok_sync(_mask: u32) -> WeftResult<()> {
        Ok(())
    }

    fn callback_waiter(counter: &Arc<AtomicUsize>) -> Waiter {
        let c = counter.clone();
        Waiter::Callback(Box::new(move || {
            c.fetch_add(1, SeqCst);
        }))
    }

    #[test]
    fn test_register_deregister_mask_roundtrip() {
        let ctx = FdContext::new(-1);
        let counter = Arc::new(AtomicUsize::new(0));

        assert_eq!(ctx.events(), 0);
        ctx.register(Event::Read, callback_waiter(&counter), |mask, first| {
            assert_eq!(mask, Event::Read.bits());
            assert!(first);
            Ok(())
        })
        .unwrap();
        assert_eq!(ctx.events(), Event::Read.bits());

        ctx.register(Event::Write, callback_waiter(&counter), |mask, first| {
            assert_eq!(mask, Event::Read.bits() | Event::Write.bits());
            assert!(!first);
            Ok(())
        })
        .unwrap();

        assert_eq!(ctx.deregister(Event::Write, ok_sync).unwrap(), Event::Read.bits());
        assert_eq!(ctx.deregister(Event::Read, ok_sync).unwrap(), 0);
        // Deregistration never fires waiters.
        assert_eq!(counter.load(SeqCst), 0);
    }

    #[test]
    fn test_double_register_rejected() {
        let ctx = FdContext::new(-1);
        let counter = Arc::new(AtomicUsize::new(0));
        ctx.register(Event::Read, callback_waiter(&counter), |_, _| Ok(()))
            .unwrap();
        let err = ctx
            .register(Event::Read, callback_waiter(&counter), |_, _| Ok(()))
            .unwrap_err();
        assert_eq!(err, WeftError::EventExists);
    }

    #[test]
    fn test_failed_poller_sync_rolls_back() {
        let ctx = FdContext::new(-1);
        let counter = Arc::new(AtomicUsize::new(0));
        let err = ctx
            .register(Event::Read, callback_waiter(&counter), |_, _| {
                Err(WeftError::Os(libc::EBADF))
            })
            .unwrap_err();
        assert_eq!(err, WeftError::Os(libc::EBADF));
        // Neither mask nor slot persists.
        assert_eq!(ctx.events(), 0);
        assert!(ctx.take(Event::Read, ok_sync).is_none());
    }

    #[test]
    fn test_take_fires_at_most_once() {
        let ctx = FdContext::new(-1);
        let counter = Arc::new(AtomicUsize::new(0));
        ctx.register(Event::Read, callback_waiter(&counter), |_, _| Ok(()))
            .unwrap();

        let waiter = ctx.take(Event::Read, ok_sync).expect("registered waiter");
        assert!(ctx.take(Event::Read, ok_sync).is_none(), "second take is empty");
        waiter.dispatch();
        assert_eq!(counter.load(SeqCst), 1);
    }

    #[test]
    fn test_timeouts_by_direction() {
        let ctx = FdContext::new(-1);
        assert_eq!(ctx.timeout(Event::Read), None);
        ctx.set_timeout(Event::Read, 250);
        ctx.set_timeout(Event::Write, 500);
        assert_eq!(ctx.timeout(Event::Read), Some(250));
        assert_eq!(ctx.timeout(Event::Write), Some(500));
        ctx.set_timeout(Event::Read, 0);
        assert_eq!(ctx.timeout(Event::Read), None);
    }
}
