//! Interposed POSIX entry points
//!
//! Policy per category:
//! - sleep family: arm a one-shot timer that requeues the current fiber,
//!   then yield
//! - socket/accept: pass through, then register the descriptor and force
//!   `O_NONBLOCK` behind the user's back
//! - connect: nonblocking connect + park on Write readiness, bounded by
//!   the fd's send timeout
//! - read/write families: the generic template below
//! - close/fcntl/ioctl/setsockopt: keep the fd table and the user-visible
//!   blocking status coherent, then pass through
//!
//! `fcntl` and `ioctl` are defined with the fixed-arity signatures C
//! callers use on the supported ABIs; stable Rust cannot define
//! C-variadics.

use libc::{
    c_int, c_long, c_uint, c_ulong, c_void, iovec, msghdr, sockaddr, socklen_t, size_t, ssize_t,
    timespec, timeval, useconds_t,
};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use weft_core::log_warn;
use weft_io::{Event, IoScheduler};
use weft_runtime::tls;
use weft_runtime::yield_now;

macro_rules! real {
    ($sym:ident: fn($($ty:ty),* $(,)?) -> $ret:ty) => {{
        let p = crate::reals::$sym.get();
        debug_assert!(!p.is_null(), concat!("dlsym failed for ", stringify!($sym)));
        std::mem::transmute::<*mut c_void, unsafe extern "C" fn($($ty),*) -> $ret>(p)
    }};
}

#[inline]
fn errno() -> c_int {
    unsafe { *libc::__errno_location() }
}

#[inline]
fn set_errno(e: c_int) {
    unsafe { *libc::__errno_location() = e }
}

/// Shared cancellation flag between an I/O wait and its timeout timer.
struct CancelFlag {
    err: AtomicI32,
}

impl CancelFlag {
    fn new() -> CancelFlag {
        CancelFlag {
            err: AtomicI32::new(0),
        }
    }

    fn set(&self, e: c_int) {
        self.err.store(e, Ordering::Release);
    }

    fn get(&self) -> Option<c_int> {
        match self.err.load(Ordering::Acquire) {
            0 => None,
            e => Some(e),
        }
    }
}

/// Park the current fiber for `ms` milliseconds via a reactor timer.
/// Returns false when there is no current fiber to park.
fn park_on_timer(io: &IoScheduler, ms: u64) -> bool {
    let Some(cur) = tls::current_fiber() else {
        return false;
    };
    let io2 = io.clone();
    io.add_timer(
        ms,
        Arc::new(move || {
            io2.schedule_fiber(cur.clone());
        }),
        false,
    );
    yield_now();
    true
}

/// The generic blocking-I/O template.
///
/// Retry the original on EINTR; on EAGAIN, register readiness (arming the
/// per-direction timeout when one is configured), yield, and either fail
/// with the timeout's errno or loop back to the original call.
unsafe fn do_io<F>(fd: c_int, name: &str, event: Event, orig: F) -> ssize_t
where
    F: Fn() -> ssize_t,
{
    if !tls::is_hook_enabled() {
        return orig();
    }
    let Some(io) = IoScheduler::global() else {
        return orig();
    };
    let Some(ctx) = io.fd_table().get(fd, false) else {
        return orig();
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return orig();
    }

    let timeout_ms = ctx.timeout(event);

    loop {
        let mut n = orig();
        while n == -1 && errno() == libc::EINTR {
            n = orig();
        }
        if !(n == -1 && errno() == libc::EAGAIN) {
            return n;
        }

        if tls::current_fiber().is_none() {
            // Hook enabled on a bare thread: nothing to park.
            return -1;
        }

        let flag = Arc::new(CancelFlag::new());
        let timer = timeout_ms.map(|ms| {
            let weak = Arc::downgrade(&flag);
            let io2 = io.clone();
            io.add_timer(
                ms,
                Arc::new(move || {
                    let Some(flag) = weak.upgrade() else {
                        return;
                    };
                    if flag.get().is_some() {
                        return;
                    }
                    flag.set(libc::ETIMEDOUT);
                    let _ = io2.cancel_event(fd, event);
                }),
                false,
            )
        });

        if let Err(e) = io.add_event(fd, event, None) {
            log_warn!("{}: add_event failed, fd={}, err={}", name, fd, e);
            if let Some(t) = timer {
                t.cancel();
            }
            set_errno(libc::EAGAIN);
            return -1;
        }

        yield_now();

        if let Some(t) = timer {
            t.cancel();
        }
        if let Some(e) = flag.get() {
            set_errno(e);
            return -1;
        }
        // Readiness fired; retry the original call.
    }
}

// -- sleep family ------------------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn sleep(seconds: c_uint) -> c_uint {
    if tls::is_hook_enabled() {
        if let Some(io) = IoScheduler::global() {
            if park_on_timer(&io, seconds as u64 * 1000) {
                return 0;
            }
        }
    }
    real!(SLEEP: fn(c_uint) -> c_uint)(seconds)
}

#[no_mangle]
pub unsafe extern "C" fn usleep(usec: useconds_t) -> c_int {
    if tls::is_hook_enabled() {
        if let Some(io) = IoScheduler::global() {
            if park_on_timer(&io, usec as u64 / 1000) {
                return 0;
            }
        }
    }
    real!(USLEEP: fn(useconds_t) -> c_int)(usec)
}

#[no_mangle]
pub unsafe extern "C" fn nanosleep(req: *const timespec, rem: *mut timespec) -> c_int {
    if tls::is_hook_enabled() && !req.is_null() {
        if let Some(io) = IoScheduler::global() {
            let ms = (*req).tv_sec as u64 * 1000 + (*req).tv_nsec as u64 / 1_000_000;
            if park_on_timer(&io, ms) {
                return 0;
            }
        }
    }
    real!(NANOSLEEP: fn(*const timespec, *mut timespec) -> c_int)(req, rem)
}

// -- socket creation ---------------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    let fd = real!(SOCKET: fn(c_int, c_int, c_int) -> c_int)(domain, ty, protocol);
    if fd < 0 || !tls::is_hook_enabled() {
        return fd;
    }
    if let Some(io) = IoScheduler::global() {
        // Context creation probes the descriptor and forces O_NONBLOCK on
        // sockets; the user-visible blocking status stays separate.
        let _ = io.fd_table().get(fd, true);
    }
    fd
}

#[no_mangle]
pub unsafe extern "C" fn accept(sockfd: c_int, addr: *mut sockaddr, addrlen: *mut socklen_t) -> c_int {
    let fd = do_io(sockfd, "accept", Event::Read, || unsafe {
        real!(ACCEPT: fn(c_int, *mut sockaddr, *mut socklen_t) -> c_int)(sockfd, addr, addrlen)
            as ssize_t
    }) as c_int;

    if fd >= 0 && tls::is_hook_enabled() {
        if let Some(io) = IoScheduler::global() {
            let _ = io.fd_table().get(fd, true);
        }
    }
    fd
}

// -- connect -----------------------------------------------------------------

/// Process-wide default connect timeout (none).
const DEFAULT_CONNECT_TIMEOUT_MS: Option<u64> = None;

#[no_mangle]
pub unsafe extern "C" fn connect(sockfd: c_int, addr: *const sockaddr, addrlen: socklen_t) -> c_int {
    let passthrough =
        || unsafe { real!(CONNECT: fn(c_int, *const sockaddr, socklen_t) -> c_int)(sockfd, addr, addrlen) };

    if !tls::is_hook_enabled() {
        return passthrough();
    }
    let Some(io) = IoScheduler::global() else {
        return passthrough();
    };
    let Some(ctx) = io.fd_table().get(sockfd, true) else {
        return passthrough();
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return passthrough();
    }

    let n = passthrough();
    if n == 0 {
        return 0;
    }
    if !(n == -1 && errno() == libc::EINPROGRESS) {
        return n;
    }
    if tls::current_fiber().is_none() {
        return n;
    }

    // A configured send timeout bounds the connect.
    let timeout_ms = ctx.timeout(Event::Write).or(DEFAULT_CONNECT_TIMEOUT_MS);

    let flag = Arc::new(CancelFlag::new());
    let timer = timeout_ms.map(|ms| {
        let weak = Arc::downgrade(&flag);
        let io2 = io.clone();
        io.add_timer(
            ms,
            Arc::new(move || {
                let Some(flag) = weak.upgrade() else {
                    return;
                };
                if flag.get().is_some() {
                    return;
                }
                flag.set(libc::ETIMEDOUT);
                let _ = io2.cancel_event(sockfd, Event::Write);
            }),
            false,
        )
    });

    if let Err(e) = io.add_event(sockfd, Event::Write, None) {
        log_warn!("connect: add_event failed, fd={}, err={}", sockfd, e);
        if let Some(t) = timer {
            t.cancel();
        }
        return -1;
    }

    yield_now();

    if let Some(t) = timer {
        t.cancel();
    }
    if let Some(e) = flag.get() {
        set_errno(e);
        return -1;
    }

    // Writable: the three-way handshake finished one way or the other.
    let mut err: c_int = 0;
    let mut len = std::mem::size_of::<c_int>() as socklen_t;
    real!(GETSOCKOPT: fn(c_int, c_int, c_int, *mut c_void, *mut socklen_t) -> c_int)(
        sockfd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut err as *mut c_int as *mut c_void,
        &mut len,
    );
    if err != 0 {
        set_errno(err);
        return -1;
    }
    0
}

// -- read family -------------------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    do_io(fd, "read", Event::Read, || unsafe {
        real!(READ: fn(c_int, *mut c_void, size_t) -> ssize_t)(fd, buf, count)
    })
}

#[no_mangle]
pub unsafe extern "C" fn readv(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, "readv", Event::Read, || unsafe {
        real!(READV: fn(c_int, *const iovec, c_int) -> ssize_t)(fd, iov, iovcnt)
    })
}

#[no_mangle]
pub unsafe extern "C" fn recv(sockfd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(sockfd, "recv", Event::Read, || unsafe {
        real!(RECV: fn(c_int, *mut c_void, size_t, c_int) -> ssize_t)(sockfd, buf, len, flags)
    })
}

#[no_mangle]
pub unsafe extern "C" fn recvfrom(
    sockfd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    src_addr: *mut sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    do_io(sockfd, "recvfrom", Event::Read, || unsafe {
        real!(RECVFROM: fn(c_int, *mut c_void, size_t, c_int, *mut sockaddr, *mut socklen_t) -> ssize_t)(
            sockfd, buf, len, flags, src_addr, addrlen,
        )
    })
}

#[no_mangle]
pub unsafe extern "C" fn recvmsg(sockfd: c_int, msg: *mut msghdr, flags: c_int) -> ssize_t {
    do_io(sockfd, "recvmsg", Event::Read, || unsafe {
        real!(RECVMSG: fn(c_int, *mut msghdr, c_int) -> ssize_t)(sockfd, msg, flags)
    })
}

// -- write family ------------------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    do_io(fd, "write", Event::Write, || unsafe {
        real!(WRITE: fn(c_int, *const c_void, size_t) -> ssize_t)(fd, buf, count)
    })
}

#[no_mangle]
pub unsafe extern "C" fn writev(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, "writev", Event::Write, || unsafe {
        real!(WRITEV: fn(c_int, *const iovec, c_int) -> ssize_t)(fd, iov, iovcnt)
    })
}

#[no_mangle]
pub unsafe extern "C" fn send(sockfd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(sockfd, "send", Event::Write, || unsafe {
        real!(SEND: fn(c_int, *const c_void, size_t, c_int) -> ssize_t)(sockfd, buf, len, flags)
    })
}

#[no_mangle]
pub unsafe extern "C" fn sendto(
    sockfd: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    dest_addr: *const sockaddr,
    addrlen: socklen_t,
) -> ssize_t {
    do_io(sockfd, "sendto", Event::Write, || unsafe {
        real!(SENDTO: fn(c_int, *const c_void, size_t, c_int, *const sockaddr, socklen_t) -> ssize_t)(
            sockfd, buf, len, flags, dest_addr, addrlen,
        )
    })
}

#[no_mangle]
pub unsafe extern "C" fn sendmsg(sockfd: c_int, msg: *const msghdr, flags: c_int) -> ssize_t {
    do_io(sockfd, "sendmsg", Event::Write, || unsafe {
        real!(SENDMSG: fn(c_int, *const msghdr, c_int) -> ssize_t)(sockfd, msg, flags)
    })
}

// -- descriptor management ---------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn close(fd: c_int) -> c_int {
    let real_close = real!(CLOSE: fn(c_int) -> c_int);
    if !tls::is_hook_enabled() {
        return real_close(fd);
    }
    if let Some(io) = IoScheduler::global() {
        // Fire any parked waiters so they observe EOF, then drop the
        // context before the descriptor number can be reused.
        io.close_fd(fd);
    }
    real_close(fd)
}

#[no_mangle]
pub unsafe extern "C" fn fcntl(fd: c_int, cmd: c_int, arg: c_long) -> c_int {
    let real_fcntl = real!(FCNTL: fn(c_int, c_int, c_long) -> c_int);

    let ctx = IoScheduler::global().and_then(|io| io.fd_table().get(fd, false));

    match cmd {
        libc::F_SETFL => {
            let Some(ctx) = ctx.filter(|c| !c.is_closed() && c.is_socket()) else {
                return real_fcntl(fd, cmd, arg);
            };
            // Track what the user asked for; the descriptor itself keeps
            // O_NONBLOCK whenever the runtime needs it.
            ctx.set_user_nonblock(arg & libc::O_NONBLOCK as c_long != 0);
            let mut arg = arg;
            if ctx.sys_nonblock() {
                arg |= libc::O_NONBLOCK as c_long;
            } else {
                arg &= !(libc::O_NONBLOCK as c_long);
            }
            real_fcntl(fd, cmd, arg)
        }
        libc::F_GETFL => {
            let flags = real_fcntl(fd, cmd, 0);
            let Some(ctx) = ctx.filter(|c| !c.is_closed() && c.is_socket()) else {
                return flags;
            };
            // Report the blocking status the user believes it set.
            if ctx.user_nonblock() {
                flags | libc::O_NONBLOCK
            } else {
                flags & !libc::O_NONBLOCK
            }
        }
        _ => real_fcntl(fd, cmd, arg),
    }
}

#[no_mangle]
pub unsafe extern "C" fn ioctl(fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
    if request == libc::FIONBIO && !arg.is_null() {
        if let Some(io) = IoScheduler::global() {
            if let Some(ctx) = io.fd_table().get(fd, false) {
                if !ctx.is_closed() && ctx.is_socket() {
                    ctx.set_user_nonblock(*(arg as *const c_int) != 0);
                }
            }
        }
    }
    real!(IOCTL: fn(c_int, c_ulong, *mut c_void) -> c_int)(fd, request, arg)
}

#[no_mangle]
pub unsafe extern "C" fn setsockopt(
    sockfd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> c_int {
    if tls::is_hook_enabled()
        && level == libc::SOL_SOCKET
        && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
        && !optval.is_null()
    {
        if let Some(io) = IoScheduler::global() {
            if let Some(ctx) = io.fd_table().get(sockfd, true) {
                let tv = &*(optval as *const timeval);
                let ms = tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000;
                let event = if optname == libc::SO_RCVTIMEO {
                    Event::Read
                } else {
                    Event::Write
                };
                ctx.set_timeout(event, ms);
            }
        }
    }
    // Pass through so getsockopt stays consistent.
    real!(SETSOCKOPT: fn(c_int, c_int, c_int, *const c_void, socklen_t) -> c_int)(
        sockfd, level, optname, optval, optlen,
    )
}

#[no_mangle]
pub unsafe extern "C" fn getsockopt(
    sockfd: c_int,
    level: c_int,
    optname: c_int,
    optval: *mut c_void,
    optlen: *mut socklen_t,
) -> c_int {
    real!(GETSOCKOPT: fn(c_int, c_int, c_int, *mut c_void, *mut socklen_t) -> c_int)(
        sockfd, level, optname, optval, optlen,
    )
}
