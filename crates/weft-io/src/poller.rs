//! epoll wrapper
//!
//! Thin mapping onto the OS readiness multiplexor. Registrations carry an
//! opaque pointer (the fd context); the wake pipe is registered with a null
//! pointer so the reactor can tell it apart.

use libc::c_void;
use weft_core::{WeftError, WeftResult};

/// Thin wrapper over an epoll instance
pub struct EpollPoller {
    epfd: libc::c_int,
    max_events: usize,
}

impl EpollPoller {
    pub fn new(max_events: usize) -> WeftResult<EpollPoller> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(WeftError::last_os_error());
        }
        Ok(EpollPoller { epfd, max_events })
    }

    fn ctl(&self, op: libc::c_int, fd: libc::c_int, events: u32, ptr: *mut c_void) -> WeftResult<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: ptr as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if ret < 0 {
            return Err(WeftError::last_os_error());
        }
        Ok(())
    }

    /// Register `fd` for `events`, tagging readiness with `ptr`.
    pub fn add_event(&self, fd: libc::c_int, events: u32, ptr: *mut c_void) -> WeftResult<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, events, ptr)
    }

    /// Change the registered event mask for `fd`.
    pub fn mod_event(&self, fd: libc::c_int, events: u32, ptr: *mut c_void) -> WeftResult<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, events, ptr)
    }

    /// Remove `fd` from the interest set.
    pub fn del_event(&self, fd: libc::c_int) -> WeftResult<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0, std::ptr::null_mut())
    }

    /// Block up to `timeout_ms` and fill `out` with ready entries.
    ///
    /// An interrupted wait counts as zero ready entries.
    pub fn wait(&self, timeout_ms: i32, out: &mut Vec<libc::epoll_event>) -> WeftResult<usize> {
        out.clear();
        out.reserve(self.max_events);

        let n = unsafe {
            libc::epoll_wait(self.epfd, out.as_mut_ptr(), self.max_events as i32, timeout_ms)
        };
        if n < 0 {
            let err = WeftError::last_os_error();
            if err == WeftError::Os(libc::EINTR) {
                return Ok(0);
            }
            return Err(err);
        }

        unsafe { out.set_len(n as usize) };
        Ok(n as usize)
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_times_out_empty() {
        let poller = EpollPoller::new(16).unwrap();
        let mut events = Vec::new();
        let n = poller.wait(10, &mut events).unwrap();
        assert_eq!(n, 0);
        assert!(events.is_empty());
    }

    #[test]
    fn test_pipe_readiness() {
        let poller = EpollPoller::new(16).unwrap();
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        let tag = 0xDEAD_BEEFusize as *mut c_void;
        poller.add_event(fds[0], libc::EPOLLIN as u32, tag).unwrap();

        // Nothing readable yet.
        let mut events = Vec::new();
        assert_eq!(poller.wait(10, &mut events).unwrap(), 0);

        let byte = [7u8];
        assert_eq!(
            unsafe { libc::write(fds[1], byte.as_ptr() as *const c_void, 1) },
            1
        );

        let n = poller.wait(1000, &mut events).unwrap();
        assert_eq!(n, 1);
        let ev0_u64 = events[0].u64;
        let ev0_events = events[0].events;
        assert_eq!(ev0_u64, tag as u64);
        assert!(ev0_events & libc::EPOLLIN as u32 != 0);

        poller.del_event(fds[0]).unwrap();
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_mod_event_changes_mask() {
        let poller = EpollPoller::new(16).unwrap();
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) }, 0);

        poller
            .add_event(fds[0], libc::EPOLLIN as u32, std::ptr::null_mut())
            .unwrap();
        // A fresh socketpair end is writable but we only watch reads.
        let mut events = Vec::new();
        assert_eq!(poller.wait(10, &mut events).unwrap(), 0);

        poller
            .mod_event(
                fds[0],
                (libc::EPOLLIN | libc::EPOLLOUT) as u32,
                std::ptr::null_mut(),
            )
            .unwrap();
        let n = poller.wait(1000, &mut events).unwrap();
        assert_eq!(n, 1);
        let ev0_events = events[0].events;
        assert!(ev0_events & libc::EPOLLOUT as u32 != 0);

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
