//! Original symbol resolution
//!
//! Lazily resolved pointers to the real libc functions via
//! `dlsym(RTLD_NEXT)`. Code that must never recurse through the hook layer
//! (fd-context initialization, the hook shims themselves) calls through
//! these instead of the plain symbols.

use libc::{c_char, c_int, c_void};
use std::sync::atomic::{AtomicPtr, Ordering};

/// A lazily-resolved pointer to the next definition of a symbol.
pub struct RealSymbol {
    ptr: AtomicPtr<c_void>,
    name: &'static str,
}

impl RealSymbol {
    /// `name` must be NUL-terminated.
    pub const fn new(name: &'static str) -> RealSymbol {
        RealSymbol {
            ptr: AtomicPtr::new(std::ptr::null_mut()),
            name,
        }
    }

    /// Resolve (once) and return the real function pointer.
    pub fn get(&self) -> *mut c_void {
        let p = self.ptr.load(Ordering::Acquire);
        if !p.is_null() {
            return p;
        }
        let f = unsafe { libc::dlsym(libc::RTLD_NEXT, self.name.as_ptr() as *const c_char) };
        self.ptr.store(f, Ordering::Release);
        f
    }
}

static REAL_FCNTL: RealSymbol = RealSymbol::new("fcntl\0");

/// The real `fcntl` with an integer third argument.
///
/// Used by fd-context initialization to toggle `O_NONBLOCK` without
/// bouncing through an interposed `fcntl`.
pub unsafe fn real_fcntl_int(fd: c_int, cmd: c_int, arg: c_int) -> c_int {
    let p = REAL_FCNTL.get();
    if p.is_null() {
        weft_core::log_error!("dlsym(RTLD_NEXT, \"fcntl\") failed");
        return -1;
    }
    let f: unsafe extern "C" fn(c_int, c_int, c_int) -> c_int = std::mem::transmute(p);
    f(fd, cmd, arg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolves_fcntl() {
        let p = REAL_FCNTL.get();
        assert!(!p.is_null());
        // Second call returns the cached pointer.
        assert_eq!(p, REAL_FCNTL.get());
    }

    #[test]
    fn test_real_fcntl_works() {
        // F_GETFD on stdin should not fail.
        let flags = unsafe { real_fcntl_int(0, libc::F_GETFD, 0) };
        assert!(flags >= 0);
    }
}
