//! Fiber identity
//!
//! Ids are assigned from a process-global monotonic counter and never
//! reused; a pooled fiber keeps its original id across `reset`.

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Reserved id for per-thread main fibers
pub const MAIN_FIBER_ID: u64 = 0;

/// Global fiber counter. Starts at 1; id 0 is the main-fiber id.
static FIBER_COUNT: AtomicU64 = AtomicU64::new(1);

/// Unique fiber identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(u64);

impl FiberId {
    /// Allocate the next fiber id
    #[inline]
    pub fn next() -> FiberId {
        FiberId(FIBER_COUNT.fetch_add(1, Ordering::Relaxed))
    }

    /// The shared id of per-thread main fibers
    #[inline]
    pub const fn main() -> FiberId {
        FiberId(MAIN_FIBER_ID)
    }

    #[inline]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_monotonic() {
        let a = FiberId::next();
        let b = FiberId::next();
        assert!(b.as_u64() > a.as_u64());
        assert!(a.as_u64() > MAIN_FIBER_ID);
    }
}
