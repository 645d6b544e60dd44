//! Fiber pool
//!
//! Process-wide pool of terminated fibers re-armed for new work, so hot
//! schedulers recycle stacks instead of mapping fresh ones.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};
use std::sync::Arc;

use weft_core::{log_debug, log_warn};

use crate::fiber::{Fiber, FiberFn};
use crate::stack::DEFAULT_STACK_SIZE;
use crate::tls::{self, StackMode};

/// Default minimum pool capacity
pub const DEFAULT_POOL_MIN: usize = 10;

/// Default maximum pool capacity
pub const DEFAULT_POOL_MAX: usize = 1000;

/// Pool counters, snapshotted atomically
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStatistics {
    pub total_created: usize,
    pub total_reused: usize,
    pub idle_count: usize,
}

/// Reusable pool of terminated fibers
pub struct FiberPool {
    min_size: usize,
    max_size: AtomicUsize,
    idle: Mutex<VecDeque<Arc<Fiber>>>,
    total_created: AtomicUsize,
    total_reused: AtomicUsize,
}

static GLOBAL_POOL: OnceLock<FiberPool> = OnceLock::new();

impl FiberPool {
    /// The process-wide pool instance.
    pub fn global() -> &'static FiberPool {
        GLOBAL_POOL.get_or_init(|| FiberPool::new(DEFAULT_POOL_MIN, DEFAULT_POOL_MAX))
    }

    pub fn new(min_size: usize, max_size: usize) -> FiberPool {
        FiberPool {
            min_size,
            max_size: AtomicUsize::new(max_size),
            idle: Mutex::new(VecDeque::new()),
            total_created: AtomicUsize::new(0),
            total_reused: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn min_size(&self) -> usize {
        self.min_size
    }

    #[inline]
    pub fn max_size(&self) -> usize {
        self.max_size.load(Ordering::Relaxed)
    }

    /// Get a Ready fiber running `f`: a recycled idle fiber when one is
    /// available, a fresh one otherwise.
    ///
    /// On a thread in shared-stack mode, fresh fibers bind to the thread's
    /// shared-stack pool.
    pub fn acquire(&self, f: FiberFn) -> Arc<Fiber> {
        if let Some(fiber) = self.idle.lock().unwrap().pop_front() {
            fiber.reset(f);
            self.total_reused.fetch_add(1, Ordering::Relaxed);
            log_debug!("fiber pool reuse: id={}", fiber.id());
            return fiber;
        }

        self.total_created.fetch_add(1, Ordering::Relaxed);
        if tls::stack_mode() == StackMode::Shared {
            Fiber::with_shared_stack(f, "")
        } else {
            Fiber::new(f, DEFAULT_STACK_SIZE, "")
        }
    }

    /// Return a terminated fiber to the pool. Full pool: the fiber is
    /// dropped. Shared-stack fibers are never pooled (their slot binding is
    /// thread-affine) and are dropped as well.
    pub fn release(&self, fiber: Arc<Fiber>) {
        if !fiber.state().is_terminated() {
            log_warn!(
                "fiber pool release rejected: id={}, state={}",
                fiber.id(),
                fiber.state()
            );
            return;
        }
        if fiber.uses_shared_stack() {
            return;
        }

        let mut idle = self.idle.lock().unwrap();
        if idle.len() >= self.max_size.load(Ordering::Relaxed) {
            return;
        }
        idle.push_back(fiber);
    }

    /// Change the maximum capacity, dropping surplus idle fibers.
    pub fn resize(&self, new_max: usize) {
        self.max_size.store(new_max, Ordering::Relaxed);
        let mut idle = self.idle.lock().unwrap();
        while idle.len() > new_max {
            idle.pop_back();
        }
    }

    /// Drop every idle fiber and reset the counters.
    pub fn clear(&self) {
        self.total_created.store(0, Ordering::Relaxed);
        self.total_reused.store(0, Ordering::Relaxed);
        self.idle.lock().unwrap().clear();
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap().len()
    }

    pub fn statistics(&self) -> PoolStatistics {
        PoolStatistics {
            total_created: self.total_created.load(Ordering::Relaxed),
            total_reused: self.total_reused.load(Ordering::Relaxed),
            idle_count: self.idle.lock().unwrap().len(),
        }
    }
}
