//! # weft
//!
//! Stackful coroutines multiplexed over a POSIX thread pool, an epoll
//! reactor with timers, and a syscall-interception layer that turns
//! blocking socket I/O into fiber suspensions.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! let io = weft::IoScheduler::new(4, "app").unwrap();
//! io.install_global();
//! io.start();
//!
//! io.schedule(|| {
//!     weft::set_hook_enabled(true);
//!     // Blocking-looking socket code runs here without pinning the
//!     // worker thread.
//! });
//!
//! io.add_timer(200, Arc::new(|| println!("tick")), false);
//! ```

pub use weft_core::klog::{self, LogLevel};
pub use weft_core::{FiberId, FiberState, WeftError, WeftResult};

pub use weft_runtime::{
    yield_now, Fiber, FiberFn, FiberPool, PoolStatistics, Scheduler, SchedulerConfig,
    SharedStackPool, Task, TaskQueue, DEFAULT_STACK_SIZE,
};

pub use weft_io::{Event, EpollPoller, FdContext, FdTable, IoScheduler, Timer, TimerManager};

pub use weft_hook::{init_hooks, is_hook_enabled, set_hook_enabled};
