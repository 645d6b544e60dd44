//! # weft-runtime
//!
//! The stackful fiber runtime:
//! - Architecture-specific context switching (naked assembly)
//! - Stack allocation and the shared-stack pool
//! - Fiber lifecycle (resume / yield / reset) and the switch-stack machinery
//! - Per-thread runtime context
//! - Task queue, fiber pool and the M:N scheduler

pub mod arch;
pub mod config;
pub mod context;
pub mod fiber;
pub mod pool;
pub mod queue;
pub mod scheduler;
pub mod shared_stack;
pub mod stack;
pub mod switch;
pub mod tls;

pub use config::SchedulerConfig;
pub use fiber::{yield_now, Fiber, FiberFn};
pub use pool::{FiberPool, PoolStatistics};
pub use queue::{Task, TaskQueue};
pub use scheduler::Scheduler;
pub use shared_stack::SharedStackPool;
pub use stack::DEFAULT_STACK_SIZE;

// Architecture detection
cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub use arch::x86_64 as current_arch;
    } else if #[cfg(target_arch = "aarch64")] {
        pub use arch::aarch64 as current_arch;
    } else {
        compile_error!("Unsupported architecture");
    }
}
