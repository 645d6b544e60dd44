//! # weft-io
//!
//! The I/O half of the weft runtime: an epoll poller, a per-fd registry of
//! readiness waiters, a monotonic timer set, and the I/O scheduler that
//! glues them to the fiber scheduler with a dedicated reactor thread.

pub mod fd_context;
pub mod fd_table;
pub mod io_scheduler;
pub mod poller;
pub mod reals;
pub mod timer;

pub use fd_context::{Event, FdContext, Waiter};
pub use fd_table::FdTable;
pub use io_scheduler::IoScheduler;
pub use poller::EpollPoller;
pub use timer::{Timer, TimerCallback, TimerManager};
