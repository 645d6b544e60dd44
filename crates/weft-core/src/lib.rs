//! # weft-core
//!
//! Platform-independent building blocks shared by the weft fiber runtime:
//! - Fiber state machine and ids
//! - Error types
//! - Kernel-style leveled logging macros

pub mod error;
pub mod id;
pub mod klog;
pub mod state;

pub use error::{WeftError, WeftResult};
pub use id::FiberId;
pub use state::FiberState;
