//! Architecture-specific context switching
//!
//! Each architecture module provides the same three items:
//! - `SavedRegs`: the callee-saved register block, `#[repr(C)]` because the
//!   assembly addresses fields by byte offset
//! - `init_context`: arrange for the first switch into a register block to
//!   enter a zero-argument function on a fresh stack
//! - `context_switch`: save the current callee-saved state and resume another

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "aarch64")]
pub mod aarch64;
