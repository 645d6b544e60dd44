//! # weft-hook
//!
//! Transparent syscall interception. The crate exports `#[no_mangle]`
//! definitions of the blocking POSIX entry points; linked into a binary (or
//! LD_PRELOADed as a cdylib) they shadow libc's and reroute sleeps and
//! socket I/O through the installed [`weft_io::IoScheduler`].
//!
//! Interception is gated per thread: nothing changes until
//! [`set_hook_enabled`]`(true)` on the calling thread, and every shim falls
//! through to the original symbol (resolved via `dlsym(RTLD_NEXT)`) when
//! the flag is off, no reactor is installed, the descriptor is not a
//! socket, or the user asked for nonblocking behavior explicitly.

mod hooks;
mod reals;

// The hook-enable flag lives in the runtime's thread context.
pub use weft_runtime::tls::{is_hook_enabled, set_hook_enabled};

/// Pre-resolve the whole original-symbol table.
///
/// Resolution is lazy per symbol either way; calling this once at startup
/// keeps the first hooked syscall from paying the dlsym cost.
pub fn init_hooks() {
    reals::resolve_all();
}
