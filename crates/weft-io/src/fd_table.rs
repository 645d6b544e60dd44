//! Fd table
//!
//! Vector of fd contexts indexed by descriptor, behind a reader-writer
//! lock. Reads take the shared lock; creation and growth take the
//! exclusive lock.

use std::sync::{Arc, RwLock};

use weft_core::log_debug;

use crate::fd_context::FdContext;

/// Initial table capacity
pub const INITIAL_FD_CAPACITY: usize = 64;

/// Registry of fd contexts
pub struct FdTable {
    entries: RwLock<Vec<Option<Arc<FdContext>>>>,
}

impl FdTable {
    pub fn new() -> FdTable {
        let mut entries = Vec::new();
        entries.resize_with(INITIAL_FD_CAPACITY, || None);
        FdTable {
            entries: RwLock::new(entries),
        }
    }

    /// Look up the context for `fd`.
    ///
    /// With `auto_create` the table grows to `max(fd + 1, 1.5 * size)` and
    /// a fresh context is installed; without it the table is never grown.
    /// Negative descriptors always yield `None`.
    pub fn get(&self, fd: libc::c_int, auto_create: bool) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;

        {
            let entries = self.entries.read().unwrap();
            if idx < entries.len() {
                if entries[idx].is_some() || !auto_create {
                    return entries[idx].clone();
                }
            } else if !auto_create {
                return None;
            }
        }

        let mut entries = self.entries.write().unwrap();
        if idx >= entries.len() {
            let old = entries.len();
            let want = std::cmp::max(idx + 1, old + old / 2);
            entries.resize_with(want, || None);
            log_debug!("fd table resized: {} -> {}", old, want);
        }
        if entries[idx].is_none() {
            entries[idx] = Some(Arc::new(FdContext::new(fd)));
        }
        entries[idx].clone()
    }

    /// Reset the entry for `fd` (close path).
    pub fn del(&self, fd: libc::c_int) {
        if fd < 0 {
            return;
        }
        let idx = fd as usize;
        let mut entries = self.entries.write().unwrap();
        if idx < entries.len() {
            entries[idx] = None;
        }
    }

    /// Current table capacity
    pub fn capacity(&self) -> usize {
        self.entries.read().unwrap().len()
    }
}

impl Default for FdTable {
    fn default() -> Self {
        FdTable::new()
    }
}
