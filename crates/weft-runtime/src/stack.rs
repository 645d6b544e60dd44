//! Fiber stack allocation
//!
//! Stacks come straight from mmap: anonymous private mappings are
//! zero-filled by the kernel and returned to it on deallocation.

use weft_core::log_error;

/// Default stack size for an independently-stacked fiber (128 KiB)
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// mmap-backed stack allocator
pub struct StackAllocator;

impl StackAllocator {
    /// Allocate a zero-filled region of exactly `size` bytes.
    ///
    /// Allocation failure is fatal: a runtime that cannot map a fiber stack
    /// cannot make progress.
    pub fn allocate(size: usize) -> *mut u8 {
        assert!(size > 0, "zero-sized stack requested");

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            log_error!(
                "stack allocation of {} bytes failed: errno={}",
                size,
                std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
            );
            std::process::abort();
        }

        ptr as *mut u8
    }

    /// Release a region previously returned by `allocate`.
    pub fn deallocate(ptr: *mut u8, size: usize) {
        if ptr.is_null() {
            return;
        }
        unsafe {
            libc::munmap(ptr as *mut libc::c_void, size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_is_zeroed_and_writable() {
        let size = 16 * 1024;
        let ptr = StackAllocator::allocate(size);
        unsafe {
            assert_eq!(*ptr, 0);
            assert_eq!(*ptr.add(size - 1), 0);
            *ptr = 0xAB;
            *ptr.add(size - 1) = 0xCD;
            assert_eq!(*ptr, 0xAB);
        }
        StackAllocator::deallocate(ptr, size);
    }
}
