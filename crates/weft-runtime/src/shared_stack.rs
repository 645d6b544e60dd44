//! Shared execution stacks
//!
//! A fixed ring of large stack buffers handed out round-robin. Several
//! fibers share one slot sequentially: the switch machinery copies a
//! displaced occupant's live bytes into its private save buffer and copies
//! the incoming fiber's saved bytes back before the register switch
//! completes.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use weft_core::log_debug;

use crate::fiber::Fiber;
use crate::stack::StackAllocator;

/// Default number of slots in a pool
pub const DEFAULT_SLOT_COUNT: usize = 4;

/// Default size of one slot (128 KiB)
pub const DEFAULT_SLOT_SIZE: usize = 128 * 1024;

/// One shared stack buffer.
///
/// At most one fiber occupies a slot at a time. The occupant reference is
/// only read and written on the owning thread's switch stack, which is what
/// makes the plain `UnsafeCell` sound.
pub struct StackSlot {
    buffer: *mut u8,
    size: usize,
    occupant: UnsafeCell<Weak<Fiber>>,
}

unsafe impl Send for StackSlot {}
unsafe impl Sync for StackSlot {}

impl StackSlot {
    fn new(size: usize) -> StackSlot {
        StackSlot {
            buffer: StackAllocator::allocate(size),
            size,
            occupant: UnsafeCell::new(Weak::new()),
        }
    }

    /// Low end of the buffer
    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.buffer
    }

    /// High end of the buffer (stack top; stacks grow down)
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.buffer.add(self.size) }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Current occupant, if it is still alive.
    pub(crate) unsafe fn occupant(&self) -> Option<Arc<Fiber>> {
        (*self.occupant.get()).upgrade()
    }

    pub(crate) unsafe fn set_occupant(&self, fiber: &Arc<Fiber>) {
        *self.occupant.get() = Arc::downgrade(fiber);
    }

    /// Whether `fiber` is the current occupant.
    pub(crate) unsafe fn occupant_is(&self, fiber: &Fiber) -> bool {
        std::ptr::eq((*self.occupant.get()).as_ptr(), fiber)
    }

    /// Clear occupancy if `fiber` holds the slot (terminate / reset paths).
    pub(crate) unsafe fn clear_occupant_if(&self, fiber: &Fiber) {
        if self.occupant_is(fiber) {
            *self.occupant.get() = Weak::new();
        }
    }
}

impl Drop for StackSlot {
    fn drop(&mut self) {
        StackAllocator::deallocate(self.buffer, self.size);
    }
}

/// Fixed ring of shared stack slots with round-robin allocation.
pub struct SharedStackPool {
    slots: Vec<Arc<StackSlot>>,
    counter: AtomicUsize,
    slot_size: usize,
}

impl SharedStackPool {
    /// Create a pool of `count` slots of `slot_size` bytes each.
    pub fn new(count: usize, slot_size: usize) -> SharedStackPool {
        assert!(count > 0, "shared stack pool needs at least one slot");
        assert!(slot_size > 0, "shared stack slots need a size");

        let slots = (0..count).map(|_| Arc::new(StackSlot::new(slot_size))).collect();
        log_debug!(
            "shared stack pool created: count={}, slot_size={}",
            count,
            slot_size
        );

        SharedStackPool {
            slots,
            counter: AtomicUsize::new(0),
            slot_size,
        }
    }

    /// Hand out the next slot round-robin. Never fails.
    pub fn allocate(&self) -> Arc<StackSlot> {
        let idx = self.counter.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        self.slots[idx].clone()
    }

    #[inline]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }
}

impl Default for SharedStackPool {
    fn default() -> Self {
        SharedStackPool::new(DEFAULT_SLOT_COUNT, DEFAULT_SLOT_SIZE)
    }
}
