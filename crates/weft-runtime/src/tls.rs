//! Per-thread runtime context
//!
//! One lazily-created struct per OS thread holding the fiber switching
//! hierarchy (main / current / scheduler fiber), the owning scheduler, the
//! stack mode, the lazily-created shared-stack pool and switch stack, the
//! pending switch pair, and the hook-enable flag.
//!
//! The switching hierarchy is:
//!
//! ```text
//!   main fiber <---> scheduler fiber <---> user fibers
//! ```
//!
//! - main fiber: the thread's native execution context
//! - scheduler fiber: runs the task-dispatch loop on a worker
//! - user fibers: run scheduled work

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

use crate::context::Context;
use crate::fiber::Fiber;
use crate::scheduler::Scheduler;
use crate::shared_stack::SharedStackPool;
use crate::stack::StackAllocator;
use crate::switch::{self, PendingSwitch};

/// Size of the per-thread switch stack.
///
/// The switch stack only ever runs `switch_func`: a loop of stack memcpys
/// and one register swap per iteration.
pub const SWITCH_STACK_SIZE: usize = 64 * 1024;

/// Stack mode for fibers created on this thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackMode {
    /// Every fiber owns its stack exclusively
    Independent,
    /// Fibers bind to slots of the thread's shared-stack pool
    Shared,
}

struct SwitchStack {
    base: *mut u8,
    size: usize,
    // Boxed so the context address stays stable for raw-pointer swaps.
    ctx: Box<Context>,
}

impl Drop for SwitchStack {
    fn drop(&mut self) {
        StackAllocator::deallocate(self.base, self.size);
    }
}

/// The per-thread runtime context
pub struct ThreadContext {
    main_fiber: RefCell<Option<Arc<Fiber>>>,
    current_fiber: RefCell<Option<Arc<Fiber>>>,
    scheduler_fiber: RefCell<Option<Arc<Fiber>>>,
    scheduler: RefCell<Option<Scheduler>>,
    stack_mode: Cell<StackMode>,
    shared_pool: RefCell<Option<Rc<SharedStackPool>>>,
    switch_stack: RefCell<Option<SwitchStack>>,
    pending_switch: RefCell<Option<PendingSwitch>>,
    hook_enabled: Cell<bool>,
}

impl ThreadContext {
    fn new() -> ThreadContext {
        ThreadContext {
            main_fiber: RefCell::new(None),
            current_fiber: RefCell::new(None),
            scheduler_fiber: RefCell::new(None),
            scheduler: RefCell::new(None),
            stack_mode: Cell::new(StackMode::Independent),
            shared_pool: RefCell::new(None),
            switch_stack: RefCell::new(None),
            pending_switch: RefCell::new(None),
            hook_enabled: Cell::new(false),
        }
    }
}

thread_local! {
    static TLS_CTX: ThreadContext = ThreadContext::new();
}

/// Run `f` against this thread's context.
pub fn with<R>(f: impl FnOnce(&ThreadContext) -> R) -> R {
    TLS_CTX.with(f)
}

// -- fiber hierarchy ---------------------------------------------------------

pub fn main_fiber() -> Option<Arc<Fiber>> {
    with(|tc| tc.main_fiber.borrow().clone())
}

pub fn set_main_fiber(fiber: Option<Arc<Fiber>>) {
    with(|tc| *tc.main_fiber.borrow_mut() = fiber);
}

pub fn current_fiber() -> Option<Arc<Fiber>> {
    with(|tc| tc.current_fiber.borrow().clone())
}

pub fn set_current_fiber(fiber: Option<Arc<Fiber>>) {
    with(|tc| *tc.current_fiber.borrow_mut() = fiber);
}

pub fn scheduler_fiber() -> Option<Arc<Fiber>> {
    with(|tc| tc.scheduler_fiber.borrow().clone())
}

pub fn set_scheduler_fiber(fiber: Option<Arc<Fiber>>) {
    with(|tc| *tc.scheduler_fiber.borrow_mut() = fiber);
}

/// Whether a fiber is currently executing on this thread.
pub fn in_fiber() -> bool {
    with(|tc| tc.current_fiber.borrow().is_some())
}

// -- scheduler ---------------------------------------------------------------

pub fn scheduler() -> Option<Scheduler> {
    with(|tc| tc.scheduler.borrow().clone())
}

pub fn set_scheduler(scheduler: Option<Scheduler>) {
    with(|tc| *tc.scheduler.borrow_mut() = scheduler);
}

// -- stack mode and shared pool ----------------------------------------------

pub fn stack_mode() -> StackMode {
    with(|tc| tc.stack_mode.get())
}

pub fn set_stack_mode(mode: StackMode) {
    with(|tc| tc.stack_mode.set(mode));
}

/// This thread's shared-stack pool, created on first request.
pub fn shared_pool() -> Rc<SharedStackPool> {
    with(|tc| {
        let mut pool = tc.shared_pool.borrow_mut();
        pool.get_or_insert_with(|| Rc::new(SharedStackPool::default()))
            .clone()
    })
}

/// Replace this thread's shared-stack pool. Existing slot bindings keep
/// their slots alive independently of the pool.
pub fn set_shared_pool(pool: SharedStackPool) {
    with(|tc| *tc.shared_pool.borrow_mut() = Some(Rc::new(pool)));
}

// -- switch stack ------------------------------------------------------------

/// Pointer to this thread's permanent switch context, creating the switch
/// stack on first use. The pointer stays valid for the thread's lifetime.
pub(crate) fn switch_context_ptr() -> *mut Context {
    with(|tc| {
        let mut slot = tc.switch_stack.borrow_mut();
        let ss = slot.get_or_insert_with(|| {
            let base = StackAllocator::allocate(SWITCH_STACK_SIZE);
            let mut ctx = Box::new(Context::new());
            ctx.make(base, SWITCH_STACK_SIZE, switch::switch_func);
            SwitchStack {
                base,
                size: SWITCH_STACK_SIZE,
                ctx,
            }
        });
        &mut *ss.ctx as *mut Context
    })
}

pub(crate) fn set_pending_switch(pending: PendingSwitch) {
    with(|tc| {
        let prev = tc.pending_switch.borrow_mut().replace(pending);
        debug_assert!(prev.is_none(), "overlapping pending switches");
    });
}

pub(crate) fn take_pending_switch() -> Option<PendingSwitch> {
    with(|tc| tc.pending_switch.borrow_mut().take())
}

// -- hook flag ---------------------------------------------------------------

pub fn is_hook_enabled() -> bool {
    // Interposed symbols call this from arbitrary code, including during
    // thread teardown after the thread-local is gone; report "disabled"
    // instead of panicking there.
    TLS_CTX.try_with(|tc| tc.hook_enabled.get()).unwrap_or(false)
}

pub fn set_hook_enabled(enabled: bool) {
    with(|tc| tc.hook_enabled.set(enabled));
}
