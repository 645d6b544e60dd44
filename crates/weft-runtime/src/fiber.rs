//! Fiber lifecycle
//!
//! A fiber owns a machine context plus either an exclusive stack region or
//! a binding to a shared-stack slot with a private save buffer. The body is
//! a boxed closure; a panic raised inside it is caught at the entry
//! trampoline, recorded, and re-raised into whoever resumes the fiber.

use std::any::Any;
use std::cell::UnsafeCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use weft_core::{log_debug, log_error, log_warn, FiberId, FiberState};

use crate::context::Context;
use crate::shared_stack::StackSlot;
use crate::stack::StackAllocator;
use crate::switch;
use crate::tls;

/// A fiber body
pub type FiberFn = Box<dyn FnOnce() + Send + 'static>;

enum FiberStack {
    /// The thread's native stack; nothing owned
    Main,
    /// Exclusively owned region
    Owned { base: *mut u8, size: usize },
    /// Shared slot binding plus the private save buffer holding
    /// `[sp, slot.top)` while another fiber occupies the slot
    Shared {
        slot: Arc<StackSlot>,
        save: UnsafeCell<Vec<u8>>,
    },
}

/// A stackful coroutine.
///
/// # Safety invariants
///
/// `Fiber` is `Send + Sync` under the runtime's usage contract: a fiber is
/// never Running on two threads at once, and its interior (context,
/// callback, save buffer) is only touched by the thread currently executing
/// or switching it. Shared-stack fibers additionally resume only on threads
/// sharing the pool their slot came from.
pub struct Fiber {
    id: FiberId,
    name: String,
    state: AtomicU8,
    ctx: UnsafeCell<Context>,
    stack: FiberStack,
    callback: UnsafeCell<Option<FiberFn>>,
    panic_payload: UnsafeCell<Option<Box<dyn Any + Send>>>,
    self_ref: Weak<Fiber>,
}

unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a fiber with its own stack of `stack_size` bytes.
    ///
    /// An empty `name` yields `fiber_<id>`; otherwise `<name>_<id>`.
    pub fn new(f: FiberFn, stack_size: usize, name: &str) -> Arc<Fiber> {
        let id = FiberId::next();
        let base = StackAllocator::allocate(stack_size);

        let fiber = Arc::new_cyclic(|weak| {
            let mut ctx = Context::new();
            ctx.make(base, stack_size, fiber_entry);
            Fiber {
                id,
                name: compose_name(name, id),
                state: AtomicU8::new(FiberState::Ready as u8),
                ctx: UnsafeCell::new(ctx),
                stack: FiberStack::Owned {
                    base,
                    size: stack_size,
                },
                callback: UnsafeCell::new(Some(f)),
                panic_payload: UnsafeCell::new(None),
                self_ref: weak.clone(),
            }
        });

        log_debug!(
            "fiber created: name={}, id={}, stack_size={}",
            fiber.name,
            id,
            stack_size
        );
        fiber
    }

    /// Create a fiber bound to a slot of this thread's shared-stack pool
    /// (the pool is created on first use).
    pub fn with_shared_stack(f: FiberFn, name: &str) -> Arc<Fiber> {
        let id = FiberId::next();
        let slot = tls::shared_pool().allocate();

        let fiber = Arc::new_cyclic(|weak| {
            let mut ctx = Context::new();
            ctx.make(slot.base(), slot.size(), fiber_entry);
            Fiber {
                id,
                name: compose_name(name, id),
                state: AtomicU8::new(FiberState::Ready as u8),
                ctx: UnsafeCell::new(ctx),
                stack: FiberStack::Shared {
                    slot,
                    save: UnsafeCell::new(Vec::new()),
                },
                callback: UnsafeCell::new(Some(f)),
                panic_payload: UnsafeCell::new(None),
                self_ref: weak.clone(),
            }
        });

        log_debug!("fiber created on shared stack: name={}, id={}", fiber.name, id);
        fiber
    }

    /// The per-thread main fiber: captures the native thread context
    /// instead of allocating a stack. Starts Running.
    pub(crate) fn new_main() -> Arc<Fiber> {
        Arc::new_cyclic(|weak| Fiber {
            id: FiberId::main(),
            name: "main_fiber".to_string(),
            state: AtomicU8::new(FiberState::Running as u8),
            // Filled by the first switch away from this thread.
            ctx: UnsafeCell::new(Context::new()),
            stack: FiberStack::Main,
            callback: UnsafeCell::new(None),
            panic_payload: UnsafeCell::new(None),
            self_ref: weak.clone(),
        })
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[inline]
    pub fn uses_shared_stack(&self) -> bool {
        matches!(self.stack, FiberStack::Shared { .. })
    }

    pub(crate) fn shared_slot(&self) -> Option<&Arc<StackSlot>> {
        match &self.stack {
            FiberStack::Shared { slot, .. } => Some(slot),
            _ => None,
        }
    }

    #[inline]
    pub(crate) fn context_ptr(&self) -> *mut Context {
        self.ctx.get()
    }

    fn arc(&self) -> Arc<Fiber> {
        self.self_ref.upgrade().expect("fiber used after release")
    }

    /// Resume this fiber from the caller's context.
    ///
    /// Legal only in Ready or Suspended. If the fiber terminates with a
    /// captured panic, the payload is re-raised here in the resumer.
    pub fn resume(&self) {
        let this = self.arc();
        let state = self.state();
        assert!(
            state.is_resumable(),
            "cannot resume fiber {} in state {}",
            self.id,
            state
        );

        let prev = match tls::current_fiber() {
            Some(f) => f,
            None => {
                // Detached use without a scheduler: materialize the
                // thread's main fiber on demand.
                let main = Fiber::new_main();
                tls::set_main_fiber(Some(main.clone()));
                tls::set_current_fiber(Some(main.clone()));
                main
            }
        };
        assert!(
            !Arc::ptr_eq(&prev, &this),
            "fiber {} cannot resume itself",
            self.id
        );

        self.set_state(FiberState::Running);
        log_debug!("fiber resume: name={}, id={}, prev_state={}", self.name, self.id, state);

        switch::co_swap(&prev, &this);

        // Back in the resumer.
        tls::set_current_fiber(Some(prev));
        if self.state().is_terminated() {
            if let Some(payload) = unsafe { (*self.panic_payload.get()).take() } {
                panic::resume_unwind(payload);
            }
        }
    }

    /// Re-arm a terminated fiber with a new body.
    ///
    /// The id is unchanged; the state becomes Ready. Used by the fiber pool
    /// to recycle stacks.
    pub fn reset(&self, f: FiberFn) {
        assert_eq!(
            self.state(),
            FiberState::Terminated,
            "can only reset a terminated fiber (id={})",
            self.id
        );

        unsafe {
            *self.callback.get() = Some(f);
            *self.panic_payload.get() = None;

            let ctx = &mut *self.ctx.get();
            match &self.stack {
                FiberStack::Owned { base, size } => ctx.make(*base, *size, fiber_entry),
                FiberStack::Shared { slot, save } => {
                    (*save.get()).clear();
                    slot.clear_occupant_if(self);
                    ctx.make(slot.base(), slot.size(), fiber_entry);
                }
                FiberStack::Main => unreachable!("main fiber cannot be reset"),
            }
        }

        self.set_state(FiberState::Ready);
        log_debug!("fiber reset: name={}, id={}", self.name, self.id);
    }

    /// Copy the live window `[sp, slot.top)` into the save buffer.
    /// Runs only on the switch stack.
    pub(crate) unsafe fn save_live_stack(&self) {
        let FiberStack::Shared { slot, save } = &self.stack else {
            return;
        };
        let sp = (*self.ctx.get()).sp();
        let base = slot.base() as usize;
        let top = slot.top() as usize;
        debug_assert!(
            sp >= base && sp <= top,
            "fiber {} stack pointer outside its slot",
            self.id
        );

        let len = top - sp;
        let buf = &mut *save.get();
        buf.clear();
        buf.reserve(len);
        std::ptr::copy_nonoverlapping(sp as *const u8, buf.as_mut_ptr(), len);
        buf.set_len(len);
    }

    /// Copy the save buffer back to the top of the slot and release it.
    /// Runs only on the switch stack.
    pub(crate) unsafe fn restore_live_stack(&self) {
        let FiberStack::Shared { slot, save } = &self.stack else {
            return;
        };
        let buf = &mut *save.get();
        if buf.is_empty() {
            return;
        }
        let dst = slot.top().sub(buf.len());
        std::ptr::copy_nonoverlapping(buf.as_ptr(), dst, buf.len());
        buf.clear();
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        if let FiberStack::Owned { base, size } = self.stack {
            StackAllocator::deallocate(base, size);
        }
    }
}

fn compose_name(name: &str, id: FiberId) -> String {
    if name.is_empty() {
        format!("fiber_{}", id)
    } else {
        format!("{}_{}", name, id)
    }
}

/// Suspend the current fiber and hand control back to the scheduler fiber,
/// or to the thread's main fiber when no scheduler is active.
pub fn yield_now() {
    let Some(cur) = tls::current_fiber() else {
        log_warn!("yield_now: no current fiber on this thread");
        return;
    };

    assert_eq!(
        cur.state(),
        FiberState::Running,
        "can only yield a running fiber (id={})",
        cur.id()
    );

    cur.set_state(FiberState::Suspended);
    log_debug!("fiber yield: name={}, id={}", cur.name(), cur.id());
    confirm_switch_target(&cur);
}

/// Pick the switch-back target: the scheduler fiber when one exists and is
/// not the current fiber, else the main fiber.
fn switch_target(cur: &Arc<Fiber>) -> Option<Arc<Fiber>> {
    match tls::scheduler_fiber() {
        Some(s) if !Arc::ptr_eq(&s, cur) => Some(s),
        _ => tls::main_fiber(),
    }
}

fn confirm_switch_target(cur: &Arc<Fiber>) {
    match switch_target(cur) {
        Some(target) => switch::co_swap(cur, &target),
        None => log_error!("fiber {}: no switch target available", cur.id()),
    }
}

/// Entry point for every non-main fiber context.
///
/// Runs the body under a catch-all, records a panic payload, marks the
/// fiber Terminated, releases shared-slot occupancy and switches away for
/// good. If no switch target exists this returns into the arch trampoline,
/// which aborts the process.
extern "C" fn fiber_entry() {
    let cur = tls::current_fiber().expect("fiber entry without a current fiber");

    match unsafe { (*cur.callback.get()).take() } {
        Some(f) => {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
                log_error!("fiber terminated by panic: name={}, id={}", cur.name(), cur.id());
                unsafe { *cur.panic_payload.get() = Some(payload) };
            }
        }
        None => log_error!("fiber {} entered without a body", cur.id()),
    }

    cur.set_state(FiberState::Terminated);
    if let Some(slot) = cur.shared_slot() {
        // The slot no longer holds live bytes worth saving.
        unsafe { slot.clear_occupant_if(&cur) };
    }

    let target = switch_target(&cur);
    let cur_ctx = cur.context_ptr();
    // Drop our strong reference before leaving this stack frame forever;
    // the runtime's other handles keep the fiber alive.
    drop(cur);
    match target {
        Some(t) => switch::co_swap_terminal(cur_ctx, t),
        None => log_error!("terminated fiber has no switch target"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared_stack::SharedStackPool;
    use crate::stack::DEFAULT_STACK_SIZE;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering::SeqCst};

    #[test]
    fn test_resume_yield_roundtrip() {
        let steps = Arc::new(AtomicUsize::new(0));
        let s = steps.clone();
        let fiber = Fiber::new(
            Box::new(move || {
                s.store(1, SeqCst);
                yield_now();
                s.store(2, SeqCst);
            }),
            DEFAULT_STACK_SIZE,
            "roundtrip",
        );

        assert_eq!(fiber.state(), FiberState::Ready);
        fiber.resume();
        assert_eq!(steps.load(SeqCst), 1);
        assert_eq!(fiber.state(), FiberState::Suspended);
        fiber.resume();
        assert_eq!(steps.load(SeqCst), 2);
        assert_eq!(fiber.state(), FiberState::Terminated);
    }

    #[test]
    fn test_implicit_main_fiber() {
        std::thread::spawn(|| {
            assert!(tls::main_fiber().is_none());
            let fiber = Fiber::new(Box::new(|| {}), DEFAULT_STACK_SIZE, "");
            fiber.resume();
            let main = tls::main_fiber().expect("implicit main fiber");
            assert_eq!(main.id(), FiberId::main());
            assert_eq!(main.state(), FiberState::Running);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_panic_is_captured_and_reraised() {
        let fiber = Fiber::new(
            Box::new(|| panic!("fiber body failed")),
            DEFAULT_STACK_SIZE,
            "panicky",
        );
        let result = panic::catch_unwind(AssertUnwindSafe(|| fiber.resume()));
        assert!(result.is_err());
        assert_eq!(fiber.state(), FiberState::Terminated);
    }

    #[test]
    fn test_reset_keeps_id_and_reuses_stack() {
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        let fiber = Fiber::new(
            Box::new(move || {
                c.fetch_add(1, SeqCst);
            }),
            DEFAULT_STACK_SIZE,
            "pooled",
        );
        let id = fiber.id();
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Terminated);

        let c = count.clone();
        fiber.reset(Box::new(move || {
            c.fetch_add(10, SeqCst);
        }));
        assert_eq!(fiber.state(), FiberState::Ready);
        assert_eq!(fiber.id(), id);

        fiber.resume();
        assert_eq!(count.load(SeqCst), 11);
        assert_eq!(fiber.state(), FiberState::Terminated);
    }

    #[test]
    fn test_yield_without_fiber_is_harmless() {
        std::thread::spawn(|| {
            yield_now();
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_fiber_names() {
        let named = Fiber::new(Box::new(|| {}), DEFAULT_STACK_SIZE, "echo");
        assert!(named.name().starts_with("echo_"));
        let anon = Fiber::new(Box::new(|| {}), DEFAULT_STACK_SIZE, "");
        assert!(anon.name().starts_with("fiber_"));
    }

    // Two fibers alternate on a single shared slot; each must see its own
    // locals after every resume.
    #[test]
    fn test_shared_stack_alternation() {
        std::thread::spawn(|| {
            tls::set_shared_pool(SharedStackPool::new(1, 64 * 1024));

            fn body(tag: u64, ok: Arc<AtomicBool>) -> FiberFn {
                Box::new(move || {
                    let mut window = [0u64; 32];
                    for (i, w) in window.iter_mut().enumerate() {
                        *w = tag + i as u64;
                    }
                    std::hint::black_box(window.as_ptr());
                    yield_now();
                    std::hint::black_box(window.as_ptr());
                    let intact = window
                        .iter()
                        .enumerate()
                        .all(|(i, w)| *w == tag + i as u64);
                    ok.store(intact, SeqCst);
                })
            }

            let ok_a = Arc::new(AtomicBool::new(false));
            let ok_b = Arc::new(AtomicBool::new(false));
            let a = Fiber::with_shared_stack(body(0x1111, ok_a.clone()), "a");
            let b = Fiber::with_shared_stack(body(0x2222_0000, ok_b.clone()), "b");
            assert!(a.uses_shared_stack() && b.uses_shared_stack());

            a.resume();
            b.resume();
            a.resume();
            b.resume();

            assert_eq!(a.state(), FiberState::Terminated);
            assert_eq!(b.state(), FiberState::Terminated);
            assert!(ok_a.load(SeqCst), "fiber a saw clobbered stack bytes");
            assert!(ok_b.load(SeqCst), "fiber b saw clobbered stack bytes");
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_shared_stack_fiber_reset() {
        std::thread::spawn(|| {
            tls::set_shared_pool(SharedStackPool::new(2, 64 * 1024));
            let hits = Arc::new(AtomicUsize::new(0));

            let h = hits.clone();
            let fiber = Fiber::with_shared_stack(
                Box::new(move || {
                    h.fetch_add(1, SeqCst);
                }),
                "reuse",
            );
            fiber.resume();

            let h = hits.clone();
            fiber.reset(Box::new(move || {
                h.fetch_add(1, SeqCst);
            }));
            fiber.resume();
            assert_eq!(hits.load(SeqCst), 2);
        })
        .join()
        .unwrap();
    }
}
