//! Shared-stack-safe context switching
//!
//! The hard case: once a register swap loads the target's stack pointer,
//! the next bytes read from that stack must already be the target's. Stack
//! save/restore therefore cannot run on a stack that is itself about to be
//! overwritten.
//!
//! The solution is a per-thread switch stack: a small dedicated region with
//! a permanent context running `switch_func` in a loop. When a switch
//! involves a shared-stack fiber, `co_swap` parks the (from, to) pair in
//! the thread context and swaps into the switch context. `switch_func` then
//! performs every memcpy off both fibers' stacks:
//!
//! 1. save the outgoing fiber's live window `[sp, slot.top)` if it occupies
//!    a shared slot,
//! 2. save a displaced occupant of the target's slot,
//! 3. mark the target as occupant and copy its saved bytes back,
//! 4. swap into the target.
//!
//! When control later re-enters the switch context, the loop picks up the
//! next pending pair.

use std::sync::Arc;

use crate::context::Context;
use crate::fiber::Fiber;
use crate::tls;

/// A switch routed through the switch stack.
///
/// `from` is `None` on the terminal switch out of a finished fiber: the
/// entry trampoline drops its strong reference before leaving the stack
/// frame forever, and a terminated fiber never needs its window saved.
pub(crate) struct PendingSwitch {
    pub(crate) from: Option<Arc<Fiber>>,
    pub(crate) to: Arc<Fiber>,
}

/// Switch from `curr` to `target`, preserving shared-stack windows.
pub(crate) fn co_swap(curr: &Arc<Fiber>, target: &Arc<Fiber>) {
    co_swap_inner(Some(curr.clone()), curr.context_ptr(), target.clone());
}

/// Terminal switch out of `curr`: the caller has already dropped every
/// strong reference it held on its own stack. `curr` stays alive through
/// the runtime's other handles (queue, resumer, thread context).
pub(crate) fn co_swap_terminal(curr_ctx: *mut Context, target: Arc<Fiber>) {
    co_swap_inner(None, curr_ctx, target);
}

fn co_swap_inner(from: Option<Arc<Fiber>>, from_ctx: *mut Context, to: Arc<Fiber>) {
    let via_switch_stack = from
        .as_ref()
        .map(|f| f.uses_shared_stack())
        .unwrap_or(false)
        || to.uses_shared_stack();

    if !via_switch_stack {
        let to_ctx = to.context_ptr();
        tls::set_current_fiber(Some(to));
        // The outgoing fiber stays alive through external handles; only raw
        // context pointers cross the switch.
        drop(from);
        unsafe { Context::swap(from_ctx, to_ctx) };
        return;
    }

    let switch_ctx = tls::switch_context_ptr();
    tls::set_pending_switch(PendingSwitch { from, to });
    unsafe { Context::swap(from_ctx, switch_ctx) };
}

/// Body of the permanent switch context. Runs forever on the switch stack;
/// each loop iteration completes one shared-stack switch.
pub(crate) extern "C" fn switch_func() {
    loop {
        let PendingSwitch { from, to } =
            tls::take_pending_switch().expect("switch stack entered without a pending switch");

        unsafe {
            // Save the outgoing fiber's live window. Its stack pointer was
            // captured by the swap that brought us here.
            if let Some(from) = &from {
                if let Some(slot) = from.shared_slot() {
                    if slot.occupant_is(from) {
                        from.save_live_stack();
                    }
                }
            }

            if let Some(slot) = to.shared_slot() {
                // Evict whoever holds the target's slot, unless it is the
                // target itself (bytes already in place) or the outgoing
                // fiber (just saved above).
                if let Some(occupant) = slot.occupant() {
                    let already_saved = from
                        .as_ref()
                        .map(|f| Arc::ptr_eq(&occupant, f))
                        .unwrap_or(false);
                    if !Arc::ptr_eq(&occupant, &to) && !already_saved {
                        occupant.save_live_stack();
                    }
                }
                slot.set_occupant(&to);
                to.restore_live_stack();
            }

            let to_ctx = to.context_ptr();
            let switch_ctx = tls::switch_context_ptr();
            tls::set_current_fiber(Some(to));
            drop(from);
            Context::swap(switch_ctx, to_ctx);
        }
    }
}
