//! x86_64 context switching
//!
//! Inline naked assembly, stable since Rust 1.88.
//!
//! Only the System V callee-saved set plus the stack pointer and a resume
//! address are kept; a fiber only ever switches out at a call boundary, so
//! caller-saved registers are dead by the ABI contract.

use std::arch::naked_asm;

/// Callee-saved register block for a voluntary switch.
///
/// Field order is fixed: the assembly addresses this block by byte offset.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SavedRegs {
    pub rsp: u64, // 0x00
    pub rip: u64, // 0x08 - resume address
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20 - entry function in a fresh context
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
}

impl SavedRegs {
    pub const fn zeroed() -> SavedRegs {
        SavedRegs {
            rsp: 0,
            rip: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }

    /// Saved stack pointer
    #[inline]
    pub fn sp(&self) -> u64 {
        self.rsp
    }
}

/// Initialize a fresh context.
///
/// The first switch into `regs` enters the trampoline, which calls the
/// zero-argument `entry` on the given stack.
///
/// # Safety
///
/// `regs` must point to valid `SavedRegs` memory and `stack_top` must be the
/// high end of a mapped stack region.
pub unsafe fn init_context(regs: *mut SavedRegs, stack_top: *mut u8, entry: usize) {
    // The trampoline is entered by `jmp` with a 16-byte-aligned stack; its
    // `call` then leaves the ABI-required entry alignment (rsp % 16 == 8)
    // inside the entry function.
    let aligned_sp = (stack_top as usize) & !0xF;

    let regs = &mut *regs;
    regs.rsp = aligned_sp as u64;
    regs.rip = entry_trampoline as usize as u64;
    regs.rbx = 0;
    regs.rbp = 0;
    regs.r12 = entry as u64;
    regs.r13 = 0;
    regs.r14 = 0;
    regs.r15 = 0;
}

/// Trampoline that calls the entry function.
///
/// The entry must not return; if it does (a fiber body fell off the end of
/// its runtime without a switch target), the abort shim terminates the
/// process instead of executing garbage.
#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!(
        "call r12",
        "call {aborted}",
        "ud2",
        aborted = sym entry_returned,
    );
}

/// Perform a voluntary context switch.
///
/// Saves the callee-saved registers into `old_regs` and resumes from
/// `new_regs`. Returns only when another party switches back into
/// `old_regs`. Takes no locks and allocates nothing.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_old_regs: *mut SavedRegs, _new_regs: *const SavedRegs) {
    naked_asm!(
        // Save callee-saved registers to old_regs (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load callee-saved registers from new_regs (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        // Jump to the new resume address
        "jmp rax",
        // Resume point for the saved context
        "1:",
        "ret",
    );
}

/// Called if a context's entry function returns.
extern "C" fn entry_returned() -> ! {
    weft_core::log_error!("fiber entry returned without a switch target; aborting");
    std::process::abort();
}
