//! Assembly-level context switch
//!
//! Saves/restores the callee-saved register set and the stack pointer;
//! everything else is the caller's responsibility under the System V /
//! AAPCS64 ABI, the same division of labor as `getcontext`/`swapcontext`.
//! The x86_64 save/restore sequence below is the standard shape used by
//! hand-rolled stackful coroutine switches in Rust; the aarch64 variant
//! follows the same layout over AAPCS64's callee-saved set.
use std::cell::UnsafeCell;

#[cfg(target_arch = "x86_64")]
#[repr(C)]
#[derive(Default, Clone, Copy)]
struct Registers {
    rsp: u64,
    r15: u64,
    r14: u64,
    r13: u64,
    r12: u64,
    rbx: u64,
    rbp: u64,
}

#[cfg(target_arch = "aarch64")]
#[repr(C)]
#[derive(Default, Clone, Copy)]
struct Registers {
    sp: u64,
    x19: u64,
    x20: u64,
    x21: u64,
    x22: u64,
    x23: u64,
    x24: u64,
    x25: u64,
    x26: u64,
    x27: u64,
    x28: u64,
    fp: u64,
    lr: u64,
}

/// A fiber's saved machine context: the callee-saved registers and stack
/// pointer, as of its last suspension.
pub struct Context {
    regs: UnsafeCell<Registers>,
}

// A `Context` is only ever touched by the one OS thread whose fiber it
// belongs to, serialized by the Fiber state machine (never running on two
// threads at once). It still needs to travel inside an `Rc` alongside the
// rest of `Fiber`, hence `Send`/`Sync` are asserted here rather than
// derived.
unsafe impl Send for Context {}
unsafe impl Sync for Context {}

impl Context {
    /// An empty context, used for the root fiber: its "stack" is whatever
    /// the OS thread was already running on, so there's nothing to set up
    /// until the first suspend fills in `regs`.
    pub fn new_root() -> Self {
        Context {
            regs: UnsafeCell::new(Registers::default()),
        }
    }

    /// Build a context that, when first swapped into, starts executing
    /// `trampoline` on `stack_top` (the highest address of a
    /// downward-growing stack).
    ///
    /// # Safety
    /// `stack_top` must point one-past-the-end of a valid, writable region
    /// of at least `16 * 8` bytes, and must remain valid for as long as
    /// this `Context` is swapped into.
    pub unsafe fn new_entry(stack_top: *mut u8, trampoline: extern "C" fn() -> !) -> Self {
        let sp = align_stack_top(stack_top);
        let regs = arch_prepare_entry(sp, trampoline);
        Context {
            regs: UnsafeCell::new(regs),
        }
    }

    /// Swap the running context from `current` to `into`: save the caller's
    /// registers into `current`, load `into`'s registers (including stack
    /// pointer), and resume there. Returns once some other context swaps
    /// back into `current`.
    ///
    /// # Safety
    /// Both contexts must belong to fibers that are not concurrently being
    /// resumed elsewhere, and `into` must have been produced by
    /// `new_root`/`new_entry` or a prior `swap`.
    pub unsafe fn swap(current: &Context, into: &Context) {
        arch_switch(current.regs.get(), into.regs.get());
    }

    /// Like [`swap`](Self::swap), but used when `current` has reached
    /// `TERM` and will never be resumed again. Identical under this
    /// backend — the swapped-out stack simply never gets swapped back
    /// into — kept as a separate name so the threaded backend (which
    /// really does end the underlying OS thread here) has a matching
    /// entry point.
    pub unsafe fn finish(current: &Context, into: &Context) -> ! {
        Self::swap(current, into);
        unreachable!("a TERM fiber's context was resumed")
    }
}

fn align_stack_top(top: *mut u8) -> *mut u8 {
    ((top as usize) & !0xf) as *mut u8
}

#[cfg(target_arch = "x86_64")]
unsafe fn arch_prepare_entry(stack_top: *mut u8, trampoline: extern "C" fn() -> !) -> Registers {
    // `stack_top` is already 16-byte aligned. The slot holding the entry
    // address must sit 16 bytes below it, not 8: `switch`'s `ret` pops that
    // slot and advances rsp by 8, so landing in `trampoline` with rsp at
    // `stack_top - 8` (16-aligned minus 8) reproduces the rsp a normal
    // `call` leaves its callee with.
    let sp = stack_top.sub(16) as *mut u64;
    std::ptr::write(sp, trampoline as usize as u64);
    Registers {
        rsp: sp as u64,
        ..Registers::default()
    }
}

#[cfg(target_arch = "aarch64")]
unsafe fn arch_prepare_entry(stack_top: *mut u8, trampoline: extern "C" fn() -> !) -> Registers {
    Registers {
        sp: stack_top as u64,
        lr: trampoline as usize as u64,
        ..Registers::default()
    }
}

#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
unsafe extern "C" fn arch_switch(_old: *mut Registers, _new: *const Registers) {
    // rdi = old, rsi = new. Matches the `Registers` field order above.
    std::arch::naked_asm!(
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], r15",
        "mov [rdi + 0x10], r14",
        "mov [rdi + 0x18], r13",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], rbx",
        "mov [rdi + 0x30], rbp",
        "mov rsp, [rsi + 0x00]",
        "mov r15, [rsi + 0x08]",
        "mov r14, [rsi + 0x10]",
        "mov r13, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov rbx, [rsi + 0x28]",
        "mov rbp, [rsi + 0x30]",
        "ret",
    );
}

#[cfg(target_arch = "aarch64")]
#[unsafe(naked)]
unsafe extern "C" fn arch_switch(_old: *mut Registers, _new: *const Registers) {
    // x0 = old, x1 = new.
    std::arch::naked_asm!(
        "mov x8, sp",
        "str x8, [x0, #0x00]",
        "stp x19, x20, [x0, #0x08]",
        "stp x21, x22, [x0, #0x18]",
        "stp x23, x24, [x0, #0x28]",
        "stp x25, x26, [x0, #0x38]",
        "stp x27, x28, [x0, #0x48]",
        "stp x29, x30, [x0, #0x58]",
        "ldr x8, [x1, #0x00]",
        "mov sp, x8",
        "ldp x19, x20, [x1, #0x08]",
        "ldp x21, x22, [x1, #0x18]",
        "ldp x23, x24, [x1, #0x28]",
        "ldp x25, x26, [x1, #0x38]",
        "ldp x27, x28, [x1, #0x48]",
        "ldp x29, x30, [x1, #0x58]",
        "ret",
    );
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!(
    "fiberflow's assembly fiber backend supports x86_64 and aarch64; build with \
     `--features threaded-fiber` on other targets"
);
