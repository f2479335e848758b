//! Test-only context backend: one OS thread per fiber
//!
//! Where [`super::asm`] saves and restores a machine context on a single OS
//! thread, this backend sidesteps inline assembly entirely by giving every
//! fiber a real OS thread and using a condition variable to hand control
//! back and forth. Only one side is ever runnable at a time, so this keeps
//! the same "exactly one fiber running per OS thread at a time" property,
//! it just spends a whole thread stack to get it.
//!
//! This trades away the assumption the rest of the crate makes under the
//! assembly backend — that a fiber's body runs on the same OS thread as
//! whatever resumed it — so it is meant for exercising the `Fiber`
//! save/restore protocol itself (enabled via the `threaded-fiber` feature),
//! not for running the scheduler or reactor under full load.
use std::sync::{Arc, Condvar, Mutex};

struct Inner {
    runnable: Mutex<bool>,
    cond: Condvar,
}

impl Inner {
    fn new() -> Self {
        Inner {
            runnable: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn signal(&self) {
        let mut runnable = self.runnable.lock().unwrap();
        *runnable = true;
        self.cond.notify_one();
    }

    fn wait(&self) {
        let mut runnable = self.runnable.lock().unwrap();
        while !*runnable {
            runnable = self.cond.wait(runnable).unwrap();
        }
        *runnable = false;
    }
}

pub struct Context {
    inner: Arc<Inner>,
}

impl Context {
    pub fn new_root() -> Self {
        Context {
            inner: Arc::new(Inner::new()),
        }
    }

    /// Spawn a dedicated OS thread that blocks until first resumed, then
    /// runs `trampoline`.
    ///
    /// # Safety
    /// `stack_top` is unused under this backend (each fiber gets a real OS
    /// thread and stack); `trampoline` must still observe the same
    /// thread-local setup contract as the assembly backend.
    pub unsafe fn new_entry(_stack_top: *mut u8, trampoline: extern "C" fn() -> !) -> Self {
        let ctx = Context::new_root();
        let inner = Arc::clone(&ctx.inner);
        std::thread::Builder::new()
            .name("fiber-thread".into())
            .spawn(move || {
                inner.wait();
                trampoline();
            })
            .expect("failed to spawn fiber thread");
        ctx
    }

    /// Hand control to `into` and block until something hands it back to
    /// `current`.
    pub unsafe fn swap(current: &Context, into: &Context) {
        into.inner.signal();
        current.inner.wait();
    }

    /// Hand control to `into` without expecting to run again: used when
    /// `current`'s fiber has reached `TERM`. There is no register-level
    /// jump to not come back from under this backend, so the thread just
    /// parks itself forever instead of looping on a condition that will
    /// never fire again.
    pub unsafe fn finish(_current: &Context, into: &Context) -> ! {
        into.inner.signal();
        loop {
            std::thread::park();
        }
    }
}
