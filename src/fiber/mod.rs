//! Stackful fibers
//!
//! A [`Fiber`] is a unit of cooperative execution with its own stack: calling
//! [`Fiber::resume`] transfers the OS thread to it, and it runs until it
//! either returns (reaching [`FiberState::Term`]) or calls [`yield_now`] to
//! hand the thread back to whoever resumed it. Every OS thread has an
//! implicit root fiber representing its own native stack, created lazily the
//! first time fiber machinery touches that thread.
mod context;
mod stack;

use std::cell::{Cell, RefCell};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use context::Context;
use stack::Stack;

use crate::error::{Error, Result};

/// Default stack size for a fiber that doesn't request one explicitly.
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    /// Holds a stack and an unrun or suspended callback; resumable.
    Ready,
    /// Currently executing on some OS thread.
    Running,
    /// The callback has returned; the fiber can only be `reset`, never
    /// resumed again as-is.
    Term,
}

type Entry = Box<dyn FnOnce() + Send + 'static>;

pub struct Fiber {
    id: u64,
    state: Cell<FiberState>,
    context: RefCell<Context>,
    /// `None` for the implicit root fiber of a thread, which runs on that
    /// thread's own stack rather than one we allocated.
    stack: Option<Stack>,
    entry: RefCell<Option<Entry>>,
    /// The fiber that called `resume()` on this one, i.e. who `yield_now`
    /// and a terminating trampoline hand control back to.
    resumer: RefCell<Option<Arc<Fiber>>>,
    /// Whether this fiber is meant to run inside a scheduler's dispatch loop
    /// (affects nothing here directly; the scheduler consults it when
    /// deciding which fiber gets reused as its per-thread callback slot).
    pub(crate) runs_in_scheduler: bool,
}

// A `Fiber` is only ever live on one OS thread at a time: a scheduler moves
// ownership of an `Arc<Fiber>` into its task queue before another worker can
// pick it up, and the fiber machinery itself never resumes a fiber that's
// already `Running`. That single-owner discipline is what makes the
// `RefCell` fields above sound to share across threads.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);
static LIVE_COUNT: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static ROOT_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    static CURRENT_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
}

impl Fiber {
    /// Allocate a new `Ready` fiber with its own stack, running `cb` once
    /// resumed.
    pub fn new(
        cb: impl FnOnce() + Send + 'static,
        stack_size: usize,
        runs_in_scheduler: bool,
    ) -> io::Result<Arc<Fiber>> {
        let stack = Stack::new(stack_size)?;
        let context = unsafe { Context::new_entry(stack.top(), trampoline) };
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        LIVE_COUNT.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(Fiber {
            id,
            state: Cell::new(FiberState::Ready),
            context: RefCell::new(context),
            stack: Some(stack),
            entry: RefCell::new(Some(Box::new(cb))),
            resumer: RefCell::new(None),
            runs_in_scheduler,
        }))
    }

    fn root() -> Arc<Fiber> {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        LIVE_COUNT.fetch_add(1, Ordering::Relaxed);
        Arc::new(Fiber {
            id,
            state: Cell::new(FiberState::Running),
            context: RefCell::new(Context::new_root()),
            stack: None,
            entry: RefCell::new(None),
            resumer: RefCell::new(None),
            runs_in_scheduler: false,
        })
    }

    /// The calling thread's currently running fiber, creating that thread's
    /// root fiber on first use.
    pub fn current() -> Arc<Fiber> {
        if let Some(cur) = CURRENT_FIBER.with(|c| c.borrow().clone()) {
            return cur;
        }
        let root = ROOT_FIBER.with(|r| {
            let mut r = r.borrow_mut();
            r.get_or_insert_with(Fiber::root).clone()
        });
        CURRENT_FIBER.with(|c| *c.borrow_mut() = Some(Arc::clone(&root)));
        root
    }

    /// Whether the calling thread's current fiber is its own root fiber
    /// (i.e. nothing is resumed right now).
    pub fn is_root(&self) -> bool {
        self.stack.is_none()
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> FiberState {
        self.state.get()
    }

    /// Number of live `Fiber`s across the whole process, including root
    /// fibers. Diagnostic only.
    pub fn live_count() -> u64 {
        LIVE_COUNT.load(Ordering::Relaxed)
    }

    /// Transfer the OS thread to `self`, returning once `self` yields,
    /// terminates, or is resumed again later. Fails if `self` isn't
    /// currently `Ready`.
    pub fn resume(self: &Arc<Fiber>) -> Result<()> {
        if self.state.get() != FiberState::Ready {
            return Err(Error::FiberNotReady);
        }
        let prev = Fiber::current();
        *self.resumer.borrow_mut() = Some(Arc::clone(&prev));
        self.state.set(FiberState::Running);
        CURRENT_FIBER.with(|c| *c.borrow_mut() = Some(Arc::clone(self)));

        let prev_ctx: *const Context = &*prev.context.borrow();
        let self_ctx: *const Context = &*self.context.borrow();
        unsafe {
            Context::swap(&*prev_ctx, &*self_ctx);
        }
        Ok(())
    }

    /// Re-initialize a `Term` fiber to run `cb` from scratch, reusing its
    /// stack. Fails if the fiber isn't currently `Term`.
    pub fn reset(self: &Arc<Fiber>, cb: impl FnOnce() + Send + 'static) -> Result<()> {
        if self.state.get() != FiberState::Term {
            return Err(Error::FiberNotReady);
        }
        let stack = self
            .stack
            .as_ref()
            .expect("reset() called on a root fiber, which has no stack");
        let context = unsafe { Context::new_entry(stack.top(), trampoline) };
        *self.context.borrow_mut() = context;
        *self.entry.borrow_mut() = Some(Box::new(cb));
        self.state.set(FiberState::Ready);
        Ok(())
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        LIVE_COUNT.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Suspend the calling fiber and hand the OS thread back to whoever
/// resumed it.
///
/// # Panics
/// Panics if called from a thread's root fiber (nothing resumed it).
pub fn yield_now() {
    let current = Fiber::current();
    let target = current
        .resumer
        .borrow_mut()
        .take()
        .expect("yield_now() called outside a resumed fiber");
    if current.state.get() == FiberState::Running {
        current.state.set(FiberState::Ready);
    }
    CURRENT_FIBER.with(|c| *c.borrow_mut() = Some(Arc::clone(&target)));

    let current_ctx: *const Context = &*current.context.borrow();
    let target_ctx: *const Context = &*target.context.borrow();
    unsafe {
        Context::swap(&*current_ctx, &*target_ctx);
    }
}

extern "C" fn trampoline() -> ! {
    let current = Fiber::current();
    let cb = current
        .entry
        .borrow_mut()
        .take()
        .expect("trampoline entered a fiber with no callback");
    cb();
    current.state.set(FiberState::Term);
    let target = current
        .resumer
        .borrow_mut()
        .take()
        .expect("a terminating fiber has no resumer to return to");
    CURRENT_FIBER.with(|c| *c.borrow_mut() = Some(Arc::clone(&target)));

    let current_ctx: *const Context = &*current.context.borrow();
    let target_ctx: *const Context = &*target.context.borrow();
    unsafe { Context::finish(&*current_ctx, &*target_ctx) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc as StdRc, Mutex};

    #[test]
    fn resume_runs_body_once() {
        let ran = StdRc::new(Mutex::new(false));
        let ran2 = StdRc::clone(&ran);
        let fiber = Fiber::new(move || *ran2.lock().unwrap() = true, DEFAULT_STACK_SIZE, false).unwrap();
        fiber.resume().unwrap();
        assert!(*ran.lock().unwrap());
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn resume_on_non_ready_fiber_fails() {
        let fiber = Fiber::new(|| {}, DEFAULT_STACK_SIZE, false).unwrap();
        fiber.resume().unwrap();
        assert!(fiber.resume().is_err());
    }

    #[test]
    fn yield_and_resume_round_trips() {
        let log = StdRc::new(Mutex::new(Vec::new()));
        let log2 = StdRc::clone(&log);
        let fiber = Fiber::new(
            move || {
                log2.lock().unwrap().push(1);
                yield_now();
                log2.lock().unwrap().push(3);
            },
            DEFAULT_STACK_SIZE,
            false,
        )
        .unwrap();

        fiber.resume().unwrap();
        log.lock().unwrap().push(2);
        assert_eq!(fiber.state(), FiberState::Ready);
        fiber.resume().unwrap();
        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn reset_reruns_on_a_term_fiber() {
        let count = StdRc::new(Mutex::new(0));
        let count2 = StdRc::clone(&count);
        let fiber = Fiber::new(move || *count2.lock().unwrap() += 1, DEFAULT_STACK_SIZE, false).unwrap();
        fiber.resume().unwrap();
        assert_eq!(*count.lock().unwrap(), 1);

        let count3 = StdRc::clone(&count);
        fiber.reset(move || *count3.lock().unwrap() += 10).unwrap();
        assert_eq!(fiber.state(), FiberState::Ready);
        fiber.resume().unwrap();
        assert_eq!(*count.lock().unwrap(), 11);
    }

    #[test]
    fn reset_on_non_term_fiber_fails() {
        let fiber = Fiber::new(|| yield_now(), DEFAULT_STACK_SIZE, false).unwrap();
        fiber.resume().unwrap();
        assert_eq!(fiber.state(), FiberState::Ready);
        assert!(fiber.reset(|| {}).is_err());
    }
}
