//! N-thread fiber scheduler
//!
//! A `Scheduler` owns a FIFO queue of [`crate::task::Task`]s and a pool of
//! worker OS threads, each running fibers pulled off that queue until told
//! to stop. A task may be pinned to a specific worker thread id, or left
//! free for whichever worker gets to it first.
//!
//! When built with `use_caller = true`, one of the `N` worker slots is the
//! constructing thread itself rather than a spawned OS thread. Unlike a real
//! worker thread, the caller can't just be handed a blocking call to `run()`
//! inside `start()` — `start()` has to return so the caller can go on to do
//! other things (per the documented `new` / `start` / ... / `stop` lifecycle)
//! before eventually calling `stop()` on that same thread. So the caller's
//! share of `run()` is wrapped in a dispatcher fiber, built once at
//! construction time, and only actually resumed from inside `stop()` — the
//! same `m_rootFiber` shape the scheduler this crate is modeled on uses.
//!
//! `Scheduler` is always handled behind an `Arc`; worker closures hold their
//! own strong clone so the scheduler outlives every task it's running.
//! The thread-local `CURRENT_SCHEDULER` a worker sets while inside `run()`
//! is a raw, non-owning pointer rather than another `Arc` — it exists only
//! so fiber-side code running inside that worker can find "the scheduler
//! I'm part of" without creating a reference cycle back through the fibers
//! the scheduler itself owns.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::error::{Error, Result};
use crate::fiber::{self, Fiber};
use crate::task::{ScheduledTask, Task};
use crate::thread::Thread;

struct Queue {
    tasks: VecDeque<ScheduledTask>,
}

/// Overrides for a worker's "nothing to do" and "wake a worker" behavior.
/// [`crate::io::IOManager`] plugs in an epoll-backed pair here instead of
/// the plain condvar wait/notify, so a worker blocked waiting for I/O
/// readiness still picks up newly scheduled tasks.
pub trait IdleHooks: Send + Sync {
    fn idle(&self, scheduler: &Scheduler);
    fn tickle(&self, scheduler: &Scheduler);
}

struct DefaultHooks;

impl IdleHooks for DefaultHooks {
    fn idle(&self, scheduler: &Scheduler) {
        let guard = scheduler.queue.lock().unwrap();
        let _ = scheduler
            .wakeup
            .wait_timeout(guard, std::time::Duration::from_millis(50))
            .unwrap();
    }

    fn tickle(&self, scheduler: &Scheduler) {
        scheduler.wakeup.notify_one();
    }
}

pub struct Scheduler {
    name: String,
    use_caller: bool,
    caller_thread_id: libc::pid_t,
    /// Worker OS threads `start()` spawns. Equal to the constructor's
    /// `threads` argument, minus one if `use_caller` claims a slot for the
    /// calling thread instead.
    thread_count: usize,
    queue: Mutex<Queue>,
    wakeup: Condvar,
    stopping: AtomicBool,
    active_threads: AtomicUsize,
    idle_threads: AtomicUsize,
    workers: Mutex<Vec<Thread>>,
    /// The caller thread's share of `run()`, wrapped as a fiber so `start()`
    /// can return immediately and `stop()` can drive it later. Only present
    /// when `use_caller` is set.
    dispatcher: Mutex<Option<Arc<Fiber>>>,
    hooks: Arc<dyn IdleHooks>,
}

thread_local! {
    /// Non-owning: the scheduler this worker thread belongs to, if any.
    /// A raw pointer rather than a `Weak`/`Arc` so a worker's thread-local
    /// state never keeps the `Scheduler` it serves alive.
    static CURRENT_SCHEDULER: std::cell::Cell<*const Scheduler> = const { std::cell::Cell::new(std::ptr::null()) };
}

impl Scheduler {
    /// Build a scheduler with `threads` total worker slots. If `use_caller`
    /// is set, the constructing thread consumes one of those slots (via a
    /// dispatcher fiber resumed from `stop()`) instead of a spawned OS
    /// thread, and only that thread may call `stop()`.
    pub fn new(threads: usize, use_caller: bool, name: impl Into<String>) -> Arc<Scheduler> {
        Self::with_hooks(threads, use_caller, name, Arc::new(DefaultHooks))
    }

    /// Like [`new`](Self::new), but with the idle/tickle behavior replaced
    /// by `hooks` — used to fuse a reactor's epoll wait into a worker's
    /// idle loop.
    pub fn with_hooks(
        threads: usize,
        use_caller: bool,
        name: impl Into<String>,
        hooks: Arc<dyn IdleHooks>,
    ) -> Arc<Scheduler> {
        let name = name.into();
        let caller_thread_id = current_tid();
        let thread_count = if use_caller { threads.saturating_sub(1) } else { threads };

        let scheduler = Arc::new(Scheduler {
            name,
            use_caller,
            caller_thread_id,
            thread_count,
            queue: Mutex::new(Queue { tasks: VecDeque::new() }),
            wakeup: Condvar::new(),
            stopping: AtomicBool::new(false),
            active_threads: AtomicUsize::new(0),
            idle_threads: AtomicUsize::new(0),
            workers: Mutex::new(Vec::with_capacity(thread_count)),
            dispatcher: Mutex::new(None),
            hooks,
        });

        if use_caller {
            let dispatcher_scheduler = Arc::clone(&scheduler);
            let fiber = Fiber::new(move || dispatcher_scheduler.run(), fiber::DEFAULT_STACK_SIZE, true)
                .expect("failed to allocate dispatcher fiber stack");
            *scheduler.dispatcher.lock().unwrap() = Some(fiber);
        }

        scheduler
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a task for execution. `pin` restricts it to the named worker
    /// thread id; `None` lets any idle worker take it.
    pub fn schedule(&self, task: Task, pin: Option<libc::pid_t>) {
        let mut queue = self.queue.lock().unwrap();
        queue.tasks.push_back(ScheduledTask::new(task, pin));
        drop(queue);
        // Must go through the hooks, not a direct condvar notify: a worker
        // idling inside `io::IOManager`'s epoll wait isn't listening on
        // `self.wakeup` at all, only on its self-pipe.
        self.tickle();
    }

    /// Spawn the worker pool and return immediately. If this scheduler was
    /// built with `use_caller`, the constructing thread's share of the work
    /// only actually runs once that same thread later calls `stop()`.
    pub fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock().unwrap();
        for i in 0..self.thread_count {
            let scheduler = Arc::clone(self);
            let thread_name = format!("{}-{}", scheduler.name, i);
            workers.push(Thread::new(thread_name, move || {
                scheduler.run();
            }));
        }
    }

    pub fn stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire) && self.queue.lock().unwrap().tasks.is_empty()
    }

    /// Signal every worker to exit once its queue is drained, drive the
    /// caller's own share of the work if `use_caller` was set, and join the
    /// spawned workers. If this scheduler was built with `use_caller`, this
    /// must be called from the same thread that called `start()`.
    pub fn stop(&self) -> Result<()> {
        if self.use_caller && current_tid() != self.caller_thread_id {
            return Err(Error::WrongStopper);
        }
        self.stopping.store(true, Ordering::Release);

        let mut workers = self.workers.lock().unwrap();
        // One tickle per worker: a single wakeup only guarantees one idling
        // thread notices (a condvar `notify_one`, or one self-pipe byte
        // under `io::IOManager`'s epoll wait), so every worker that might
        // be parked needs its own nudge to see `stopping` promptly.
        for _ in 0..workers.len() + 1 {
            self.tickle();
        }

        if let Some(dispatcher) = self.dispatcher.lock().unwrap().clone() {
            // First (and only) resume: the dispatcher fiber runs `run()` to
            // completion on this thread and returns control here once the
            // queue is drained and `stopping` is set.
            let _ = dispatcher.resume();
        }

        for worker in workers.drain(..) {
            worker.join();
        }
        Ok(())
    }

    /// Wake one idle worker, via whichever [`IdleHooks`] this scheduler was
    /// built with.
    pub fn tickle(&self) {
        self.hooks.tickle(self);
    }

    /// Called by a worker when it finds no runnable task, via whichever
    /// [`IdleHooks`] this scheduler was built with.
    pub fn idle(&self) {
        self.hooks.idle(self);
    }

    pub(crate) fn notify_all(&self) {
        self.wakeup.notify_all();
    }

    pub(crate) fn notify_one(&self) {
        self.wakeup.notify_one();
    }

    pub fn active_thread_count(&self) -> usize {
        self.active_threads.load(Ordering::Relaxed)
    }

    pub fn idle_thread_count(&self) -> usize {
        self.idle_threads.load(Ordering::Relaxed)
    }

    fn run(self: &Arc<Self>) {
        CURRENT_SCHEDULER.with(|c| c.set(Arc::as_ptr(self)));
        self.active_threads.fetch_add(1, Ordering::Relaxed);
        let my_tid = current_tid();

        // Reusable slot for bare `Callback` tasks: wrapping each one in a
        // fresh fiber would work but churns allocations, so a worker keeps
        // one callback fiber around and `reset`s it for each callback task
        // it picks up.
        let mut callback_fiber: Option<Arc<Fiber>> = None;

        loop {
            let picked = {
                let mut queue = self.queue.lock().unwrap();
                let mut found_at = None;
                for (idx, entry) in queue.tasks.iter().enumerate() {
                    if let Some(pin) = entry.thread {
                        if pin != my_tid {
                            continue;
                        }
                    }
                    if let Task::Fiber(f) = &entry.task {
                        if f.state() == fiber::FiberState::Running {
                            // Already running on whichever thread picked it
                            // up previously; leave it for that thread's next
                            // reschedule rather than trying to steal it.
                            continue;
                        }
                    }
                    found_at = Some(idx);
                    break;
                }
                found_at.map(|idx| queue.tasks.remove(idx).unwrap())
            };

            let scheduled = match picked {
                Some(t) => t,
                None => {
                    if self.stopping.load(Ordering::Acquire) && self.queue.lock().unwrap().tasks.is_empty() {
                        break;
                    }
                    self.idle_threads.fetch_add(1, Ordering::Relaxed);
                    self.idle();
                    self.idle_threads.fetch_sub(1, Ordering::Relaxed);
                    continue;
                }
            };

            match scheduled.task {
                Task::Fiber(f) => match f.resume() {
                    Ok(()) => {
                        if f.state() != fiber::FiberState::Term {
                            // Cooperatively yielded rather than finishing:
                            // put it back on the queue for a future turn.
                            self.schedule(Task::Fiber(f), scheduled.thread);
                        }
                    }
                    Err(_) => {
                        // Not actually `Ready` (e.g. resumed concurrently by
                        // another thread via a race this scan should already
                        // prevent). Drop it rather than spin on it.
                    }
                },
                Task::Callback(cb) => {
                    let fiber = match callback_fiber.take() {
                        Some(f) if f.state() == fiber::FiberState::Term => {
                            let _ = f.reset(cb);
                            f
                        }
                        _ => Fiber::new(cb, fiber::DEFAULT_STACK_SIZE, true)
                            .expect("failed to allocate callback fiber stack"),
                    };
                    let _ = fiber.resume();
                    callback_fiber = Some(fiber);
                }
            }

            if self.stopping.load(Ordering::Acquire) && self.queue.lock().unwrap().tasks.is_empty() {
                break;
            }
        }

        self.active_threads.fetch_sub(1, Ordering::Relaxed);
        CURRENT_SCHEDULER.with(|c| c.set(std::ptr::null()));
    }
}

#[cfg(target_os = "linux")]
fn current_tid() -> libc::pid_t {
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

#[cfg(not(target_os = "linux"))]
fn current_tid() -> libc::pid_t {
    std::process::id() as libc::pid_t
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn runs_scheduled_callbacks() {
        let scheduler = Scheduler::new(2, false, "test-sched");
        let results = Arc::new(StdMutex::new(Vec::new()));

        for i in 0..5 {
            let results = Arc::clone(&results);
            scheduler.schedule(
                Task::Callback(Box::new(move || {
                    results.lock().unwrap().push(i);
                })),
                None,
            );
        }
        scheduler.start();
        scheduler.stop().unwrap();

        let mut got = results.lock().unwrap().clone();
        got.sort_unstable();
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn stop_from_wrong_thread_with_use_caller_fails() {
        let scheduler = Scheduler::new(1, true, "pinned-sched");
        scheduler.start();
        let worker = {
            let scheduler = Arc::clone(&scheduler);
            std::thread::spawn(move || scheduler.stop())
        };
        let result = worker.join().unwrap();
        assert!(result.is_err());
        // The real stop, from the owning thread, must still succeed and
        // actually drive the dispatcher fiber to completion.
        scheduler.stop().unwrap();
    }

    #[test]
    fn use_caller_runs_dispatcher_fiber_on_stop() {
        let scheduler = Scheduler::new(1, true, "solo-caller");
        let results = Arc::new(StdMutex::new(Vec::new()));

        for i in 0..3 {
            let results = Arc::clone(&results);
            scheduler.schedule(
                Task::Callback(Box::new(move || {
                    results.lock().unwrap().push(i);
                })),
                None,
            );
        }

        // With a single total slot and use_caller, there are zero spawned
        // worker threads: start() should return immediately, and every
        // callback only actually runs once stop() resumes the dispatcher.
        scheduler.start();
        assert!(results.lock().unwrap().is_empty());

        scheduler.stop().unwrap();

        let mut got = results.lock().unwrap().clone();
        got.sort_unstable();
        assert_eq!(got, vec![0, 1, 2]);
    }
}
