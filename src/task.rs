//! Units of work a [`crate::scheduler::Scheduler`] can run
use std::sync::Arc;

use crate::fiber::Fiber;

/// Something a scheduler worker can execute: either a fiber handed to
/// `schedule()` directly, or a plain callback that gets wrapped in a fresh
/// (or reused) fiber by the worker that picks it up.
pub enum Task {
    Fiber(Arc<Fiber>),
    Callback(Box<dyn FnOnce() + Send>),
}

/// An entry in the scheduler's run queue: a task plus an optional pin to a
/// specific worker OS thread id. `None` means any idle worker may take it.
pub struct ScheduledTask {
    pub task: Task,
    pub thread: Option<libc::pid_t>,
}

impl ScheduledTask {
    pub fn new(task: Task, thread: Option<libc::pid_t>) -> Self {
        ScheduledTask { task, thread }
    }
}
