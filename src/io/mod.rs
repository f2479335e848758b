//! Edge-triggered epoll reactor, fused with the fiber scheduler and timer
//! wheel
//!
//! [`IOManager`] is a [`crate::scheduler::Scheduler`] whose idle loop is an
//! `epoll_wait` call instead of a plain condvar wait: a worker with nothing
//! else to do blocks there, and wakes either because a registered fd became
//! ready, a timer's deadline passed, or someone called `tickle()` (which
//! writes a byte down a self-pipe registered with the same epoll instance —
//! the standard way to interrupt a blocking `epoll_wait` from another
//! thread).
//!
//! Locking follows a fixed order to avoid deadlock between a fd's own state
//! and the run queue a trigger eventually schedules onto: the fd table's
//! `RwLock`, then a single `FdContext`'s mutex, then the scheduler's queue
//! lock. `trigger` always drops the `FdContext` lock before calling
//! `schedule`, so it never holds two of these at once.
mod epoll;

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::clock;
use crate::error::{Error, Result};
use crate::scheduler::{IdleHooks, Scheduler};
use crate::task::Task;
use crate::timer::{TimerHooks, TimerManager};

use epoll::Epoll;

bitflags! {
    /// Readiness interest registered for a fd: `READ`, `WRITE`, or both.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
    pub struct Event: u32 {
        const READ = 0b01;
        const WRITE = 0b10;
    }
}

/// Default capacity the fd table grows to on first use; it grows again
/// (doubling) whenever a registered fd falls outside its current range.
pub const DEFAULT_FD_CAPACITY: usize = 32;

struct EventSlot {
    task: Option<Task>,
    thread: Option<libc::pid_t>,
}

impl EventSlot {
    fn empty() -> Self {
        EventSlot { task: None, thread: None }
    }
}

struct FdContext {
    registered: Event,
    read: EventSlot,
    write: EventSlot,
}

impl FdContext {
    fn new() -> Self {
        FdContext {
            registered: Event::empty(),
            read: EventSlot::empty(),
            write: EventSlot::empty(),
        }
    }

    fn slot(&mut self, event: Event) -> &mut EventSlot {
        if event == Event::READ {
            &mut self.read
        } else {
            &mut self.write
        }
    }
}

pub struct IOManager {
    scheduler: Arc<Scheduler>,
    epoll: Epoll,
    wake_reader: RawFd,
    wake_writer: RawFd,
    fds: RwLock<Vec<Option<Mutex<FdContext>>>>,
    pending_events: AtomicUsize,
    timers: TimerManager,
}

struct ReactorHooks {
    target: Mutex<Weak<IOManager>>,
}

impl ReactorHooks {
    fn new() -> Arc<Self> {
        Arc::new(ReactorHooks {
            target: Mutex::new(Weak::new()),
        })
    }

    fn bind(&self, io: &Arc<IOManager>) {
        *self.target.lock().unwrap() = Arc::downgrade(io);
    }
}

impl IdleHooks for ReactorHooks {
    fn idle(&self, scheduler: &Scheduler) {
        if let Some(io) = self.target.lock().unwrap().upgrade() {
            io.idle_pass(scheduler);
        }
    }

    fn tickle(&self, _scheduler: &Scheduler) {
        if let Some(io) = self.target.lock().unwrap().upgrade() {
            io.wake_self();
        }
    }
}

impl TimerHooks for ReactorHooks {
    fn on_timer_inserted_at_front(&self) {
        // A worker may already be blocked in `Epoll::wait` polling toward
        // whatever used to be the soonest deadline; wake it so it re-reads
        // `next_deadline_ms()` instead of oversleeping past this one.
        if let Some(io) = self.target.lock().unwrap().upgrade() {
            io.wake_self();
        }
    }
}

impl IOManager {
    /// Build the reactor and start its scheduler, using `worker_threads` as
    /// the total worker slot count (one of which is the constructing thread
    /// itself, if `use_caller` is set — see [`Scheduler::with_hooks`]).
    /// There is no separate `start()` step: by the time this returns, the
    /// worker pool is already running (or, if `use_caller`, ready to run
    /// its caller-thread share once [`IOManager::stop`] is called).
    pub fn new(worker_threads: usize, use_caller: bool, name: impl Into<String>) -> io::Result<Arc<IOManager>> {
        let epoll = Epoll::new()?;
        let (wake_reader, wake_writer) = self_pipe()?;
        epoll.add(wake_reader, Event::READ)?;

        let hooks = ReactorHooks::new();
        let scheduler = Scheduler::with_hooks(worker_threads, use_caller, name, hooks.clone());

        let manager = Arc::new(IOManager {
            scheduler,
            epoll,
            wake_reader,
            wake_writer,
            fds: RwLock::new(Vec::with_capacity(DEFAULT_FD_CAPACITY)),
            pending_events: AtomicUsize::new(0),
            timers: TimerManager::with_hooks(clock::now_ms, hooks.clone()),
        });
        hooks.bind(&manager);
        manager.scheduler.start();
        Ok(manager)
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn stop(&self) -> Result<()> {
        self.scheduler.stop()
    }

    pub fn timers(&self) -> &TimerManager {
        &self.timers
    }

    /// Register interest in `event` on `fd`, running `task` once it fires.
    /// Fails if `event` is already registered for this fd.
    pub fn add_event(&self, fd: RawFd, event: Event, task: Task, pin: Option<libc::pid_t>) -> Result<()> {
        self.ensure_capacity(fd as usize);
        let fds = self.fds.read().unwrap();
        let slot = fds[fd as usize].as_ref().expect("fd slot allocated by ensure_capacity");
        let mut ctx = slot.lock().unwrap();

        if ctx.registered.contains(event) {
            return Err(Error::EventAlreadyRegistered);
        }

        let new_mask = ctx.registered | event;
        self.epoll.modify_or_add(fd, new_mask, ctx.registered.is_empty())?;
        ctx.registered = new_mask;
        let event_slot = ctx.slot(event);
        event_slot.task = Some(task);
        event_slot.thread = pin;
        self.pending_events.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Remove interest in `event` on `fd` without running its callback.
    pub fn del_event(&self, fd: RawFd, event: Event) -> Result<()> {
        let fds = self.fds.read().unwrap();
        let Some(Some(slot)) = fds.get(fd as usize) else {
            return Err(Error::NoSuchEvent);
        };
        let mut ctx = slot.lock().unwrap();
        if !ctx.registered.contains(event) {
            return Err(Error::NoSuchEvent);
        }
        let new_mask = ctx.registered - event;
        self.epoll.modify_or_remove(fd, new_mask)?;
        ctx.registered = new_mask;
        *ctx.slot(event) = EventSlot::empty();
        self.pending_events.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }

    /// Remove interest in `event` on `fd` and schedule its callback as if it
    /// had fired.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> Result<()> {
        let scheduled = {
            let fds = self.fds.read().unwrap();
            let Some(Some(slot)) = fds.get(fd as usize) else {
                return Err(Error::NoSuchEvent);
            };
            let mut ctx = slot.lock().unwrap();
            if !ctx.registered.contains(event) {
                return Err(Error::NoSuchEvent);
            }
            let new_mask = ctx.registered - event;
            self.epoll.modify_or_remove(fd, new_mask)?;
            ctx.registered = new_mask;
            let taken = std::mem::replace(ctx.slot(event), EventSlot::empty());
            self.pending_events.fetch_sub(1, Ordering::Relaxed);
            taken
        };
        if let Some(task) = scheduled.task {
            self.scheduler.schedule(task, scheduled.thread);
        }
        Ok(())
    }

    /// Cancel every registered event on `fd`, scheduling both callbacks as
    /// if they had fired.
    pub fn cancel_all(&self, fd: RawFd) -> Result<()> {
        let (read, write) = {
            let fds = self.fds.read().unwrap();
            let Some(Some(slot)) = fds.get(fd as usize) else {
                return Err(Error::NoSuchEvent);
            };
            let mut ctx = slot.lock().unwrap();
            if ctx.registered.is_empty() {
                return Err(Error::NoSuchEvent);
            }
            self.epoll.remove(fd)?;
            let n = ctx.registered.iter().count();
            self.pending_events.fetch_sub(n, Ordering::Relaxed);
            ctx.registered = Event::empty();
            (
                std::mem::replace(&mut ctx.read, EventSlot::empty()),
                std::mem::replace(&mut ctx.write, EventSlot::empty()),
            )
        };
        for slot in [read, write] {
            if let Some(task) = slot.task {
                self.scheduler.schedule(task, slot.thread);
            }
        }
        Ok(())
    }

    fn ensure_capacity(&self, fd: usize) {
        if self.fds.read().unwrap().len() > fd {
            return;
        }
        let mut fds = self.fds.write().unwrap();
        if fds.len() <= fd {
            let new_len = (fds.len().max(DEFAULT_FD_CAPACITY) * 2).max(fd + 1);
            fds.resize_with(new_len, || None);
        }
        if fds[fd].is_none() {
            fds[fd] = Some(Mutex::new(FdContext::new()));
        }
    }

    fn wake_self(&self) {
        unsafe {
            let byte: u8 = 1;
            libc::write(self.wake_writer, &byte as *const u8 as *const libc::c_void, 1);
        }
    }

    fn drain_self_pipe(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe { libc::read(self.wake_reader, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n <= 0 {
                break;
            }
        }
    }

    /// One pass of the reactor's idle loop: wait for readiness or the next
    /// timer deadline, whichever comes first, then schedule everything
    /// that's now due.
    fn idle_pass(&self, scheduler: &Scheduler) {
        let timeout_ms = self.timers.next_deadline_ms().map(|ms| ms.min(1000)).unwrap_or(1000);
        let ready = match self.epoll.wait(timeout_ms) {
            Ok(events) => events,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return,
            Err(e) => {
                log::warn!("epoll_wait failed: {}", e);
                return;
            }
        };

        for (fd, events) in ready {
            if fd == self.wake_reader {
                self.drain_self_pipe();
                continue;
            }
            self.trigger_ready(fd, events);
        }

        for cb in self.timers.expired_callbacks() {
            scheduler.schedule(Task::Callback(cb), None);
        }
    }

    fn trigger_ready(&self, fd: RawFd, events: Event) {
        let mut to_schedule = Vec::new();
        {
            let fds = self.fds.read().unwrap();
            if let Some(Some(slot)) = fds.get(fd as usize) {
                let mut ctx = slot.lock().unwrap();
                for event in [Event::READ, Event::WRITE] {
                    if events.contains(event) && ctx.registered.contains(event) {
                        let taken = std::mem::replace(ctx.slot(event), EventSlot::empty());
                        ctx.registered -= event;
                        if let Some(task) = taken.task {
                            to_schedule.push((task, taken.thread));
                        }
                    }
                }
                if ctx.registered.is_empty() {
                    let _ = self.epoll.remove(fd);
                } else {
                    let _ = self.epoll.modify_or_add(fd, ctx.registered, false);
                }
            }
        }
        for (task, pin) in to_schedule {
            self.pending_events.fetch_sub(1, Ordering::Relaxed);
            self.scheduler.schedule(task, pin);
        }
    }
}

fn self_pipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    for fd in fds {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    }
    Ok((fds[0], fds[1]))
}

impl Drop for IOManager {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake_reader);
            libc::close(self.wake_writer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn add_event_fires_on_writable_socket() {
        let io_mgr = IOManager::new(1, false, "io-test").unwrap();

        let (r, w) = unsafe {
            let mut fds = [0 as RawFd; 2];
            assert_eq!(libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()), 0);
            (fds[0], fds[1])
        };

        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = Arc::clone(&fired);
        io_mgr
            .add_event(
                w,
                Event::WRITE,
                Task::Callback(Box::new(move || {
                    fired2.store(true, Ordering::SeqCst);
                })),
                None,
            )
            .unwrap();

        std::thread::sleep(std::time::Duration::from_millis(200));
        assert!(fired.load(Ordering::SeqCst));

        unsafe {
            libc::close(r);
            libc::close(w);
        }
        io_mgr.stop().unwrap();
    }

    #[test]
    fn duplicate_event_registration_is_rejected() {
        let io_mgr = IOManager::new(1, false, "io-test-dup").unwrap();
        let (_r, w) = unsafe {
            let mut fds = [0 as RawFd; 2];
            assert_eq!(libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()), 0);
            (fds[0], fds[1])
        };
        io_mgr.add_event(w, Event::WRITE, Task::Callback(Box::new(|| {})), None).unwrap();
        let result = io_mgr.add_event(w, Event::WRITE, Task::Callback(Box::new(|| {})), None);
        assert!(result.is_err());
        unsafe {
            libc::close(w);
        }
    }
}
