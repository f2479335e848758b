//! Thin `epoll` wrapper: edge-triggered registration and a `wait` that
//! returns ready fds paired with which of [`super::Event`] fired.
use std::io;
use std::os::unix::io::RawFd;

use super::Event;

pub struct Epoll {
    fd: RawFd,
}

impl Epoll {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Epoll { fd })
    }

    pub fn add(&self, fd: RawFd, events: Event) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, events)
    }

    /// Register `events` for `fd`, choosing `ADD` or `MOD` based on whether
    /// anything was already registered (`was_empty`).
    pub fn modify_or_add(&self, fd: RawFd, events: Event, was_empty: bool) -> io::Result<()> {
        let op = if was_empty { libc::EPOLL_CTL_ADD } else { libc::EPOLL_CTL_MOD };
        self.ctl(op, fd, events)
    }

    /// Update `fd`'s registration to `events`, or drop it from epoll
    /// entirely if `events` is now empty.
    pub fn modify_or_remove(&self, fd: RawFd, events: Event) -> io::Result<()> {
        if events.is_empty() {
            self.remove(fd)
        } else {
            self.ctl(libc::EPOLL_CTL_MOD, fd, events)
        }
    }

    pub fn remove(&self, fd: RawFd) -> io::Result<()> {
        let rc = unsafe { libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            // Already gone (e.g. the other half of a pair raced us); not
            // an error a caller needs to see.
            if err.kind() == io::ErrorKind::NotFound {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: Event) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: to_raw(events),
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.fd, op, fd, &mut ev) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Block for up to `timeout_ms`, returning every ready `(fd, events)`
    /// pair. Retries internally on `EINTR`.
    pub fn wait(&self, timeout_ms: u64) -> io::Result<Vec<(RawFd, Event)>> {
        let mut events: [libc::epoll_event; 64] = unsafe { std::mem::zeroed() };
        let timeout = timeout_ms.min(i32::MAX as u64) as i32;
        loop {
            let n = unsafe { libc::epoll_wait(self.fd, events.as_mut_ptr(), events.len() as i32, timeout) };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            let ready = events[..n as usize]
                .iter()
                .map(|e| (e.u64 as RawFd, from_raw(e.events)))
                .collect();
            return Ok(ready);
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

fn to_raw(events: Event) -> u32 {
    // Edge-triggered: a readiness notification for a fd fires once per
    // transition, not once per `wait()` call while data remains.
    let mut raw = libc::EPOLLET as u32;
    if events.contains(Event::READ) {
        raw |= libc::EPOLLIN as u32;
    }
    if events.contains(Event::WRITE) {
        raw |= libc::EPOLLOUT as u32;
    }
    raw
}

fn from_raw(raw: u32) -> Event {
    let mut events = Event::empty();
    if raw & (libc::EPOLLIN as u32) != 0 {
        events |= Event::READ;
    }
    if raw & (libc::EPOLLOUT as u32) != 0 {
        events |= Event::WRITE;
    }
    // Treat a hangup/error notification as readiness on both interests so
    // a waiter doesn't block forever on a closed peer.
    if raw & ((libc::EPOLLHUP | libc::EPOLLERR) as u32) != 0 {
        events = Event::READ | Event::WRITE;
    }
    events
}
