//! OS thread wrapper
//!
//! A thin wrapper around a native OS thread carrying a name, its OS thread
//! id, and a start-barrier semaphore. The constructor blocks on the
//! semaphore until the spawned thread has recorded its id, which is why
//! [`Thread::id`] is valid immediately after construction returns.
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::sync::Semaphore;

/// Maximum length of a thread name visible to the OS (`pthread_setname_np`
/// truncates at 15 bytes + NUL on Linux).
const MAX_OS_NAME_LEN: usize = 15;

/// A native OS thread that runs a single nullary callback to completion.
///
/// The constructor blocks until the spawned thread has installed its name
/// and recorded its OS id, so [`Thread::id`] is always valid once `new`
/// returns.
pub struct Thread {
    name: String,
    id: libc::pid_t,
    handle: Option<JoinHandle<()>>,
}

impl Thread {
    /// Spawn `cb` on a new OS thread named `name`.
    pub fn new<F>(name: impl Into<String>, cb: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let ready = Arc::new(Semaphore::new(0));
        let ready_in_thread = Arc::clone(&ready);
        let id_slot = Arc::new(std::sync::atomic::AtomicI32::new(0));
        let id_slot_in_thread = Arc::clone(&id_slot);
        let os_name = truncate_os_name(&name);

        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                set_os_thread_name(&os_name);
                id_slot_in_thread.store(current_tid(), std::sync::atomic::Ordering::SeqCst);
                ready_in_thread.post();
                cb();
            })
            .expect("failed to spawn OS thread");

        ready.wait();
        let id = id_slot.load(std::sync::atomic::Ordering::SeqCst);
        log::debug!("thread '{}' started, tid={}", name, id);

        Thread {
            name,
            id,
            handle: Some(handle),
        }
    }

    /// The OS-level thread id, valid immediately after construction.
    pub fn id(&self) -> libc::pid_t {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Block until the thread's callback returns.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        // `JoinHandle`'s own `Drop` detaches if not joined.
    }
}

fn truncate_os_name(name: &str) -> String {
    name.chars().take(MAX_OS_NAME_LEN).collect()
}

#[cfg(target_os = "linux")]
fn current_tid() -> libc::pid_t {
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

#[cfg(not(target_os = "linux"))]
fn current_tid() -> libc::pid_t {
    std::process::id() as libc::pid_t
}

#[cfg(target_os = "linux")]
fn set_os_thread_name(name: &str) {
    if let Ok(cname) = std::ffi::CString::new(name) {
        unsafe {
            libc::pthread_setname_np(libc::pthread_self(), cname.as_ptr());
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn set_os_thread_name(_name: &str) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn id_valid_immediately_after_construction() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = Arc::clone(&ran);
        let thread = Thread::new("t-idtest", move || {
            ran2.store(true, Ordering::SeqCst);
        });
        assert!(thread.id() > 0);
        thread.join();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn name_is_preserved() {
        let thread = Thread::new("t-name", || {});
        assert_eq!(thread.name(), "t-name");
        thread.join();
    }
}
