//! Small synchronization primitives used by the runtime internals
//!
//! Nothing here is exposed as part of the public API; it backs
//! [`crate::thread::Thread`]'s start barrier and is otherwise plain
//! `std::sync`.
use std::sync::{Condvar, Mutex};

/// A counting semaphore, used by [`crate::thread::Thread`] to block the
/// constructing thread until the spawned OS thread has recorded its id and
/// name.
pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(initial: usize) -> Self {
        Semaphore {
            count: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    /// Block until a permit is available, then consume it.
    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cond.wait(count).unwrap();
        }
        *count -= 1;
    }

    /// Release one permit, waking at most one waiter.
    pub fn post(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.cond.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn wait_blocks_until_post() {
        let sem = Arc::new(Semaphore::new(0));
        let sem2 = Arc::clone(&sem);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            sem2.post();
        });
        sem.wait();
        handle.join().unwrap();
    }

    #[test]
    fn initial_permits_available_immediately() {
        let sem = Semaphore::new(1);
        sem.wait();
    }
}
