//! Crate-wide error type
//!
//! The taxonomy is: programmer misuse (rejected with a `Result`, never
//! silently ignored), transient OS errors (`EINTR` is retried and never
//! surfaces here), and resource exhaustion (fatal, never represented as an
//! `Error` — those paths panic in the constructor).
use std::io;

#[derive(Debug, Fail)]
pub enum Error {
    /// `Fiber::resume` on a fiber that isn't `READY`, or `Fiber::reset` on a
    /// fiber that isn't `TERM`.
    #[fail(display = "fiber is not in a resumable/resettable state")]
    FiberNotReady,

    /// `IOManager::add_event` called twice for the same `(fd, event)` pair
    /// without an intervening `del_event`/`cancel_event`.
    #[fail(display = "event already registered for this fd")]
    EventAlreadyRegistered,

    /// `fd` passed to `del_event`/`cancel_event`/`cancel_all` has no
    /// registered events, or has never been seen by this `IOManager`.
    #[fail(display = "no such fd or event registered")]
    NoSuchEvent,

    /// `Scheduler::stop` called from a thread other than the caller thread
    /// when the scheduler was built with `use_caller = true`.
    #[fail(display = "stop() must be called from the caller thread when use_caller is set")]
    WrongStopper,

    /// The reactor's readiness multiplexer reported an error other than
    /// `EINTR`.
    #[fail(display = "reactor I/O error: {}", _0)]
    Reactor(io::Error),
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error::Reactor(error)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
