//! A multithreaded stackful-fiber scheduler fused with an edge-triggered
//! I/O reactor and a monotonic timer wheel.
//!
//! Three things compose to form the reactor in [`io`]:
//! - [`fiber`] — stackful coroutines switched by hand-written machine
//!   context save/restore, one OS thread at a time.
//! - [`scheduler`] — a pool of worker OS threads pulling [`task::Task`]s
//!   off a shared queue and resuming them as fibers.
//! - [`timer`] — a deadline-ordered wheel the reactor's idle loop consults
//!   alongside `epoll_wait`.
//!
//! [`clock`], [`sync`], and [`thread`] are small supporting pieces shared
//! by all three; [`error`] and [`log`] are the crate's ambient error and
//! logging surface.
#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate failure;

pub mod clock;
pub mod error;
pub mod fiber;
pub mod io;
pub mod log;
pub mod scheduler;
pub mod sync;
pub mod task;
pub mod thread;
pub mod timer;
