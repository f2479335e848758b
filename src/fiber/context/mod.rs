//! Platform context-switch backend
//!
//! Context switching sits behind one small interface with two
//! implementations: a portable assembly-level save/restore of
//! callee-saved registers (the default), and a test-only
//! one-OS-thread-per-fiber backend for platforms where inline asm is
//! infeasible, enabled via the `threaded-fiber` feature.
#[cfg(not(feature = "threaded-fiber"))]
mod asm;
#[cfg(feature = "threaded-fiber")]
mod threaded;

#[cfg(not(feature = "threaded-fiber"))]
pub use asm::Context;
#[cfg(feature = "threaded-fiber")]
pub use threaded::Context;
