//! Monotonic time source
//!
//! Every other subsystem in this crate — the timer wheel, the reactor's
//! idle-loop deadline, the scheduler's diagnostics — reasons about time as
//! milliseconds since an arbitrary process-local epoch. This module is the
//! only place that talks to the OS clock; [`crate::timer::TimerManager`]
//! takes its clock as a plain function pointer so tests can substitute a
//! fake without any global mutable state here.
use std::sync::OnceLock;
use std::time::Instant;

/// Milliseconds elapsed since an arbitrary, process-local epoch.
///
/// Backed by [`std::time::Instant`], so it is immune to wall-clock
/// adjustments (NTP step, user changing the system clock, etc).
#[inline]
pub fn now_ms() -> u64 {
    epoch().elapsed().as_millis() as u64
}

fn epoch() -> &'static Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now)
}
