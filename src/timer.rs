//! Monotonic timer wheel
//!
//! [`TimerManager`] keeps timers ordered by absolute deadline in a `BTreeSet`
//! and answers two questions a reactor's idle loop needs every pass: "how
//! long until the next timer fires" and "which timers are due right now".
//! The clock is injected as a plain function pointer rather than read
//! directly from [`crate::clock`], so tests can drive deterministic
//! rollover scenarios without any shared global state.
use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

pub type ClockFn = fn() -> u64;

/// If the clock reports a value more than this far behind the last
/// observed time, we treat it as a backward jump (e.g. NTP step) rather
/// than ordinary timer-wheel churn, and run every timer's callback rather
/// than leaving them stranded arbitrarily far in the future.
const ROLLOVER_THRESHOLD_MS: u64 = 60 * 60 * 1000;

/// Hook invoked when a newly (re)scheduled timer becomes the soonest
/// deadline in the set, letting whatever's blocked waiting on "how long
/// until the next timer" wake up early instead of oversleeping by however
/// long it was already going to wait. [`crate::io::IOManager`] wires this to
/// its self-pipe wakeup.
pub trait TimerHooks: Send + Sync {
    fn on_timer_inserted_at_front(&self);
}

struct NoHooks;
impl TimerHooks for NoHooks {
    fn on_timer_inserted_at_front(&self) {}
}

struct TimerEntry {
    deadline_ms: u64,
    id: u64,
    /// The delay this timer was originally scheduled with. Stored
    /// unconditionally, even for one-shot timers, so `refresh`/`reset` can
    /// recover it later — only `recurring` decides whether
    /// `expired_callbacks` uses it to auto-reinsert.
    period_ms: u64,
    recurring: bool,
    /// The instant this entry's period is currently based from: either the
    /// original `add_timer` call or the most recent `reset(.., from_now:
    /// false)`'s base. `reset(.., from_now: true)` and every `refresh`
    /// re-base it to `now`.
    inserted_ms: u64,
    condition: Option<Weak<()>>,
    callback: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline_ms == other.deadline_ms && self.id == other.id
    }
}
impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.deadline_ms, self.id).cmp(&(other.deadline_ms, other.id))
    }
}

/// A handle to a scheduled timer. Dropping it does not cancel the timer;
/// call [`TimerManager::cancel`] (or [`Timer::cancel`]) explicitly.
#[derive(Clone, Copy)]
pub struct Timer {
    deadline_ms: u64,
    id: u64,
}

struct Shared {
    clock: ClockFn,
    last_seen_ms: AtomicU64,
    entries: Mutex<BTreeSet<TimerEntryKey>>,
    next_id: AtomicU64,
    /// Set when the reactor has already been notified of the current
    /// front-of-queue deadline; cleared once something actually observes it
    /// (see [`TimerManager::next_deadline_ms`]), so the next front-changing
    /// insertion tickles again.
    tickled: AtomicBool,
    hooks: Arc<dyn TimerHooks>,
}

/// `BTreeSet` needs `Ord`, but we also need to find-and-remove an entry by
/// `(deadline, id)` without carrying the callback around; `TimerEntryKey`
/// wraps an `Arc<TimerEntry>` and forwards ordering/equality to it.
#[derive(Clone)]
struct TimerEntryKey(Arc<TimerEntry>);

impl PartialEq for TimerEntryKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq(&other.0)
    }
}
impl Eq for TimerEntryKey {}
impl PartialOrd for TimerEntryKey {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        self.0.partial_cmp(&other.0)
    }
}
impl Ord for TimerEntryKey {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.0.cmp(&other.0)
    }
}

pub struct TimerManager {
    shared: Arc<Shared>,
}

impl TimerManager {
    pub fn new(clock: ClockFn) -> Self {
        Self::with_hooks(clock, Arc::new(NoHooks))
    }

    /// Like [`new`](Self::new), but `hooks` is notified whenever an
    /// insertion changes the soonest deadline.
    pub fn with_hooks(clock: ClockFn, hooks: Arc<dyn TimerHooks>) -> Self {
        let now = clock();
        TimerManager {
            shared: Arc::new(Shared {
                clock,
                last_seen_ms: AtomicU64::new(now),
                entries: Mutex::new(BTreeSet::new()),
                next_id: AtomicU64::new(1),
                tickled: AtomicBool::new(false),
                hooks,
            }),
        }
    }

    /// Schedule `callback` to run `delay_ms` from now, optionally repeating
    /// every `delay_ms` thereafter.
    pub fn add_timer(
        &self,
        delay_ms: u64,
        recurring: bool,
        callback: impl FnOnce() + Send + 'static,
    ) -> Timer {
        self.insert(delay_ms, recurring, None, Box::new(callback))
    }

    /// Like [`add_timer`](Self::add_timer), but the callback only runs if
    /// `condition` can still be upgraded when the deadline is reached —
    /// lets a caller tie a timer's lifetime to some other object without
    /// an explicit cancel.
    pub fn add_condition_timer(
        &self,
        delay_ms: u64,
        recurring: bool,
        condition: Weak<()>,
        callback: impl FnOnce() + Send + 'static,
    ) -> Timer {
        self.insert(delay_ms, recurring, Some(condition), Box::new(callback))
    }

    fn insert(
        &self,
        delay_ms: u64,
        recurring: bool,
        condition: Option<Weak<()>>,
        callback: Box<dyn FnOnce() + Send>,
    ) -> Timer {
        let now = (self.shared.clock)();
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let deadline_ms = now + delay_ms;
        let entry = Arc::new(TimerEntry {
            deadline_ms,
            id,
            period_ms: delay_ms,
            recurring,
            inserted_ms: now,
            condition,
            callback: Mutex::new(Some(callback)),
        });
        let mut entries = self.shared.entries.lock().unwrap();
        self.insert_locked(&mut entries, entry);
        Timer { deadline_ms, id }
    }

    /// Insert `entry` into an already-locked set, notifying [`TimerHooks`]
    /// if this placed it at the front and the tickled flag was clear.
    fn insert_locked(&self, entries: &mut BTreeSet<TimerEntryKey>, entry: Arc<TimerEntry>) {
        let is_new_front = entries
            .iter()
            .next()
            .map_or(true, |front| entry.deadline_ms < front.0.deadline_ms);
        entries.insert(TimerEntryKey(entry));
        if is_new_front && !self.shared.tickled.swap(true, Ordering::AcqRel) {
            self.shared.hooks.on_timer_inserted_at_front();
        }
    }

    /// Whether any timer is currently scheduled.
    pub fn has_timer(&self) -> bool {
        !self.shared.entries.lock().unwrap().is_empty()
    }

    /// Milliseconds until the next timer is due, or `None` if there are no
    /// timers at all. `0` means at least one timer is already overdue.
    /// Clears the tickled flag: the caller is about to act on the current
    /// front deadline, so a future insertion ahead of it should tickle
    /// again.
    pub fn next_deadline_ms(&self) -> Option<u64> {
        let now = self.observe_clock();
        let entries = self.shared.entries.lock().unwrap();
        let next = entries.iter().next().map(|e| e.0.deadline_ms.saturating_sub(now));
        self.shared.tickled.store(false, Ordering::Release);
        next
    }

    /// Pop every timer whose deadline has passed (or whose condition has
    /// expired), re-inserting recurring ones at their next deadline, and
    /// return their callbacks for the caller to run outside any lock this
    /// manager holds.
    pub fn expired_callbacks(&self) -> Vec<Box<dyn FnOnce() + Send>> {
        let now = self.observe_clock();
        let rolled_over = self.detect_rollover(now);

        let mut entries = self.shared.entries.lock().unwrap();
        let mut due = Vec::new();
        loop {
            let is_due = match entries.iter().next() {
                Some(e) => rolled_over || e.0.deadline_ms <= now,
                None => false,
            };
            if !is_due {
                break;
            }
            let entry = entries.pop_first().unwrap().0;
            due.push(entry);
        }

        let mut callbacks = Vec::with_capacity(due.len());
        for entry in due {
            let alive = match &entry.condition {
                Some(weak) => weak.upgrade().is_some(),
                None => true,
            };

            if entry.recurring {
                if alive {
                    let next_deadline = now + entry.period_ms;
                    let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
                    let cb = entry.callback.lock().unwrap().take();
                    let renewed = Arc::new(TimerEntry {
                        deadline_ms: next_deadline,
                        id,
                        period_ms: entry.period_ms,
                        recurring: true,
                        inserted_ms: now,
                        condition: entry.condition.clone(),
                        callback: Mutex::new(cb),
                    });
                    self.insert_locked(&mut entries, renewed);
                }
                continue;
            }

            if alive {
                if let Some(cb) = entry.callback.lock().unwrap().take() {
                    callbacks.push(cb);
                }
            }
        }
        callbacks
    }

    fn observe_clock(&self) -> u64 {
        (self.shared.clock)()
    }

    /// A backward jump of at least an hour is treated as a clock rollover:
    /// every pending timer is harvested immediately rather than left
    /// stranded behind a `now` that may never catch up to their original
    /// deadlines.
    fn detect_rollover(&self, now: u64) -> bool {
        let last = self.shared.last_seen_ms.swap(now, Ordering::Relaxed);
        if now + ROLLOVER_THRESHOLD_MS < last {
            log::warn!("monotonic clock moved backward by {}ms; harvesting all pending timers", last - now);
            true
        } else {
            false
        }
    }

    pub fn cancel(&self, timer: &Timer) -> bool {
        let mut entries = self.shared.entries.lock().unwrap();
        let probe = entries
            .iter()
            .find(|e| e.0.deadline_ms == timer.deadline_ms && e.0.id == timer.id)
            .cloned();
        match probe {
            Some(key) => {
                entries.remove(&key);
                true
            }
            None => false,
        }
    }

    /// Re-insert `timer` at `now + period`, using the period it was already
    /// scheduled with (no explicit delay). Updates `timer` in place to
    /// track the renewed entry. Returns `false` if `timer` is no longer
    /// pending.
    pub fn refresh(&self, timer: &mut Timer) -> bool {
        self.reschedule(timer, None, true)
    }

    /// Change `timer`'s period to `ms`, re-basing either from `now`
    /// (`from_now: true`) or from the instant it was originally inserted
    /// (`from_now: false`, e.g. to realign a periodic timer back onto its
    /// original cadence). Updates `timer` in place. Returns `false` if
    /// `timer` is no longer pending.
    pub fn reset(&self, timer: &mut Timer, ms: u64, from_now: bool) -> bool {
        self.reschedule(timer, Some(ms), from_now)
    }

    fn reschedule(&self, timer: &mut Timer, new_period_ms: Option<u64>, from_now: bool) -> bool {
        let mut entries = self.shared.entries.lock().unwrap();
        let probe = entries
            .iter()
            .find(|e| e.0.deadline_ms == timer.deadline_ms && e.0.id == timer.id)
            .cloned();
        let Some(key) = probe else { return false };
        entries.remove(&key);

        let period_ms = new_period_ms.unwrap_or(key.0.period_ms);
        let now = (self.shared.clock)();
        let base = if from_now { now } else { key.0.inserted_ms };
        let new_deadline = base + period_ms;
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let renewed = Arc::new(TimerEntry {
            deadline_ms: new_deadline,
            id,
            period_ms,
            recurring: key.0.recurring,
            inserted_ms: base,
            condition: key.0.condition.clone(),
            callback: Mutex::new(key.0.callback.lock().unwrap().take()),
        });
        self.insert_locked(&mut entries, renewed);
        timer.deadline_ms = new_deadline;
        timer.id = id;
        true
    }
}

impl Timer {
    pub fn cancel(&self, manager: &TimerManager) -> bool {
        manager.cancel(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64 as StdAtomicU64;
    use std::sync::Mutex as StdMutex;

    static FAKE_NOW: StdAtomicU64 = StdAtomicU64::new(0);

    fn fake_clock() -> u64 {
        FAKE_NOW.load(Ordering::Relaxed)
    }

    fn advance(ms: u64) {
        FAKE_NOW.fetch_add(ms, Ordering::Relaxed);
    }

    #[test]
    fn fires_after_delay_not_before() {
        FAKE_NOW.store(0, Ordering::Relaxed);
        let mgr = TimerManager::new(fake_clock);
        let fired = Arc::new(StdMutex::new(false));
        let fired2 = Arc::clone(&fired);
        mgr.add_timer(100, false, move || *fired2.lock().unwrap() = true);

        advance(50);
        assert!(mgr.expired_callbacks().is_empty());

        advance(51);
        let callbacks = mgr.expired_callbacks();
        assert_eq!(callbacks.len(), 1);
        for cb in callbacks {
            cb();
        }
        assert!(*fired.lock().unwrap());
    }

    #[test]
    fn recurring_timer_reschedules_itself() {
        FAKE_NOW.store(0, Ordering::Relaxed);
        let mgr = TimerManager::new(fake_clock);
        let count = Arc::new(StdAtomicU64::new(0));
        let count2 = Arc::clone(&count);
        mgr.add_timer(10, true, move || {
            count2.fetch_add(1, Ordering::Relaxed);
        });

        for _ in 0..3 {
            advance(10);
            for cb in mgr.expired_callbacks() {
                cb();
            }
        }
        assert!(mgr.has_timer());
        assert_eq!(count.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn cancel_prevents_firing() {
        FAKE_NOW.store(0, Ordering::Relaxed);
        let mgr = TimerManager::new(fake_clock);
        let timer = mgr.add_timer(10, false, || panic!("cancelled timer fired"));
        assert!(mgr.cancel(&timer));
        advance(20);
        assert!(mgr.expired_callbacks().is_empty());
    }

    #[test]
    fn backward_clock_jump_harvests_everything() {
        FAKE_NOW.store(10_000_000, Ordering::Relaxed);
        let mgr = TimerManager::new(fake_clock);
        let fired = Arc::new(StdAtomicU64::new(0));
        for _ in 0..3 {
            let fired = Arc::clone(&fired);
            mgr.add_timer(5_000, false, move || {
                fired.fetch_add(1, Ordering::Relaxed);
            });
        }
        FAKE_NOW.store(0, Ordering::Relaxed);
        let callbacks = mgr.expired_callbacks();
        assert_eq!(callbacks.len(), 3);
        for cb in callbacks {
            cb();
        }
        assert_eq!(fired.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn refresh_reuses_the_stored_period_with_no_argument() {
        FAKE_NOW.store(0, Ordering::Relaxed);
        let mgr = TimerManager::new(fake_clock);
        let mut timer = mgr.add_timer(100, false, || {});

        advance(80);
        assert!(mgr.refresh(&mut timer));
        // Refreshed from "now" (80) using the original 100ms period, so it's
        // not due yet at what would have been the original deadline (100).
        advance(20);
        assert!(mgr.expired_callbacks().is_empty());
        advance(81);
        assert_eq!(mgr.expired_callbacks().len(), 1);
    }

    #[test]
    fn refresh_recovers_the_period_of_a_one_shot_timer() {
        // A one-shot timer's period must still be remembered even though
        // `recurring` is false, so `refresh` has something to reuse.
        FAKE_NOW.store(0, Ordering::Relaxed);
        let mgr = TimerManager::new(fake_clock);
        let mut timer = mgr.add_timer(50, false, || {});
        assert!(mgr.refresh(&mut timer));
        advance(49);
        assert!(mgr.expired_callbacks().is_empty());
        advance(2);
        assert_eq!(mgr.expired_callbacks().len(), 1);
    }

    #[test]
    fn reset_changes_the_period_and_can_rebase_from_original_insertion() {
        FAKE_NOW.store(0, Ordering::Relaxed);
        let mgr = TimerManager::new(fake_clock);
        let mut timer = mgr.add_timer(100, false, || {});

        advance(30);
        // Re-base from the original insertion instant (0), not from now
        // (30): new deadline is 0 + 200 = 200, i.e. 170ms from now.
        assert!(mgr.reset(&mut timer, 200, false));
        advance(169);
        assert!(mgr.expired_callbacks().is_empty());
        advance(2);
        assert_eq!(mgr.expired_callbacks().len(), 1);
    }

    #[test]
    fn reset_from_now_rebases_against_the_current_clock() {
        FAKE_NOW.store(0, Ordering::Relaxed);
        let mgr = TimerManager::new(fake_clock);
        let mut timer = mgr.add_timer(100, false, || {});

        advance(30);
        assert!(mgr.reset(&mut timer, 10, true));
        advance(9);
        assert!(mgr.expired_callbacks().is_empty());
        advance(2);
        assert_eq!(mgr.expired_callbacks().len(), 1);
    }

    struct CountingHooks(StdAtomicU64);
    impl TimerHooks for CountingHooks {
        fn on_timer_inserted_at_front(&self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn front_insertion_tickles_once_until_observed() {
        FAKE_NOW.store(0, Ordering::Relaxed);
        let hooks = Arc::new(CountingHooks(StdAtomicU64::new(0)));
        let mgr = TimerManager::with_hooks(fake_clock, hooks.clone());

        mgr.add_timer(100, false, || {});
        assert_eq!(hooks.0.load(Ordering::Relaxed), 1, "first timer is always a new front");

        // A later deadline doesn't move the front; no extra tickle.
        mgr.add_timer(200, false, || {});
        assert_eq!(hooks.0.load(Ordering::Relaxed), 1);

        // A sooner deadline does move the front.
        mgr.add_timer(10, false, || {});
        assert_eq!(hooks.0.load(Ordering::Relaxed), 2);

        // Until the front is observed (next_deadline_ms), further
        // front-moving insertions don't tickle again.
        mgr.add_timer(1, false, || {});
        assert_eq!(hooks.0.load(Ordering::Relaxed), 2);

        mgr.next_deadline_ms();
        mgr.add_timer(0, false, || {});
        assert_eq!(hooks.0.load(Ordering::Relaxed), 3);
    }
}
