use crate::runtime::reactor::Reactor;
use ahash::AHashMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Callback invoked when a timer expires. Fires exactly once; the entry is
/// removed from the registry before the callback runs.
pub type TimerCallback = Box<dyn FnOnce(&mut Reactor, Vec<Value>)>;

/// Identifies a scheduled timer. Ids are unique and monotonically issued
/// for the lifetime of the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    #[error("invalid timer delay: {0} ms")]
    InvalidDelay(i64),
}

/// Ordering key for pending timers: earlier deadlines first, ties broken by
/// ascending id so that timers registered for the same instant fire in
/// registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimerKey {
    when: Instant,
    id: TimerId,
}

struct TimerSlot {
    callback: TimerCallback,
    args: Vec<Value>,
}

/// An expired timer, removed from the registry and ready to fire.
pub(crate) struct TimerEntry {
    pub(crate) id: TimerId,
    pub(crate) callback: TimerCallback,
    pub(crate) args: Vec<Value>,
}

/// Manages timer registration and expiration for the reactor.
///
/// Timers are stored in a `BTreeMap` ordered by `(deadline, id)`, which
/// gives O(log n) insertion, O(1) next-deadline lookup, and deterministic
/// firing order. A secondary id index supports cancellation by id alone.
pub struct TimerDriver {
    timers: BTreeMap<TimerKey, TimerSlot>,
    deadlines: AHashMap<TimerId, Instant>,
    sequence: u64,
}

impl TimerDriver {
    pub(crate) fn new() -> Self {
        Self {
            timers: BTreeMap::new(),
            deadlines: AHashMap::new(),
            sequence: 0,
        }
    }

    /// Registers a timer to fire `delay_ms` milliseconds after `now`.
    ///
    /// Returns the timer's id immediately; the callback is never invoked
    /// synchronously. A negative delay is rejected.
    pub(crate) fn register_timer(
        &mut self,
        now: Instant,
        delay_ms: i64,
        args: Vec<Value>,
        callback: TimerCallback,
    ) -> Result<TimerId, ScheduleError> {
        if delay_ms < 0 {
            return Err(ScheduleError::InvalidDelay(delay_ms));
        }

        let id = TimerId(self.sequence);
        self.sequence += 1;

        let when = now + Duration::from_millis(delay_ms as u64);
        self.timers.insert(TimerKey { when, id }, TimerSlot { callback, args });
        self.deadlines.insert(id, when);
        Ok(id)
    }

    /// Cancels a previously registered timer.
    ///
    /// Idempotent: cancelling an unknown or already-fired id is a no-op.
    pub(crate) fn deregister_timer(&mut self, id: TimerId) {
        if let Some(when) = self.deadlines.remove(&id) {
            self.timers.remove(&TimerKey { when, id });
        }
    }

    /// Returns the `Instant` when the next timer will expire, if any.
    ///
    /// `None` means the reactor may block indefinitely waiting for I/O.
    #[inline(always)]
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.timers.first_key_value().map(|(key, _)| key.when)
    }

    /// Removes every timer whose deadline is at or before `now` and appends
    /// it to `out` in ascending `(deadline, id)` order.
    ///
    /// The whole batch is collected before any callback runs, so a callback
    /// that re-schedules during its own firing can only land in a future
    /// loop iteration.
    pub(crate) fn pop_expired_into(&mut self, now: Instant, out: &mut Vec<TimerEntry>) {
        while let Some(entry) = self.timers.first_entry() {
            if entry.key().when > now {
                return;
            }
            let (key, slot) = entry.remove_entry();
            self.deadlines.remove(&key.id);
            out.push(TimerEntry {
                id: key.id,
                callback: slot.callback,
                args: slot.args,
            });
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.timers.len()
    }
}
