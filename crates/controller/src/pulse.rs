//! Interrupt-driven flow pulse counter (C1).
//!
//! `increment()` is meant to be called from an interrupt-like context: it
//! does a debounce check against an atomic timestamp and, if accepted, a
//! single atomic increment. It never takes the system mutex. A worker that
//! wants to know about pulse progress polls `notify_if_due`, which applies
//! the §4.1 throttling rule (10 pulses or 500 ms, whichever first).

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::time::Instant;

pub const DEFAULT_DEBOUNCE_MS: u64 = 2;
const NOTIFY_PULSE_DELTA: u32 = 10;
const NOTIFY_INTERVAL_MS: u64 = 500;

/// Saturating at `u32::MAX - 1`; one more pulse past that is out-of-range
/// and the caller (flow monitor) is expected to force a fault rather than
/// wrap the counter back to zero.
pub struct PulseCounter {
    count: AtomicU32,
    last_pulse_millis: AtomicI64,
    last_notified_count: AtomicU32,
    last_notify_millis: AtomicI64,
    debounce_ms: u64,
    epoch: Instant,
}

impl PulseCounter {
    pub fn new(debounce_ms: u64) -> Self {
        Self {
            count: AtomicU32::new(0),
            last_pulse_millis: AtomicI64::new(i64::MIN),
            last_notified_count: AtomicU32::new(0),
            last_notify_millis: AtomicI64::new(0),
            debounce_ms,
            epoch: Instant::now(),
        }
    }

    fn now_millis(&self) -> i64 {
        self.epoch.elapsed().as_millis() as i64
    }

    /// Called from interrupt context. Returns `true` if the pulse was
    /// accepted (i.e. not suppressed by the debounce window). A counter
    /// already at `u32::MAX` is left saturated rather than wrapped;
    /// `is_saturated()` is polled by the flow monitor each tick, which
    /// owns the policy decision to force a fault.
    pub fn increment(&self) -> bool {
        let now = self.now_millis();
        let last = self.last_pulse_millis.load(Ordering::Relaxed);
        if last != i64::MIN && now.saturating_sub(last) < self.debounce_ms as i64 {
            return false;
        }
        self.last_pulse_millis.store(now, Ordering::Relaxed);
        self.count.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| {
            Some(c.saturating_add(1))
        }).ok();
        true
    }

    pub fn get(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
        self.last_notified_count.store(0, Ordering::Relaxed);
    }

    pub fn is_saturated(&self) -> bool {
        self.count.load(Ordering::Relaxed) == u32::MAX
    }

    #[cfg(test)]
    pub(crate) fn force_saturated_for_test(&self) {
        self.count.store(u32::MAX, Ordering::Relaxed);
    }

    /// Returns `Some(current_count)` when a subscriber notification is due
    /// per the throttling rule, and advances the notification bookkeeping
    /// as a side effect.
    pub fn notify_if_due(&self) -> Option<u32> {
        let count = self.get();
        let last_notified = self.last_notified_count.load(Ordering::Relaxed);
        let now = self.now_millis();
        let last_notify = self.last_notify_millis.load(Ordering::Relaxed);

        let delta_due = count.saturating_sub(last_notified) >= NOTIFY_PULSE_DELTA;
        let time_due = now.saturating_sub(last_notify) >= NOTIFY_INTERVAL_MS as i64;

        if delta_due || time_due {
            self.last_notified_count.store(count, Ordering::Relaxed);
            self.last_notify_millis.store(now, Ordering::Relaxed);
            Some(count)
        } else {
            None
        }
    }
}

impl Default for PulseCounter {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE_MS)
    }
}

pub fn ml_delivered(pulses: u32, pulses_per_liter: u32) -> f64 {
    if pulses_per_liter == 0 {
        return 0.0;
    }
    (pulses as f64 / pulses_per_liter as f64) * 1000.0
}

pub fn target_pulses(liters: u32, pulses_per_liter: u32) -> u32 {
    ((liters as f64 * pulses_per_liter as f64).ceil()) as u32
}

// ===========================================================================
// Tests
// ===========================================================================
