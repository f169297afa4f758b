//! Monotonic clock and the millisecond sleep primitive.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

static ANCHOR: OnceLock<Instant> = OnceLock::new();

static SLEEP_STATS: SleepStats = SleepStats::new();

/// Nanoseconds elapsed on the monotonic clock since the first call in this process.
#[inline]
pub fn monotonic_nanos() -> u64 {
    ANCHOR.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// Monotonic milliseconds, see [`monotonic_nanos`].
#[inline]
pub fn monotonic_millis() -> u64 {
    monotonic_nanos() / 1_000_000
}

/// Sleeps for `millis` milliseconds and records the call in the process-wide sleep
/// statistics.
pub fn sleep_millis(millis: u32) {
    let start = monotonic_nanos();
    if millis > 0 {
        thread::sleep(Duration::from_millis(millis as u64));
    }
    SLEEP_STATS.record(millis, monotonic_nanos().saturating_sub(start));
}

/// Process-wide sleep statistics.
pub fn sleep_stats() -> &'static SleepStats {
    &SLEEP_STATS
}

/// Accumulated sleep calls, requested milliseconds and actual nanoseconds slept.
#[derive(Debug, Default)]
pub struct SleepStats {
    calls: AtomicU64,
    requested_millis: AtomicU64,
    actual_nanos: AtomicU64,
}

impl SleepStats {
    const fn new() -> Self {
        Self {
            calls: AtomicU64::new(0),
            requested_millis: AtomicU64::new(0),
            actual_nanos: AtomicU64::new(0),
        }
    }

    #[inline]
    fn record(&self, requested: u32, actual_nanos: u64) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.requested_millis.fetch_add(requested as u64, Ordering::Relaxed);
        self.actual_nanos.fetch_add(actual_nanos, Ordering::Relaxed);
    }

    #[inline]
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn requested_millis(&self) -> u64 {
        self.requested_millis.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn actual_nanos(&self) -> u64 {
        self.actual_nanos.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.calls.store(0, Ordering::Relaxed);
        self.requested_millis.store(0, Ordering::Relaxed);
        self.actual_nanos.store(0, Ordering::Relaxed);
    }
}

/// A pending sleep that is only waited out right before the next I/O event.
///
/// The first sleep requested after an I/O event registers a deadline; later requests are
/// dropped until [`DeferredSleep::commit`] runs.
#[derive(Debug, Default)]
pub struct DeferredSleep {
    deadline: Option<u64>,
    requested: u32,
}

impl DeferredSleep {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a sleep of `millis`. Returns `false` if a sleep was already pending, in
    /// which case this one is dropped.
    pub fn defer(&mut self, millis: u32) -> bool {
        if self.deadline.is_some() {
            return false;
        }

        self.deadline = Some(monotonic_nanos() + millis as u64 * 1_000_000);
        self.requested = millis;
        true
    }

    #[inline]
    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    /// Waits out whatever remains of the pending sleep, if any.
    pub fn commit(&mut self) {
        let Some(deadline) = self.deadline.take() else { return };

        let start = monotonic_nanos();
        if deadline > start {
            thread::sleep(Duration::from_nanos(deadline - start));
        }
        SLEEP_STATS.record(self.requested, monotonic_nanos().saturating_sub(start));
        self.requested = 0;
    }
}
