//! Process-wide I/O, sleep and call counters.
//!
//! All counters are monotone atomics with relaxed ordering. Readers take a weakly consistent
//! [`StatsSnapshot`].

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        OnceLock,
    },
};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::{OperationClass, Status};

static GLOBAL: OnceLock<IoStats> = OnceLock::new();

/// The process-wide statistics instance.
pub fn global() -> &'static IoStats {
    GLOBAL.get_or_init(IoStats::default)
}

/// Kind of I/O primitive invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoEvent {
    Write,
    Read,
    WriteRead,
    Open,
    Close,
    Other,
}

impl IoEvent {
    pub const COUNT: usize = 6;

    pub const ALL: [Self; Self::COUNT] =
        [Self::Write, Self::Read, Self::WriteRead, Self::Open, Self::Close, Self::Other];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Kind of pacing sleep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SleepEvent {
    PostOpen,
    PostWrite,
    WriteToRead,
    PostRead,
    PostSaveSettings,
    NullResponse,
}

impl SleepEvent {
    pub const COUNT: usize = 6;

    pub const ALL: [Self; Self::COUNT] = [
        Self::PostOpen,
        Self::PostWrite,
        Self::WriteToRead,
        Self::PostRead,
        Self::PostSaveSettings,
        Self::NullResponse,
    ];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for SleepEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Number of calls and cumulative elapsed time for one category.
#[derive(Debug, Default)]
pub struct CallStat {
    calls: AtomicU64,
    nanos: AtomicU64,
}

impl CallStat {
    #[inline]
    pub fn record(&self, nanos: u64) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    #[inline]
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn nanos(&self) -> u64 {
        self.nanos.load(Ordering::Relaxed)
    }

    fn reset(&self) {
        self.calls.store(0, Ordering::Relaxed);
        self.nanos.store(0, Ordering::Relaxed);
    }
}

/// Aggregate I/O statistics.
#[derive(Debug, Default)]
pub struct IoStats {
    total_io_events: AtomicU64,
    total_io_errors: AtomicU64,
    total_sleep_events: AtomicU64,
    io_events: [CallStat; IoEvent::COUNT],
    sleep_events: [AtomicU64; SleepEvent::COUNT],
    calls: [CallStat; OperationClass::COUNT],
    status_counts: Mutex<FxHashMap<Status, u64>>,
}

impl IoStats {
    /// Records one I/O primitive invocation and its outcome.
    pub fn record_io_event(&self, event: IoEvent, nanos: u64, result: Result<(), Status>) {
        self.total_io_events.fetch_add(1, Ordering::Relaxed);
        self.io_events[event.index()].record(nanos);
        if let Err(status) = result {
            self.total_io_errors.fetch_add(1, Ordering::Relaxed);
            self.record_status(status);
        }
    }

    /// Records a compound exchange such as [`IoEvent::WriteRead`]. Only its call stat moves;
    /// the primitives it is made of count the events and statuses.
    #[inline]
    pub fn record_exchange(&self, event: IoEvent, nanos: u64) {
        self.io_events[event.index()].record(nanos);
    }

    #[inline]
    pub fn record_sleep_event(&self, event: SleepEvent) {
        self.total_sleep_events.fetch_add(1, Ordering::Relaxed);
        self.sleep_events[event.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one occurrence of a non-Ok status.
    pub fn record_status(&self, status: Status) {
        *self.status_counts.lock().entry(status).or_default() += 1;
    }

    #[inline]
    pub fn record_call(&self, class: OperationClass, nanos: u64) {
        self.calls[class.index()].record(nanos);
    }

    #[inline]
    pub fn total_io_events(&self) -> u64 {
        self.total_io_events.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn total_io_errors(&self) -> u64 {
        self.total_io_errors.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn total_sleep_events(&self) -> u64 {
        self.total_sleep_events.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn io_event(&self, event: IoEvent) -> &CallStat {
        &self.io_events[event.index()]
    }

    #[inline]
    pub fn sleep_event_count(&self, event: SleepEvent) -> u64 {
        self.sleep_events[event.index()].load(Ordering::Relaxed)
    }

    #[inline]
    pub fn call(&self, class: OperationClass) -> &CallStat {
        &self.calls[class.index()]
    }

    pub fn status_count(&self, status: Status) -> u64 {
        self.status_counts.lock().get(&status).copied().unwrap_or(0)
    }

    /// Takes a weakly consistent copy of every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        let mut status_counts: Vec<_> =
            self.status_counts.lock().iter().map(|(s, n)| (*s, *n)).collect();
        status_counts.sort_by_key(|(s, _)| std::cmp::Reverse(s.code()));

        StatsSnapshot {
            total_io_events: self.total_io_events(),
            total_io_errors: self.total_io_errors(),
            total_sleep_events: self.total_sleep_events(),
            io_events: IoEvent::ALL.map(|e| {
                let stat = self.io_event(e);
                (e, stat.calls(), stat.nanos())
            }),
            sleep_events: SleepEvent::ALL.map(|e| (e, self.sleep_event_count(e))),
            calls: OperationClass::ALL.map(|c| {
                let stat = self.call(c);
                (c, stat.calls(), stat.nanos())
            }),
            status_counts,
        }
    }

    pub fn reset(&self) {
        self.total_io_events.store(0, Ordering::Relaxed);
        self.total_io_errors.store(0, Ordering::Relaxed);
        self.total_sleep_events.store(0, Ordering::Relaxed);
        self.io_events.iter().for_each(CallStat::reset);
        self.sleep_events.iter().for_each(|c| c.store(0, Ordering::Relaxed));
        self.calls.iter().for_each(CallStat::reset);
        self.status_counts.lock().clear();
    }
}

/// Copy of [`IoStats`] handed to the reporting layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub total_io_events: u64,
    pub total_io_errors: u64,
    pub total_sleep_events: u64,
    /// `(event, calls, nanos)`
    pub io_events: [(IoEvent, u64, u64); IoEvent::COUNT],
    pub sleep_events: [(SleepEvent, u64); SleepEvent::COUNT],
    /// `(class, calls, nanos)`
    pub calls: [(OperationClass, u64, u64); OperationClass::COUNT],
    /// Occurrences per status, most negative code last.
    pub status_counts: Vec<(Status, u64)>,
}
