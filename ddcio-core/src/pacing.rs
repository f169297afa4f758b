use ddcio_common::{
    stats::{self, IoStats},
    time::{sleep_millis, DeferredSleep},
    IoMode, SleepEvent,
};
use tracing::trace;

use crate::{options::PacingOptions, store::DeviceEntry};

/// How long a particular sleep should be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SleepOverride {
    /// The configured default for the event.
    #[default]
    UseDefault,
    /// Skip the sleep.
    None,
    /// Use this many milliseconds instead of the default. Still scaled.
    Millis(u32),
}

/// Typed inter-operation sleeps.
///
/// The effective duration of a sleep is
/// `default(mode, event) * max(1, multiplier_ct) * adjusted_multiplier`, where the last two
/// factors come from the device entry.
#[derive(Debug, Clone)]
pub struct Pacer {
    opts: PacingOptions,
    stats: &'static IoStats,
}

impl Pacer {
    pub fn new(opts: PacingOptions) -> Self {
        Self { opts, stats: stats::global() }
    }

    /// Records sleep events into `stats` instead of the process-wide counters.
    pub fn with_stats(mut self, stats: &'static IoStats) -> Self {
        self.stats = stats;
        self
    }

    #[inline]
    pub fn options(&self) -> &PacingOptions {
        &self.opts
    }

    #[inline]
    pub(crate) fn stats(&self) -> &'static IoStats {
        self.stats
    }

    /// Computes the sleep in milliseconds, or `None` if it is skipped.
    pub fn effective_millis(
        &self,
        mode: IoMode,
        event: SleepEvent,
        multiplier_ct: u16,
        multiplier: f32,
        sleep: SleepOverride,
    ) -> Option<u32> {
        let base = match sleep {
            SleepOverride::UseDefault => self.opts.default_millis(mode, event),
            SleepOverride::None => return None,
            SleepOverride::Millis(ms) => ms,
        };
        let scaled = base as f32 * multiplier_ct.max(1) as f32 * multiplier.max(0.0);
        Some(scaled.round() as u32)
    }

    fn device_millis(
        &self,
        device: &DeviceEntry,
        mode: IoMode,
        event: SleepEvent,
        sleep: SleepOverride,
    ) -> Option<u32> {
        self.effective_millis(
            mode,
            event,
            device.multiplier_ct(),
            device.adjusted_multiplier(),
            sleep,
        )
    }

    /// Sleeps for `event` on `device`. With deferred sleep enabled, the sleep is registered
    /// in `pending` instead and waited out by the next [`DeferredSleep::commit`]; a sleep
    /// registered while another is pending is dropped. Returns the milliseconds requested.
    pub fn pause(
        &self,
        device: &DeviceEntry,
        mode: IoMode,
        event: SleepEvent,
        sleep: SleepOverride,
        pending: &mut DeferredSleep,
    ) -> u32 {
        if !self.opts.deferred_sleep {
            return self.sleep_now(device, mode, event, sleep);
        }

        let Some(millis) = self.device_millis(device, mode, event, sleep) else { return 0 };
        self.stats.record_sleep_event(event);
        if !pending.defer(millis) {
            trace!(busno = device.busno(), %event, millis, "coalesced into pending sleep");
        }
        millis
    }

    /// Sleeps immediately, ignoring the deferred sleep setting.
    pub fn sleep_now(
        &self,
        device: &DeviceEntry,
        mode: IoMode,
        event: SleepEvent,
        sleep: SleepOverride,
    ) -> u32 {
        let Some(millis) = self.device_millis(device, mode, event, sleep) else { return 0 };
        self.stats.record_sleep_event(event);
        trace!(busno = device.busno(), %event, millis, "sleeping");
        sleep_millis(millis);
        millis
    }
}
