//! Read-only snapshots for the reporting layer.

use ddcio_common::{
    stats::{self, IoStats, StatsSnapshot},
    time::sleep_stats,
    OperationClass,
};

use crate::{
    dsa::DsaGeneration,
    store::{DeviceEntry, DeviceStore, MaxtriesRange, TryHistogram},
};

/// DSA-2 state of one device.
#[derive(Debug, Clone, PartialEq)]
pub struct Dsa2Report {
    pub step: usize,
    pub initial_step: usize,
    pub step_floor: usize,
    pub ewma_attempts: f32,
    pub ewma_greatest: f32,
    pub adjustments_up: u32,
    pub adjustments_down: u32,
    pub successful_loops: u32,
    pub retryable_failures: u32,
    pub highest_failed_loop_step: usize,
    pub from_cache: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceReport {
    pub busno: u32,
    pub description: String,
    pub defined: bool,
    pub maxtries: [MaxtriesRange; OperationClass::COUNT],
    pub try_stats: [TryHistogram; OperationClass::COUNT],
    pub static_multiplier: f32,
    pub multiplier_ct: u16,
    pub adjusted_multiplier: f32,
    pub initial_multiplier: f32,
    pub final_successful_multiplier: Option<f32>,
    pub generation: DsaGeneration,
    pub dsa2: Option<Dsa2Report>,
}

impl DeviceReport {
    pub fn capture(entry: &DeviceEntry) -> Self {
        let dsa2 = entry.inspect_dsa(|state| {
            state.as_results_table().map(|t| {
                let (adjustments_up, adjustments_down) = t.adjustments();
                Dsa2Report {
                    step: t.step(),
                    initial_step: t.initial_step(),
                    step_floor: t.step_floor(),
                    ewma_attempts: t.ewma_attempts(),
                    ewma_greatest: t.ewma_greatest(),
                    adjustments_up,
                    adjustments_down,
                    successful_loops: t.successful_loops(),
                    retryable_failures: t.retryable_failures(),
                    highest_failed_loop_step: t.highest_failed_loop_step(),
                    from_cache: t.is_from_cache(),
                }
            })
        });

        Self {
            busno: entry.busno(),
            description: entry.description(),
            defined: entry.is_defined(),
            maxtries: OperationClass::ALL.map(|c| entry.maxtries_range(c)),
            try_stats: OperationClass::ALL.map(|c| entry.try_stats(c)),
            static_multiplier: entry.static_multiplier(),
            multiplier_ct: entry.multiplier_ct(),
            adjusted_multiplier: entry.adjusted_multiplier(),
            initial_multiplier: entry.initial_multiplier(),
            final_successful_multiplier: entry.final_successful_multiplier(),
            generation: entry.dsa_generation(),
            dsa2,
        }
    }

    /// Retry loops run on this device, over every class.
    pub fn total_tries(&self) -> u32 {
        self.try_stats.iter().map(TryHistogram::total).sum()
    }
}

/// Process-wide sleep primitive totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SleepTotals {
    pub calls: u64,
    pub requested_millis: u64,
    pub actual_nanos: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoreReport {
    pub stats: StatsSnapshot,
    pub sleep: SleepTotals,
    /// In ascending bus order.
    pub devices: Vec<DeviceReport>,
}

/// Captures every device in ascending bus order.
pub fn device_reports(store: &DeviceStore) -> Vec<DeviceReport> {
    let mut reports = Vec::with_capacity(store.len());
    store.apply_all_sorted(|entry| reports.push(DeviceReport::capture(entry)));
    reports
}

/// Captures the process-wide counters and every device.
pub fn snapshot(store: &DeviceStore) -> CoreReport {
    snapshot_with(store, stats::global())
}

pub fn snapshot_with(store: &DeviceStore, stats: &IoStats) -> CoreReport {
    let sleep = sleep_stats();
    CoreReport {
        stats: stats.snapshot(),
        sleep: SleepTotals {
            calls: sleep.calls(),
            requested_millis: sleep.requested_millis(),
            actual_nanos: sleep.actual_nanos(),
        },
        devices: device_reports(store),
    }
}
