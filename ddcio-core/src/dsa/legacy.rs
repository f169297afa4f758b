#![allow(deprecated)]

use ddcio_common::Status;
use tracing::debug;

use super::{DsaGeneration, Outcome, SleepController};

const REQUIRED_SAMPLE_SIZE: u32 = 3;
const MAX_ADJUSTMENT: f32 = 4.0;
const CHECK_INTERVAL: u32 = 2;

/// Error-rate threshold for a sample of `n` outcomes. Small samples need a higher rate.
fn error_rate_threshold(n: u32) -> f32 {
    match n {
        0..=4 => 0.5,
        5..=10 => 0.3,
        _ => 0.1,
    }
}

/// How much to scale the multiplier by, given its current value.
fn readjustment_factor(multiplier: f32) -> f32 {
    match multiplier {
        m if m <= 0.2 => 4.0,
        m if m <= 0.6 => 3.0,
        m if m <= 1.0 => 2.0,
        m if m <= 3.0 => 1.5,
        _ => 1.2,
    }
}

/// First generation controller: raises the multiplier whenever the recent error rate is
/// high. It never lowers it.
#[deprecated(note = "superseded by ResultsTable")]
#[derive(Debug, Clone, PartialEq)]
pub struct LegacyState {
    base: f32,
    multiplier: f32,
    ok_ct: u32,
    error_ct: u32,
    calls_since_check: u32,
    total_ok: u32,
    total_errors: u32,
    total_other: u32,
    total_checks: u32,
    total_adjustments: u32,
}

impl LegacyState {
    pub fn new(multiplier: f32) -> Self {
        Self {
            base: multiplier,
            multiplier,
            ok_ct: 0,
            error_ct: 0,
            calls_since_check: 0,
            total_ok: 0,
            total_errors: 0,
            total_other: 0,
            total_checks: 0,
            total_adjustments: 0,
        }
    }

    /// `(ok, errors, other)` outcome totals.
    pub fn totals(&self) -> (u32, u32, u32) {
        (self.total_ok, self.total_errors, self.total_other)
    }

    /// `(checks, adjustments)`
    pub fn adjustment_totals(&self) -> (u32, u32) {
        (self.total_checks, self.total_adjustments)
    }

    fn error_rate_is_high(&self) -> bool {
        let n = self.ok_ct + self.error_ct;
        n >= REQUIRED_SAMPLE_SIZE && self.error_ct as f32 / n as f32 > error_rate_threshold(n)
    }

    fn note_error(&mut self) -> bool {
        self.error_ct += 1;
        self.total_errors += 1;

        if self.calls_since_check <= CHECK_INTERVAL {
            self.calls_since_check += 1;
            return false;
        }

        self.calls_since_check = 0;
        self.total_checks += 1;

        if !self.error_rate_is_high() {
            return false;
        }

        let previous = self.multiplier;
        self.multiplier = (previous * readjustment_factor(previous)).min(MAX_ADJUSTMENT);
        self.ok_ct = 0;
        self.error_ct = 0;
        self.total_adjustments += 1;
        debug!(previous, multiplier = self.multiplier, "legacy controller raised multiplier");

        self.multiplier != previous
    }
}

impl SleepController for LegacyState {
    fn generation(&self) -> DsaGeneration {
        DsaGeneration::Legacy
    }

    fn note_retryable_failure(&mut self, _status: Status, _remaining_tries: u16) {
        self.note_error();
    }

    fn record_final(&mut self, outcome: Outcome, _attempts: u16, _null_adjustment: bool) -> bool {
        match outcome {
            Outcome::Succeeded => {
                self.ok_ct += 1;
                self.total_ok += 1;
                false
            }
            Outcome::Exhausted | Outcome::Fatal => {
                self.total_other += 1;
                false
            }
        }
    }

    fn adjusted_sleep_multiplier(&self) -> f32 {
        self.multiplier
    }

    fn reset(&mut self, seed_multiplier: Option<f32>) {
        *self = Self::new(seed_multiplier.filter(|m| *m > 0.0).unwrap_or(self.base));
    }
}
