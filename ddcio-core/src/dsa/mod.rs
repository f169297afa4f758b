//! Dynamic sleep adjustment.
//!
//! A controller observes the outcome of every retry loop on a device and revises the sleep
//! multiplier the pacing engine applies to it. The current generation ([`ResultsTable`])
//! works on a discretised multiplier curve; the error-rate controller it replaced is kept as
//! [`LegacyState`] for comparison.

use std::fmt;

use ddcio_common::Status;

pub mod cache;
pub use cache::{CacheError, CachedRecord, StatsCache};

mod dsa2;
pub use dsa2::{next_retry_step, Invocation, ResultsTable};

mod legacy;
#[allow(deprecated)]
pub use legacy::LegacyState;

/// Sleep multipliers, in hundredths, indexed by step.
pub const STEPS: [u16; 11] = [0, 5, 10, 20, 30, 50, 70, 100, 130, 160, 200];

/// Highest valid step.
pub const STEP_LAST: usize = STEPS.len() - 1;

/// Converts a step to its multiplier. Steps past the end saturate.
#[inline]
pub fn step_to_multiplier(step: usize) -> f32 {
    STEPS[step.min(STEP_LAST)] as f32 / 100.0
}

/// The lowest step whose multiplier is at least `multiplier`.
pub fn multiplier_to_step(multiplier: f32) -> usize {
    let hundredths = (multiplier * 100.0).round() as i64;
    STEPS.iter().position(|s| *s as i64 >= hundredths).unwrap_or(STEP_LAST)
}

/// Which controller drives a device's multiplier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DsaGeneration {
    /// The multiplier stays at the operator value.
    Disabled,
    /// Error-rate controller.
    Legacy,
    /// Step controller with persistence.
    #[default]
    Dsa2,
}

impl DsaGeneration {
    /// Tag written to the stats cache.
    pub fn tag(self) -> u32 {
        match self {
            Self::Disabled => 0,
            Self::Legacy => 1,
            Self::Dsa2 => 2,
        }
    }
}

impl fmt::Display for DsaGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => f.write_str("disabled"),
            Self::Legacy => f.write_str("dsa1"),
            Self::Dsa2 => f.write_str("dsa2"),
        }
    }
}

/// Final outcome of one retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Exhausted,
    Fatal,
}

/// The notify points shared by every controller generation. Calls for one device are
/// serialised by the device store.
pub trait SleepController: fmt::Debug + Send {
    fn generation(&self) -> DsaGeneration;

    /// Called for every failed attempt with the number of attempts left in the loop.
    fn note_retryable_failure(&mut self, status: Status, remaining_tries: u16);

    /// Called once per retry loop. Returns `true` if the multiplier changed.
    fn record_final(
        &mut self,
        outcome: Outcome,
        attempts_used: u16,
        null_adjustment_occurred: bool,
    ) -> bool;

    /// The multiplier the pacing engine should apply right now.
    fn adjusted_sleep_multiplier(&self) -> f32;

    /// Forgets all history. `seed_multiplier` chooses the new starting point.
    fn reset(&mut self, seed_multiplier: Option<f32>);
}

/// Controller for a device with DSA disabled: a fixed multiplier.
#[derive(Debug, Clone, PartialEq)]
pub struct FixedMultiplier {
    multiplier: f32,
    initial: f32,
}

impl FixedMultiplier {
    pub fn new(multiplier: f32) -> Self {
        Self { multiplier, initial: multiplier }
    }
}

impl SleepController for FixedMultiplier {
    fn generation(&self) -> DsaGeneration {
        DsaGeneration::Disabled
    }

    fn note_retryable_failure(&mut self, _status: Status, _remaining_tries: u16) {}

    fn record_final(&mut self, _: Outcome, _: u16, _: bool) -> bool {
        false
    }

    fn adjusted_sleep_multiplier(&self) -> f32 {
        self.multiplier
    }

    fn reset(&mut self, seed_multiplier: Option<f32>) {
        self.multiplier = seed_multiplier.filter(|m| *m > 0.0).unwrap_or(self.initial);
    }
}

/// Per-device controller state, one variant per generation.
#[derive(Debug)]
#[allow(deprecated)]
pub enum DsaState {
    Disabled(FixedMultiplier),
    Legacy(LegacyState),
    Dsa2(ResultsTable),
}

#[allow(deprecated)]
impl DsaState {
    fn controller(&self) -> &dyn SleepController {
        match self {
            Self::Disabled(c) => c,
            Self::Legacy(c) => c,
            Self::Dsa2(c) => c,
        }
    }

    fn controller_mut(&mut self) -> &mut dyn SleepController {
        match self {
            Self::Disabled(c) => c,
            Self::Legacy(c) => c,
            Self::Dsa2(c) => c,
        }
    }

    pub fn as_results_table(&self) -> Option<&ResultsTable> {
        match self {
            Self::Dsa2(table) => Some(table),
            _ => None,
        }
    }

    pub fn as_results_table_mut(&mut self) -> Option<&mut ResultsTable> {
        match self {
            Self::Dsa2(table) => Some(table),
            _ => None,
        }
    }
}

impl SleepController for DsaState {
    fn generation(&self) -> DsaGeneration {
        self.controller().generation()
    }

    fn note_retryable_failure(&mut self, status: Status, remaining_tries: u16) {
        self.controller_mut().note_retryable_failure(status, remaining_tries)
    }

    fn record_final(&mut self, outcome: Outcome, attempts: u16, null_adjustment: bool) -> bool {
        self.controller_mut().record_final(outcome, attempts, null_adjustment)
    }

    fn adjusted_sleep_multiplier(&self) -> f32 {
        self.controller().adjusted_sleep_multiplier()
    }

    fn reset(&mut self, seed_multiplier: Option<f32>) {
        self.controller_mut().reset(seed_multiplier)
    }
}
