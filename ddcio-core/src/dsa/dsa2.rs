use std::collections::VecDeque;

use ddcio_common::{unix_secs, Status};
use tracing::{debug, info};

use super::{step_to_multiplier, CachedRecord, DsaGeneration, Outcome, SleepController, STEP_LAST};
use crate::options::DsaOptions;

/// One final outcome kept in the recent-results ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Invocation {
    pub attempts: u16,
    pub exhausted: bool,
    /// Retry-loop step in effect when the loop ended.
    pub step: usize,
    pub epoch_secs: u64,
}

/// Step to use for the next attempt of a loop after a failure, given how many attempts
/// remain. Spreads the steps left above `prev_step` over the remaining attempts so the last
/// attempt runs at the highest step.
pub fn next_retry_step(prev_step: usize, remaining_tries: u16) -> usize {
    if remaining_tries == 0 {
        return prev_step;
    }

    let remaining_steps = STEP_LAST.saturating_sub(prev_step) as f32;
    let divisor = if remaining_tries > 1 { remaining_tries - 1 } else { remaining_tries };
    let mut adjustment = remaining_steps / divisor as f32;
    if adjustment > 0.75 && adjustment < 1.0 {
        adjustment = 1.0;
    }

    (prev_step + adjustment as usize).min(STEP_LAST)
}

/// DSA-2 per-device state.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultsTable {
    busno: u32,
    alpha: f32,
    greatest_upper_bound: f32,
    greatest_lower_bound: f32,
    average_upper_bound: f32,
    average_lower_bound: f32,
    hysteresis: f32,
    ring_capacity: usize,
    min_decrement_lookback: usize,
    adjustment_interval: u16,

    step_floor: usize,
    initial_step: usize,
    step_cur: usize,
    loop_step: usize,
    loop_null_ct: u16,
    bumped_this_loop: bool,
    remaining_interval: u16,

    ewma_attempts: f32,
    ewma_greatest: f32,
    recent: VecDeque<Invocation>,

    adjustments_up: u32,
    adjustments_down: u32,
    successful_loops: u32,
    retryable_failures: u32,
    highest_failed_loop_step: usize,
    reset_ct: u32,

    from_cache: bool,
    edid_check_byte: Option<u8>,
    timestamp: u64,
    dirty: bool,
}

impl ResultsTable {
    pub fn new(busno: u32, opts: &DsaOptions, initial_step: usize) -> Self {
        let step_floor = opts.step_floor.min(STEP_LAST);
        let initial_step = initial_step.clamp(step_floor, STEP_LAST);
        Self {
            busno,
            alpha: opts.alpha,
            greatest_upper_bound: opts.greatest_upper_bound,
            greatest_lower_bound: opts.greatest_lower_bound,
            average_upper_bound: opts.average_upper_bound,
            average_lower_bound: opts.average_lower_bound,
            hysteresis: opts.hysteresis,
            ring_capacity: opts.ring_capacity.max(1),
            min_decrement_lookback: opts.min_decrement_lookback,
            adjustment_interval: opts.adjustment_interval.max(1),
            step_floor,
            initial_step,
            step_cur: initial_step,
            loop_step: initial_step,
            loop_null_ct: 0,
            bumped_this_loop: false,
            remaining_interval: opts.adjustment_interval.max(1),
            ewma_attempts: 1.0,
            ewma_greatest: 1.0,
            recent: VecDeque::with_capacity(opts.ring_capacity),
            adjustments_up: 0,
            adjustments_down: 0,
            successful_loops: 0,
            retryable_failures: 0,
            highest_failed_loop_step: 0,
            reset_ct: 0,
            from_cache: false,
            edid_check_byte: None,
            timestamp: unix_secs(),
            dirty: false,
        }
    }

    /// Rebuilds a table from a cache record. The recent-results ring starts empty.
    pub fn from_cached(opts: &DsaOptions, record: &CachedRecord) -> Self {
        let mut table = Self::new(record.busno, opts, record.step);
        table.ewma_attempts = record.ewma_attempts;
        table.ewma_greatest = record.ewma_greatest;
        table.timestamp = record.timestamp;
        table.edid_check_byte = record.edid_check_byte;
        table.from_cache = true;
        table
    }

    /// The persistent part of this table.
    pub fn to_cached(&self) -> CachedRecord {
        CachedRecord {
            busno: self.busno,
            step: self.step_cur,
            ewma_attempts: self.ewma_attempts,
            ewma_greatest: self.ewma_greatest,
            timestamp: self.timestamp,
            edid_check_byte: self.edid_check_byte,
        }
    }

    #[inline]
    pub fn busno(&self) -> u32 {
        self.busno
    }

    /// The published step.
    #[inline]
    pub fn step(&self) -> usize {
        self.step_cur
    }

    /// The step the current retry loop is running at.
    #[inline]
    pub fn loop_step(&self) -> usize {
        self.loop_step
    }

    #[inline]
    pub fn initial_step(&self) -> usize {
        self.initial_step
    }

    #[inline]
    pub fn step_floor(&self) -> usize {
        self.step_floor
    }

    pub fn set_step_floor(&mut self, floor: usize) {
        self.step_floor = floor.min(STEP_LAST);
        if self.step_cur < self.step_floor {
            self.step_cur = self.step_floor;
            self.loop_step = self.loop_step.max(self.step_cur);
            self.dirty = true;
        }
    }

    #[inline]
    pub fn ewma_attempts(&self) -> f32 {
        self.ewma_attempts
    }

    #[inline]
    pub fn ewma_greatest(&self) -> f32 {
        self.ewma_greatest
    }

    pub fn recent(&self) -> impl Iterator<Item = &Invocation> {
        self.recent.iter()
    }

    #[inline]
    pub fn adjustments(&self) -> (u32, u32) {
        (self.adjustments_up, self.adjustments_down)
    }

    #[inline]
    pub fn successful_loops(&self) -> u32 {
        self.successful_loops
    }

    #[inline]
    pub fn retryable_failures(&self) -> u32 {
        self.retryable_failures
    }

    /// Highest loop step at which a whole retry loop failed.
    #[inline]
    pub fn highest_failed_loop_step(&self) -> usize {
        self.highest_failed_loop_step
    }

    #[inline]
    pub fn is_from_cache(&self) -> bool {
        self.from_cache
    }

    #[inline]
    pub fn edid_check_byte(&self) -> Option<u8> {
        self.edid_check_byte
    }

    pub fn set_edid_check_byte(&mut self, byte: Option<u8>) {
        self.edid_check_byte = byte;
    }

    /// Whether the table changed since it was loaded or last marked clean.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    fn greatest_recent(&self) -> u16 {
        self.recent.iter().map(|i| i.attempts).max().unwrap_or(1)
    }

    fn too_many_errors(&self) -> bool {
        self.ewma_greatest > self.greatest_upper_bound ||
            self.ewma_attempts > self.average_upper_bound
    }

    fn too_few_errors(&self) -> bool {
        self.recent.len() >= self.min_decrement_lookback &&
            self.ewma_greatest < self.greatest_lower_bound - self.hysteresis &&
            self.ewma_attempts < self.average_lower_bound - self.hysteresis &&
            !self.recent.iter().any(|i| i.exhausted)
    }

    fn end_loop(&mut self) {
        self.loop_step = self.step_cur;
        self.loop_null_ct = 0;
        self.bumped_this_loop = false;
    }
}

impl SleepController for ResultsTable {
    fn generation(&self) -> DsaGeneration {
        DsaGeneration::Dsa2
    }

    fn note_retryable_failure(&mut self, status: Status, remaining_tries: u16) {
        self.retryable_failures += 1;
        if status == Status::NullResponse {
            self.loop_null_ct += 1;
        }

        let prev = self.loop_step;
        self.loop_step = next_retry_step(prev, remaining_tries);

        if remaining_tries == 0 && !self.bumped_this_loop && self.step_cur < STEP_LAST {
            self.step_cur += 1;
            self.adjustments_up += 1;
            self.bumped_this_loop = true;
            self.dirty = true;
            self.loop_step = self.loop_step.max(self.step_cur);
            info!(busno = self.busno, step = self.step_cur, "retries exhausted, stepping up");
        }

        debug!(busno = self.busno, %status, remaining_tries, prev, next = self.loop_step, "retry loop step");
    }

    fn record_final(
        &mut self,
        outcome: Outcome,
        attempts_used: u16,
        null_adjustment_occurred: bool,
    ) -> bool {
        // Steps already taken during this loop count against the one-step limit.
        let before = if self.bumped_this_loop { self.step_cur - 1 } else { self.step_cur };

        if outcome == Outcome::Fatal {
            self.end_loop();
            return self.step_cur != before;
        }

        let exhausted = outcome == Outcome::Exhausted;
        if exhausted {
            self.highest_failed_loop_step = self.highest_failed_loop_step.max(self.loop_step);
        } else {
            self.successful_loops += 1;
        }

        if self.recent.len() == self.ring_capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(Invocation {
            attempts: attempts_used,
            exhausted,
            step: self.loop_step,
            epoch_secs: unix_secs(),
        });

        let alpha = self.alpha;
        self.ewma_attempts = alpha * attempts_used as f32 + (1.0 - alpha) * self.ewma_attempts;
        self.ewma_greatest =
            alpha * self.greatest_recent() as f32 + (1.0 - alpha) * self.ewma_greatest;

        let null_bump = !exhausted && null_adjustment_occurred && self.loop_null_ct > 0;

        let target = if self.too_many_errors() || null_bump {
            self.remaining_interval = self.adjustment_interval;
            (before + 1).min(STEP_LAST)
        } else if !exhausted {
            self.remaining_interval = self.remaining_interval.saturating_sub(1);
            if self.remaining_interval == 0 {
                self.remaining_interval = self.adjustment_interval;
                if self.too_few_errors() {
                    before.saturating_sub(1).max(self.step_floor)
                } else {
                    before
                }
            } else {
                before
            }
        } else {
            before.max(self.step_cur)
        };

        let target = target.clamp(self.step_floor, STEP_LAST);
        if target > self.step_cur {
            self.adjustments_up += 1;
        } else if target < self.step_cur {
            self.adjustments_down += 1;
        }
        self.step_cur = target;

        let changed = self.step_cur != before;
        if changed {
            self.dirty = true;
            self.timestamp = unix_secs();
            info!(
                busno = self.busno,
                from = before,
                to = self.step_cur,
                ewma_attempts = self.ewma_attempts,
                ewma_greatest = self.ewma_greatest,
                "sleep multiplier step adjusted"
            );
        }

        self.end_loop();
        changed
    }

    fn adjusted_sleep_multiplier(&self) -> f32 {
        step_to_multiplier(self.loop_step)
    }

    fn reset(&mut self, seed_multiplier: Option<f32>) {
        let step = seed_multiplier
            .filter(|m| *m > 0.0)
            .map(super::multiplier_to_step)
            .unwrap_or(self.initial_step)
            .clamp(self.step_floor, STEP_LAST);

        self.initial_step = step;
        self.step_cur = step;
        self.ewma_attempts = 1.0;
        self.ewma_greatest = 1.0;
        self.recent.clear();
        self.remaining_interval = self.adjustment_interval;
        self.adjustments_up = 0;
        self.adjustments_down = 0;
        self.successful_loops = 0;
        self.retryable_failures = 0;
        self.highest_failed_loop_step = 0;
        self.reset_ct += 1;
        self.from_cache = false;
        self.timestamp = unix_secs();
        self.dirty = true;
        self.end_loop();
    }
}
