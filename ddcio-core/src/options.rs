use std::{path::PathBuf, time::Duration};

use ddcio_common::{
    constants::{
        MaxMaxTries, DDC_TIMEOUT_MILLIS_DEFAULT, DDC_TIMEOUT_MILLIS_NULL_RESPONSE_INCREMENT,
        DDC_TIMEOUT_MILLIS_POST_SETVCP_WRITE, DDC_TIMEOUT_POST_SAVE_SETTINGS,
    },
    IoMode, OperationClass, SleepEvent,
};
use ddcio_transport::{IoStrategy, LockOptions};
use thiserror::Error;

use crate::dsa::{multiplier_to_step, DsaGeneration, STEP_LAST};

#[derive(Debug, Error, PartialEq)]
pub enum OptionsError {
    #[error("sleep multiplier must not be 0")]
    ZeroMultiplier,
    #[error("maxtries {0} out of range 1..={max}", max = MaxMaxTries)]
    Maxtries(u16),
    #[error("step {0} out of range 0..={max}", max = STEP_LAST)]
    Step(usize),
    #[error("EWMA alpha {0} out of range (0, 1]")]
    Alpha(f32),
    #[error("ring capacity must be at least 1")]
    RingCapacity,
}

/// Interprets an operator supplied sleep multiplier: negative means "use the default of 1.0",
/// zero is rejected.
pub fn validate_multiplier(multiplier: f32) -> Result<f32, OptionsError> {
    if multiplier == 0.0 {
        Err(OptionsError::ZeroMultiplier)
    } else if multiplier < 0.0 || !multiplier.is_finite() {
        Ok(1.0)
    } else {
        Ok(multiplier)
    }
}

#[derive(Debug, Clone)]
pub struct RetryOptions {
    /// Initial maxtries per [`OperationClass`].
    pub maxtries: [u16; OperationClass::COUNT],
    /// Treat a DDC null response as "feature unsupported" rather than a transient failure.
    pub null_msg_means_unsupported: bool,
    /// Grow the per-device multiplier count on every retryable failure.
    pub amplify_on_failure: bool,
    /// Upper bound for the multiplier count.
    pub max_multiplier_ct: u16,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            maxtries: OperationClass::ALL.map(OperationClass::default_maxtries),
            null_msg_means_unsupported: false,
            amplify_on_failure: false,
            max_multiplier_ct: 10,
        }
    }
}

impl RetryOptions {
    pub fn with_maxtries(mut self, class: OperationClass, maxtries: u16) -> Self {
        self.maxtries[class.index()] = maxtries;
        self
    }

    pub fn with_null_msg_means_unsupported(mut self, yes: bool) -> Self {
        self.null_msg_means_unsupported = yes;
        self
    }

    pub fn with_amplify_on_failure(mut self, yes: bool) -> Self {
        self.amplify_on_failure = yes;
        self
    }

    pub fn validate(&self) -> Result<(), OptionsError> {
        match self.maxtries.iter().find(|n| !(1..=MaxMaxTries).contains(*n)) {
            Some(n) => Err(OptionsError::Maxtries(*n)),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PacingOptions {
    /// Default milliseconds per (mode, event).
    pub table: [[u32; SleepEvent::COUNT]; 2],
    /// Coalesce consecutive sleeps without intervening I/O.
    pub deferred_sleep: bool,
    /// Operator supplied multiplier. Seeds the DSA initial step, or is applied directly when
    /// DSA is disabled.
    pub sleep_multiplier: f32,
}

impl Default for PacingOptions {
    fn default() -> Self {
        let mut row = [DDC_TIMEOUT_MILLIS_DEFAULT; SleepEvent::COUNT];
        row[SleepEvent::PostWrite.index()] = DDC_TIMEOUT_MILLIS_POST_SETVCP_WRITE;
        row[SleepEvent::PostSaveSettings.index()] = DDC_TIMEOUT_POST_SAVE_SETTINGS;
        row[SleepEvent::NullResponse.index()] = DDC_TIMEOUT_MILLIS_NULL_RESPONSE_INCREMENT;

        Self { table: [row; 2], deferred_sleep: false, sleep_multiplier: 1.0 }
    }
}

impl PacingOptions {
    pub fn with_deferred_sleep(mut self, yes: bool) -> Self {
        self.deferred_sleep = yes;
        self
    }

    /// Sets the operator multiplier. See [`validate_multiplier`].
    pub fn with_sleep_multiplier(mut self, multiplier: f32) -> Result<Self, OptionsError> {
        self.sleep_multiplier = validate_multiplier(multiplier)?;
        Ok(self)
    }

    pub fn with_default_millis(mut self, mode: IoMode, event: SleepEvent, millis: u32) -> Self {
        self.table[mode.index()][event.index()] = millis;
        self
    }

    #[inline]
    pub fn default_millis(&self, mode: IoMode, event: SleepEvent) -> u32 {
        self.table[mode.index()][event.index()]
    }
}

#[derive(Debug, Clone)]
pub struct DsaOptions {
    pub generation: DsaGeneration,
    /// Weight of the newest observation in both EWMAs.
    pub alpha: f32,
    pub greatest_upper_bound: f32,
    pub greatest_lower_bound: f32,
    pub average_upper_bound: f32,
    pub average_lower_bound: f32,
    /// Margin below the lower bounds required before stepping down.
    pub hysteresis: f32,
    /// Number of recent final outcomes kept per device.
    pub ring_capacity: usize,
    /// Minimum number of recent outcomes before a step down is considered.
    pub min_decrement_lookback: usize,
    /// Successful calls between step down checks.
    pub adjustment_interval: u16,
    /// Step used for new devices. `None` derives it from the operator multiplier.
    pub initial_step: Option<usize>,
    pub step_floor: usize,
    /// Overrides the cache file location.
    pub cache_path: Option<PathBuf>,
    /// Restore on startup and save on shutdown.
    pub persist: bool,
}

impl Default for DsaOptions {
    fn default() -> Self {
        Self {
            generation: DsaGeneration::Dsa2,
            alpha: 0.3,
            greatest_upper_bound: 3.0,
            greatest_lower_bound: 2.0,
            average_upper_bound: 1.4,
            average_lower_bound: 1.1,
            hysteresis: 0.05,
            ring_capacity: 10,
            min_decrement_lookback: 5,
            adjustment_interval: 3,
            initial_step: None,
            step_floor: 0,
            cache_path: None,
            persist: true,
        }
    }
}

impl DsaOptions {
    pub fn with_generation(mut self, generation: DsaGeneration) -> Self {
        self.generation = generation;
        self
    }

    pub fn with_initial_step(mut self, step: usize) -> Self {
        self.initial_step = Some(step);
        self
    }

    pub fn with_step_floor(mut self, floor: usize) -> Self {
        self.step_floor = floor;
        self
    }

    pub fn with_cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_path = Some(path.into());
        self
    }

    pub fn with_persist(mut self, yes: bool) -> Self {
        self.persist = yes;
        self
    }

    /// The step new devices start on, given the operator multiplier.
    pub fn resolved_initial_step(&self, sleep_multiplier: f32) -> usize {
        self.initial_step.unwrap_or_else(|| multiplier_to_step(sleep_multiplier)).max(self.step_floor)
    }

    pub fn validate(&self) -> Result<(), OptionsError> {
        if !(self.alpha > 0.0 && self.alpha <= 1.0) {
            return Err(OptionsError::Alpha(self.alpha));
        }
        if self.ring_capacity == 0 {
            return Err(OptionsError::RingCapacity);
        }
        if self.step_floor > STEP_LAST {
            return Err(OptionsError::Step(self.step_floor));
        }
        if let Some(step) = self.initial_step.filter(|s| *s > STEP_LAST) {
            return Err(OptionsError::Step(step));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// How long the holder of the cross-device token waits for in-flight single-device
    /// callers to finish.
    pub quiescence: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self { quiescence: Duration::from_millis(10) }
    }
}

/// All options of the core.
#[derive(Debug, Clone, Default)]
pub struct CoreOptions {
    pub strategy: IoStrategy,
    pub retry: RetryOptions,
    pub pacing: PacingOptions,
    pub dsa: DsaOptions,
    pub lock: LockOptions,
    pub store: StoreOptions,
}

impl CoreOptions {
    pub fn with_strategy(mut self, strategy: IoStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_pacing(mut self, pacing: PacingOptions) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn with_dsa(mut self, dsa: DsaOptions) -> Self {
        self.dsa = dsa;
        self
    }

    pub fn with_lock(mut self, lock: LockOptions) -> Self {
        self.lock = lock;
        self
    }

    pub fn with_store(mut self, store: StoreOptions) -> Self {
        self.store = store;
        self
    }

    pub fn validate(&self) -> Result<(), OptionsError> {
        self.retry.validate()?;
        self.dsa.validate()?;
        validate_multiplier(self.pacing.sleep_multiplier).map(|_| ())
    }
}
