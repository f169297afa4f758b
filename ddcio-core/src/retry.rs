use std::sync::Arc;

use ddcio_common::{
    stats::{self, IoStats},
    time::monotonic_nanos,
    ErrorNode, OperationClass, Partition, Status,
};
use tracing::{debug, error, instrument, warn};

use crate::{
    dsa::Outcome,
    options::RetryOptions,
    store::{DeviceEntry, DeviceStore, TryOutcome},
};

const FUNC: &str = "RetryEngine::try_op";

/// How the attempt loop ended.
#[derive(Debug, Clone, Copy)]
enum Ended {
    Succeeded(u16),
    Exhausted,
    /// The operation signalled exhaustion of its own.
    Nested(Status),
    Fatal(Status),
    Programmer(Status),
}

/// Bounded retry loops per operation class.
///
/// Every call increments exactly one slot of the device's try histogram for the class and
/// feeds the device's sleep controller once.
#[derive(Debug, Clone)]
pub struct RetryEngine {
    store: Arc<DeviceStore>,
    opts: RetryOptions,
    stats: &'static IoStats,
}

impl RetryEngine {
    pub fn new(store: Arc<DeviceStore>, opts: RetryOptions) -> Self {
        Self { store, opts, stats: stats::global() }
    }

    pub fn with_stats(mut self, stats: &'static IoStats) -> Self {
        self.stats = stats;
        self
    }

    #[inline]
    pub fn store(&self) -> &Arc<DeviceStore> {
        &self.store
    }

    #[inline]
    pub fn options(&self) -> &RetryOptions {
        &self.opts
    }

    /// [`try_op`](Self::try_op) on the entry for `busno`, creating it if needed.
    pub fn try_bus<F>(&self, class: OperationClass, busno: u32, op: F) -> Result<(), ErrorNode>
    where
        F: FnMut() -> Result<(), Status>,
    {
        let device = self.store.get_or_create(busno);
        self.try_op(class, &device, op)
    }

    /// Runs `op` until it succeeds, fails fatally, or `device.maxtries(class)` attempts have
    /// failed.
    ///
    /// A failure is returned as an [`ErrorNode`] whose causes are the statuses of the failed
    /// attempts in order. For a fatal failure the last cause is the fatal status itself.
    /// Programmer errors are returned without causes.
    #[instrument(skip_all, fields(busno = device.busno(), %class))]
    pub fn try_op<F>(
        &self,
        class: OperationClass,
        device: &DeviceEntry,
        mut op: F,
    ) -> Result<(), ErrorNode>
    where
        F: FnMut() -> Result<(), Status>,
    {
        let start = monotonic_nanos();
        let maxtries = device.maxtries(class);
        let mut failures = Vec::with_capacity(maxtries as usize);
        let mut null_adjustment = false;

        let ended = 'attempts: {
            for attempt in 1..=maxtries {
                let status = match op() {
                    Ok(()) => break 'attempts Ended::Succeeded(attempt),
                    Err(status) => status,
                };

                if status.is_programmer_error() {
                    break 'attempts Ended::Programmer(status);
                }

                let status = if status == Status::NullResponse && self.opts.null_msg_means_unsupported
                {
                    Status::DeterminedUnsupported
                } else {
                    status
                };

                match status.partition() {
                    Partition::Exhausted => break 'attempts Ended::Nested(status),
                    Partition::Fatal => break 'attempts Ended::Fatal(status),
                    Partition::Retryable => {
                        null_adjustment |= status == Status::NullResponse;
                        failures.push(status);

                        let remaining = maxtries - attempt;
                        debug!(attempt, remaining, %status, "attempt failed");
                        device.note_retryable_failure(status, remaining);

                        if self.opts.amplify_on_failure && remaining > 0 {
                            device.bump_multiplier_ct(self.opts.max_multiplier_ct);
                        }
                    }
                }
            }
            Ended::Exhausted
        };

        if self.opts.amplify_on_failure {
            device.set_multiplier_ct(1);
        }

        let attempts = failures.len() as u16;
        let result = match ended {
            Ended::Succeeded(attempt) => {
                device.record_try(class, TryOutcome::Succeeded(attempt));
                device.record_final(Outcome::Succeeded, attempt, null_adjustment);
                if attempt > 1 {
                    debug!(attempt, "succeeded after retries");
                }
                Ok(())
            }
            Ended::Exhausted => {
                let status = if failures.iter().all(|s| *s == Status::ReadAllZero) {
                    Status::AllTriesZero
                } else {
                    Status::RetriesExhausted
                };
                device.record_try(class, TryOutcome::Exhausted);
                device.record_final(Outcome::Exhausted, attempts, null_adjustment);
                let node = ErrorNode::with_causes(status, FUNC, failures);
                warn!(maxtries, chain = %node.summary(), "retries exhausted");
                Err(node)
            }
            Ended::Nested(status) => {
                device.record_try(class, TryOutcome::Exhausted);
                device.record_final(Outcome::Exhausted, attempts + 1, null_adjustment);
                let node = ErrorNode::with_causes(status, FUNC, failures);
                warn!(chain = %node.summary(), "operation gave up");
                Err(node)
            }
            Ended::Fatal(status) => {
                failures.push(status);
                device.record_try(class, TryOutcome::Fatal);
                device.record_final(Outcome::Fatal, attempts + 1, null_adjustment);
                let node = ErrorNode::with_causes(status, FUNC, failures);
                if status != Status::DeterminedUnsupported {
                    error!(chain = %node.summary(), "fatal failure");
                }
                Err(node)
            }
            Ended::Programmer(status) => {
                device.record_try(class, TryOutcome::Fatal);
                device.record_final(Outcome::Fatal, attempts + 1, null_adjustment);
                Err(ErrorNode::new(status, FUNC))
            }
        };

        self.stats.record_call(class, monotonic_nanos().saturating_sub(start));
        result
    }
}
