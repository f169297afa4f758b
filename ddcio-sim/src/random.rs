use std::{
    os::fd::BorrowedFd,
    sync::atomic::{AtomicUsize, Ordering},
};

use ddcio_common::Status;
use ddcio_transport::I2cIo;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{fill, DEFAULT_RESPONSE};

/// Fails each primitive with probability `failure_rate`. Seeded, so runs are reproducible.
#[derive(Debug)]
pub struct RandomIo {
    failure_rate: f64,
    status: Status,
    rng: Mutex<StdRng>,
    calls: AtomicUsize,
    failures: AtomicUsize,
}

impl RandomIo {
    pub fn new(failure_rate: f64, seed: u64) -> Self {
        Self {
            failure_rate: failure_rate.clamp(0.0, 1.0),
            status: Status::IoError,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            calls: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        }
    }

    /// Sets the status returned on failure. Defaults to [`Status::IoError`].
    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::Relaxed)
    }

    fn roll(&self) -> Result<(), Status> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if self.rng.lock().gen_bool(self.failure_rate) {
            self.failures.fetch_add(1, Ordering::Relaxed);
            return Err(self.status);
        }
        Ok(())
    }
}

impl I2cIo for RandomIo {
    fn name(&self) -> &'static str {
        "random"
    }

    fn write(&self, _fd: BorrowedFd<'_>, _addr: u8, _bytes: &[u8]) -> Result<(), Status> {
        self.roll()
    }

    fn read(
        &self,
        _fd: BorrowedFd<'_>,
        _addr: u8,
        _bytewise: bool,
        buf: &mut [u8],
    ) -> Result<(), Status> {
        self.roll()?;
        fill(buf, &DEFAULT_RESPONSE);
        Ok(())
    }
}
