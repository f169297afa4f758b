#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Adaptive retry and pacing for DDC/CI monitor control over I2C.
//!
//! [`Context`] owns everything a process needs: the per-bus device store, the retry engine,
//! the pacer, and the optional on-disk cache of learned sleep adjustments. Open a bus with
//! [`Context::open`] and talk to it through a [`Channel`].

use std::{os::fd::AsFd, sync::Arc};

use thiserror::Error;
use tracing::{debug, info, warn};

pub use ddcio_common::{
    constants, error, stats, status, time, CallStat, ErrorNode, IoEvent, IoMode, OperationClass,
    Partition, SleepEvent, Status,
};
pub use ddcio_core::{
    check_response, dsa, report, store, validate_multiplier, Channel, CoreOptions, DeviceEntry,
    DeviceStore, DsaGeneration, DsaOptions, OptionsError, Pacer, PacingOptions, RetryEngine,
    RetryOptions, SleepOverride, StoreOptions,
};
pub use ddcio_transport::{
    bus_path, global, sysfs_driver, DeviceError, Dispatcher, FileIo, I2cDevice, I2cIo, IoStrategy,
    IoctlIo, LockOptions,
};

#[cfg(feature = "failsim")]
pub use ddcio_transport::failsim;

use dsa::{CacheError, StatsCache};
use report::CoreReport;

#[derive(Debug, Error)]
pub enum InitError {
    #[error("invalid options: {0}")]
    Options(#[from] OptionsError),
    #[error("cannot select I/O strategy: {0}")]
    Strategy(Status),
}

/// Process-wide state for talking to DDC/CI devices.
#[derive(Debug)]
pub struct Context {
    opts: CoreOptions,
    dispatcher: &'static Dispatcher,
    store: Arc<DeviceStore>,
    engine: RetryEngine,
    pacer: Pacer,
    cache: Option<StatsCache>,
}

impl Context {
    /// Initializes a context on the process-wide dispatcher.
    pub fn init(opts: CoreOptions) -> Result<Self, InitError> {
        Self::init_with(opts, global())
    }

    /// Initializes a context on `dispatcher`.
    ///
    /// Options are validated before anything is touched. A stats cache that cannot be read is
    /// discarded with a warning and does not fail initialization.
    pub fn init_with(opts: CoreOptions, dispatcher: &'static Dispatcher) -> Result<Self, InitError> {
        opts.validate()?;

        if dispatcher.strategy() != opts.strategy {
            dispatcher.set_strategy(opts.strategy).map_err(InitError::Strategy)?;
        }

        let store = Arc::new(DeviceStore::new(&opts));

        let cache = if opts.dsa.persist && opts.dsa.generation == DsaGeneration::Dsa2 {
            match opts.dsa.cache_path.clone() {
                Some(path) => Some(StatsCache::new(path)),
                None => StatsCache::default_location()
                    .map_err(|e| warn!(error = %e, "DSA stats will not be persisted"))
                    .ok(),
            }
        } else {
            None
        };

        if let Some(cache) = &cache {
            match cache.restore(opts.dsa.generation) {
                Ok(records) => {
                    let created = store.load_cached(&records);
                    debug!(created, path = %cache.path().display(), "seeded devices from cache");
                }
                Err(e) => warn!(error = %e, "starting without cached DSA stats"),
            }
        }

        let engine = RetryEngine::new(Arc::clone(&store), opts.retry.clone());
        let pacer = Pacer::new(opts.pacing.clone());

        info!(strategy = %opts.strategy, generation = ?opts.dsa.generation, "ddcio initialized");
        Ok(Self { opts, dispatcher, store, engine, pacer, cache })
    }

    pub fn options(&self) -> &CoreOptions {
        &self.opts
    }

    pub fn dispatcher(&self) -> &'static Dispatcher {
        self.dispatcher
    }

    pub fn store(&self) -> &Arc<DeviceStore> {
        &self.store
    }

    pub fn engine(&self) -> &RetryEngine {
        &self.engine
    }

    pub fn pacer(&self) -> &Pacer {
        &self.pacer
    }

    /// Opens `/dev/i2c-{busno}` with the active strategy and lock settings.
    pub fn open(&self, busno: u32) -> Result<I2cDevice, DeviceError> {
        I2cDevice::open(busno, self.dispatcher.strategy(), &self.opts.lock)
    }

    /// A channel on an opened device. Applies the post-open delay.
    pub fn channel<'a>(&'a self, device: &'a I2cDevice) -> Channel<'a, I2cDevice> {
        self.channel_for(device, device.busno())
    }

    /// A channel on any descriptor, accounted against `busno`.
    pub fn channel_for<'a, D: AsFd>(&'a self, fd: &'a D, busno: u32) -> Channel<'a, D> {
        let mut channel = Channel::new(fd, busno, self.dispatcher, &self.engine, &self.pacer);
        channel.post_open();
        channel
    }

    /// Statistics and per-device state.
    pub fn report(&self) -> CoreReport {
        report::snapshot(&self.store)
    }

    /// Writes learned DSA state to the cache. Returns the number of records written, or zero
    /// if persistence is off.
    pub fn save_stats(&self) -> Result<usize, CacheError> {
        let Some(cache) = &self.cache else {
            return Ok(0);
        };

        let records = self.store.dsa_records();
        cache.save(self.opts.dsa.generation, &records)?;
        Ok(records.len())
    }

    /// Persists learned state and releases the context.
    pub fn shutdown(self) -> Result<(), CacheError> {
        let saved = self.save_stats()?;
        info!(saved, "ddcio shut down");
        Ok(())
    }
}
