use std::{fs::File, sync::Arc};

use ddcio_common::{stats::IoStats, SleepEvent};
use ddcio_core::{Channel, CoreOptions, DeviceStore, Pacer, PacingOptions, RetryEngine};
use ddcio_sim::{sim_fd, ScriptedIo};
use ddcio_transport::Dispatcher;

mod concurrency;
mod persistence;
mod properties;
mod scenarios;
mod session;

/// Pacing with every default sleep at zero, so exchanges run at full speed.
pub(crate) fn fast_pacing() -> PacingOptions {
    PacingOptions { table: [[0; SleepEvent::COUNT]; 2], ..Default::default() }
}

/// A scripted device behind a dispatcher, with a private stats instance.
pub(crate) struct Rig {
    pub io: Arc<ScriptedIo>,
    pub dispatcher: Dispatcher,
    pub engine: RetryEngine,
    pub pacer: Pacer,
    pub stats: &'static IoStats,
    pub fd: File,
}

impl Rig {
    pub fn new(io: ScriptedIo, opts: CoreOptions) -> Self {
        let io = Arc::new(io);
        let stats: &'static IoStats = Box::leak(Box::default());
        let store = Arc::new(DeviceStore::new(&opts));
        Self {
            dispatcher: Dispatcher::with_strategies(io.clone(), io.clone()),
            engine: RetryEngine::new(store, opts.retry.clone()).with_stats(stats),
            pacer: Pacer::new(opts.pacing.clone()).with_stats(stats),
            stats,
            fd: sim_fd().unwrap(),
            io,
        }
    }

    pub fn channel(&self, busno: u32) -> Channel<'_, File> {
        Channel::new(&self.fd, busno, &self.dispatcher, &self.engine, &self.pacer)
    }
}
