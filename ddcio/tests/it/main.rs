use std::sync::Arc;

use ddcio::{CoreOptions, Dispatcher, DsaOptions, PacingOptions, SleepEvent};
use ddcio_sim::ScriptedIo;

mod context;

pub(crate) fn fast_pacing() -> PacingOptions {
    PacingOptions { table: [[0; SleepEvent::COUNT]; 2], ..Default::default() }
}

/// Fast pacing, and no persistence so the per-user cache is never read or written.
pub(crate) fn fast_options() -> CoreOptions {
    CoreOptions::default()
        .with_pacing(fast_pacing())
        .with_dsa(DsaOptions::default().with_persist(false))
}

/// A leaked dispatcher backed by `io` for both strategies.
pub(crate) fn sim_dispatcher(io: &Arc<ScriptedIo>) -> &'static Dispatcher {
    Box::leak(Box::new(Dispatcher::with_strategies(io.clone(), io.clone())))
}
