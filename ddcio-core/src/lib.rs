#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub mod dsa;
pub mod report;
pub mod store;

mod options;
mod pacing;
mod retry;
mod session;

pub use dsa::{DsaGeneration, Outcome, SleepController};
pub use options::{
    validate_multiplier, CoreOptions, DsaOptions, OptionsError, PacingOptions, RetryOptions,
    StoreOptions,
};
pub use pacing::{Pacer, SleepOverride};
pub use retry::RetryEngine;
pub use session::{check_response, Channel};
pub use store::{DeviceEntry, DeviceStore, GlobalMaxtriesAccumulator, TryHistogram, TryOutcome};
