#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

use std::time::SystemTime;

pub mod error;
pub mod stats;
pub mod status;
pub mod time;
mod types;

pub use error::ErrorNode;
pub use stats::{CallStat, IoEvent, SleepEvent};
pub use status::{Partition, Status};
pub use types::{IoMode, OperationClass};

/// Returns the current UNIX timestamp in seconds. Clamps to 0 if the wall clock is set
/// before the epoch.
#[inline]
pub fn unix_secs() -> u64 {
    SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

#[allow(non_upper_case_globals)]
pub mod constants {
    /// Upper bound on the number of attempts any retry loop may make.
    pub const MaxMaxTries: u16 = 15;

    /// I2C slave address of the DDC/CI channel on a monitor.
    pub const DDC_SLAVE_ADDR: u8 = 0x37;

    /// Normal inter-message delay in the DDC/CI specification.
    pub const DDC_TIMEOUT_MILLIS_DEFAULT: u32 = 50;
    /// Delay following a Set VCP Feature write.
    pub const DDC_TIMEOUT_MILLIS_POST_SETVCP_WRITE: u32 = 50;
    /// Delay following a Save Current Settings command.
    pub const DDC_TIMEOUT_POST_SAVE_SETTINGS: u32 = 200;
    /// The DDC null message: source address, zero length, checksum.
    pub const DDC_NULL_MESSAGE: [u8; 3] = [0x6E, 0x80, 0xBE];

    /// Extra delay applied after a DDC null response.
    pub const DDC_TIMEOUT_MILLIS_NULL_RESPONSE_INCREMENT: u32 = 100;
}
