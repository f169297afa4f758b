#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Simulated I2C devices. Both implementations ignore the descriptor they are handed, so any
//! open file (see [`sim_fd`]) will do.

use std::{
    fs::{File, OpenOptions},
    io,
};

mod random;
pub use random::RandomIo;

mod scripted;
pub use scripted::{Reply, ScriptedIo};

/// The DDC null message a monitor sends to say "unsupported".
pub const NULL_MESSAGE: [u8; 3] = ddcio_common::constants::DDC_NULL_MESSAGE;

/// A response pattern that is neither all-zero nor a null message.
pub const DEFAULT_RESPONSE: [u8; 4] = [0x6E, 0x88, 0x02, 0x00];

/// Opens a descriptor for simulated devices to be handed.
pub fn sim_fd() -> io::Result<File> {
    OpenOptions::new().read(true).write(true).open("/dev/null")
}

pub(crate) fn fill(buf: &mut [u8], pattern: &[u8]) {
    if pattern.is_empty() {
        buf.fill(0);
        return;
    }

    for (dst, src) in buf.iter_mut().zip(pattern.iter().cycle()) {
        *dst = *src;
    }
}
