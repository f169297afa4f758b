//! Failure simulation. Before each I/O primitive the dispatcher asks [`check`] whether the
//! call at `(file, function)` should fail, and with which status.
//!
//! The control file has one entry per line:
//!
//! ```text
//! # file       function  status     occurrence
//! dispatcher   read      EIO        always
//! dispatcher   write     ENODEV     once
//! dispatcher   read      NullResponse @3
//! ```
//!
//! The occurrence defaults to `always`. `once` fires on the first matching call, `@N` on the
//! N-th.

use std::{fs, io, path::Path};

use ddcio_common::Status;
use parking_lot::{const_mutex, Mutex};
use thiserror::Error;
use tracing::{debug, info};

static TABLE: Mutex<Vec<Entry>> = const_mutex(Vec::new());

#[derive(Debug, Error)]
pub enum FailsimError {
    #[error("failed to read control file: {0}")]
    Io(#[from] io::Error),
    #[error("line {line}: {reason}")]
    Parse { line: usize, reason: String },
}

/// When an entry fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occurrence {
    Always,
    Once,
    Nth(u32),
}

/// One injected failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub file: String,
    pub function: String,
    pub status: Status,
    pub occurrence: Occurrence,
    calls: u32,
}

impl Entry {
    pub fn new(file: &str, function: &str, status: Status, occurrence: Occurrence) -> Self {
        Self { file: file.to_string(), function: function.to_string(), status, occurrence, calls: 0 }
    }

    fn fire(&mut self) -> bool {
        self.calls = self.calls.saturating_add(1);
        match self.occurrence {
            Occurrence::Always => true,
            Occurrence::Once => self.calls == 1,
            Occurrence::Nth(n) => self.calls == n,
        }
    }
}

fn parse_status(s: &str) -> Option<Status> {
    let status = match s {
        "EIO" => Status::IoError,
        "ETIMEDOUT" => Status::Timeout,
        "EBUSY" => Status::DeviceBusy,
        "ENODEV" => Status::DeviceGone(libc::ENODEV),
        "ENXIO" => Status::DeviceGone(libc::ENXIO),
        "EINVAL" => Status::Errno(libc::EINVAL),
        "BadByteCount" => Status::BadByteCount,
        "NullResponse" => Status::NullResponse,
        "ReadAllZero" => Status::ReadAllZero,
        "DdcData" => Status::DdcData,
        other => {
            let errno: i32 = other.parse().ok()?;
            // Accept both `5` and `-5`.
            Status::from_errno(errno.checked_abs()?)
        }
    };

    Some(status)
}

/// Parses the contents of a control file.
pub fn parse(text: &str) -> Result<Vec<Entry>, FailsimError> {
    let mut entries = Vec::new();

    for (idx, raw) in text.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }

        let err = |reason: &str| FailsimError::Parse { line: idx + 1, reason: reason.to_string() };

        let fields: Vec<_> = line.split_whitespace().collect();
        if !(3..=4).contains(&fields.len()) {
            return Err(err("expected `<file> <function> <status> [occurrence]`"));
        }

        let status = parse_status(fields[2]).ok_or_else(|| err("unknown status"))?;
        let occurrence = match fields.get(3).copied() {
            None | Some("always") => Occurrence::Always,
            Some("once") => Occurrence::Once,
            Some(n) => match n.strip_prefix('@').and_then(|n| n.parse::<u32>().ok()) {
                Some(n) if n > 0 => Occurrence::Nth(n),
                _ => return Err(err("bad occurrence")),
            },
        };

        entries.push(Entry::new(fields[0], fields[1], status, occurrence));
    }

    Ok(entries)
}

/// Loads a control file, replacing any installed entries. Returns the number of entries.
pub fn load(path: impl AsRef<Path>) -> Result<usize, FailsimError> {
    let entries = parse(&fs::read_to_string(path.as_ref())?)?;
    let n = entries.len();
    install(entries);
    info!(path = %path.as_ref().display(), entries = n, "failure simulation table loaded");
    Ok(n)
}

pub fn install(entries: Vec<Entry>) {
    *TABLE.lock() = entries;
}

pub fn clear() {
    TABLE.lock().clear();
}

/// Returns the status to inject for a call at `(file, function)`, if any.
pub fn check(file: &str, function: &str) -> Option<Status> {
    let mut table = TABLE.lock();
    let entry = table.iter_mut().find(|e| e.file == file && e.function == function)?;

    if entry.fire() {
        debug!(file, function, status = %entry.status, "injecting simulated failure");
        return Some(entry.status);
    }

    None
}
