use std::{
    collections::VecDeque,
    os::fd::BorrowedFd,
    sync::atomic::{AtomicUsize, Ordering},
};

use ddcio_common::Status;
use ddcio_transport::I2cIo;
use parking_lot::Mutex;

use crate::{fill, DEFAULT_RESPONSE};

/// What the next primitive call returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Succeed. Reads return the default response.
    Ok,
    /// Succeed, and fill a read buffer with these bytes (repeated to length).
    Data(Vec<u8>),
    /// Fail with this status.
    Fail(Status),
}

impl From<Result<(), Status>> for Reply {
    fn from(r: Result<(), Status>) -> Self {
        match r {
            Ok(()) => Self::Ok,
            Err(status) => Self::Fail(status),
        }
    }
}

/// Replays a fixed script, one reply per write or read. Once the script runs out every call
/// succeeds.
#[derive(Debug, Default)]
pub struct ScriptedIo {
    script: Mutex<VecDeque<Reply>>,
    writes: Mutex<Vec<Vec<u8>>>,
    binds: Mutex<Vec<u8>>,
    calls: AtomicUsize,
}

impl ScriptedIo {
    pub fn new<R: Into<Reply>>(script: impl IntoIterator<Item = R>) -> Self {
        Self { script: Mutex::new(script.into_iter().map(Into::into).collect()), ..Default::default() }
    }

    pub fn always_ok() -> Self {
        Self::default()
    }

    /// Appends replies to the script.
    pub fn push<R: Into<Reply>>(&self, replies: impl IntoIterator<Item = R>) {
        self.script.lock().extend(replies.into_iter().map(Into::into));
    }

    /// Total write and read calls seen.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    /// Every successfully written message, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().clone()
    }

    /// Every address bound through [`I2cIo::bind_address`], in order.
    pub fn binds(&self) -> Vec<u8> {
        self.binds.lock().clone()
    }

    fn next(&self) -> Reply {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.script.lock().pop_front().unwrap_or(Reply::Ok)
    }
}

impl I2cIo for ScriptedIo {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn write(&self, _fd: BorrowedFd<'_>, _addr: u8, bytes: &[u8]) -> Result<(), Status> {
        match self.next() {
            Reply::Fail(status) => Err(status),
            Reply::Ok | Reply::Data(_) => {
                self.writes.lock().push(bytes.to_vec());
                Ok(())
            }
        }
    }

    fn read(
        &self,
        _fd: BorrowedFd<'_>,
        _addr: u8,
        _bytewise: bool,
        buf: &mut [u8],
    ) -> Result<(), Status> {
        match self.next() {
            Reply::Fail(status) => Err(status),
            Reply::Ok => {
                fill(buf, &DEFAULT_RESPONSE);
                Ok(())
            }
            Reply::Data(data) => {
                fill(buf, &data);
                Ok(())
            }
        }
    }

    fn bind_address(&self, _fd: BorrowedFd<'_>, addr: u8) -> Result<(), Status> {
        self.binds.lock().push(addr);
        Ok(())
    }
}
