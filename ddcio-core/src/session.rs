//! Request/response exchanges on one open device.

use std::{os::fd::AsFd, sync::Arc};

use ddcio_common::{
    constants::{DDC_NULL_MESSAGE, DDC_SLAVE_ADDR},
    time::{monotonic_nanos, DeferredSleep},
    ErrorNode, IoEvent, IoMode, OperationClass, SleepEvent, Status,
};
use ddcio_transport::Dispatcher;
use tracing::debug;

use crate::{
    pacing::{Pacer, SleepOverride},
    retry::RetryEngine,
    store::DeviceEntry,
};

/// Classifies a response buffer that was read successfully.
pub fn check_response(response: &[u8]) -> Result<(), Status> {
    if response.starts_with(&DDC_NULL_MESSAGE) {
        Err(Status::NullResponse)
    } else if !response.is_empty() && response.iter().all(|b| *b == 0) {
        Err(Status::ReadAllZero)
    } else {
        Ok(())
    }
}

/// A paced, retried channel to the DDC/CI slave of one device.
///
/// At most one exchange is in flight per channel; the `&mut self` receivers enforce it.
#[derive(Debug)]
pub struct Channel<'a, D: AsFd> {
    fd: &'a D,
    busno: u32,
    addr: u8,
    mode: IoMode,
    dispatcher: &'a Dispatcher,
    engine: &'a RetryEngine,
    pacer: &'a Pacer,
    device: Arc<DeviceEntry>,
    pending: DeferredSleep,
}

impl<'a, D: AsFd> Channel<'a, D> {
    pub fn new(
        fd: &'a D,
        busno: u32,
        dispatcher: &'a Dispatcher,
        engine: &'a RetryEngine,
        pacer: &'a Pacer,
    ) -> Self {
        let device = engine.store().get_or_create(busno);
        Self {
            fd,
            busno,
            addr: DDC_SLAVE_ADDR,
            mode: IoMode::I2c,
            dispatcher,
            engine,
            pacer,
            device,
            pending: DeferredSleep::new(),
        }
    }

    /// Talks to `addr` instead of the DDC/CI slave address.
    pub fn with_slave_address(mut self, addr: u8) -> Self {
        self.addr = addr;
        self
    }

    pub fn with_mode(mut self, mode: IoMode) -> Self {
        self.mode = mode;
        self
    }

    #[inline]
    pub fn busno(&self) -> u32 {
        self.busno
    }

    #[inline]
    pub fn device(&self) -> &Arc<DeviceEntry> {
        &self.device
    }

    fn pause(&mut self, event: SleepEvent, sleep: SleepOverride) {
        self.pacer.pause(&self.device, self.mode, event, sleep, &mut self.pending);
    }

    /// Waits out any deferred sleep. Runs before every primitive.
    fn settle(&mut self) {
        self.pending.commit();
    }

    /// The post-open settle delay.
    pub fn post_open(&mut self) {
        self.pause(SleepEvent::PostOpen, SleepOverride::UseDefault);
    }

    /// One write, then the post-write sleep.
    pub fn write_once(&mut self, bytes: &[u8], post: SleepOverride) -> Result<(), Status> {
        self.settle();
        let result = self.dispatcher.write(self.fd.as_fd(), self.busno, self.addr, bytes);
        self.pause(SleepEvent::PostWrite, post);
        result
    }

    /// One write, a read of `response.len()` bytes, and the sleeps between and after them.
    /// The whole exchange is recorded as one [`IoEvent::WriteRead`].
    /// The response is checked for the null message and for all zeros.
    pub fn write_read_once(
        &mut self,
        request: &[u8],
        response: &mut [u8],
        bytewise: bool,
    ) -> Result<(), Status> {
        self.settle();
        let start = monotonic_nanos();
        let mut result = self.dispatcher.write(self.fd.as_fd(), self.busno, self.addr, request);
        if result.is_ok() {
            self.pause(SleepEvent::WriteToRead, SleepOverride::UseDefault);

            self.settle();
            result =
                self.dispatcher.read(self.fd.as_fd(), self.busno, self.addr, bytewise, response);
            self.pause(SleepEvent::PostRead, SleepOverride::UseDefault);
        }
        let elapsed = monotonic_nanos().saturating_sub(start);
        self.pacer.stats().record_exchange(IoEvent::WriteRead, elapsed);
        result?;

        let checked = check_response(response);
        if checked == Err(Status::NullResponse) {
            debug!(busno = self.busno, "null response");
            self.pause(SleepEvent::NullResponse, SleepOverride::UseDefault);
        }
        checked
    }

    /// Retried [`write_once`](Self::write_once).
    pub fn write_only(&mut self, bytes: &[u8]) -> Result<(), ErrorNode> {
        let engine = self.engine;
        let device = Arc::clone(&self.device);
        engine.try_op(OperationClass::WriteOnly, &device, || {
            self.write_once(bytes, SleepOverride::UseDefault)
        })
    }

    /// Retried [`write_read_once`](Self::write_read_once).
    pub fn write_read(
        &mut self,
        request: &[u8],
        response: &mut [u8],
        bytewise: bool,
    ) -> Result<(), ErrorNode> {
        let engine = self.engine;
        let device = Arc::clone(&self.device);
        engine.try_op(OperationClass::WriteRead, &device, || {
            self.write_read_once(request, response, bytewise)
        })
    }

    /// Writes a save-current-settings request and waits the longer delay the monitor needs
    /// to commit it.
    pub fn save_settings(&mut self, request: &[u8]) -> Result<(), ErrorNode> {
        let engine = self.engine;
        let device = Arc::clone(&self.device);
        engine.try_op(OperationClass::WriteOnly, &device, || {
            self.write_once(request, SleepOverride::None)?;
            self.pause(SleepEvent::PostSaveSettings, SleepOverride::UseDefault);
            Ok(())
        })
    }

    /// Runs a caller-defined exchange under the retry engine. Multi-part transfers use this
    /// with [`OperationClass::MultiPartRead`] or [`OperationClass::MultiPartWrite`], calling
    /// the `*_once` primitives from `op`.
    pub fn with_retry<F>(&mut self, class: OperationClass, mut op: F) -> Result<(), ErrorNode>
    where
        F: FnMut(&mut Self) -> Result<(), Status>,
    {
        let engine = self.engine;
        let device = Arc::clone(&self.device);
        engine.try_op(class, &device, || op(self))
    }
}

impl<D: AsFd> Drop for Channel<'_, D> {
    fn drop(&mut self) {
        self.settle();
    }
}
