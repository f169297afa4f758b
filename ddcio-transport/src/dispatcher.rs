use std::{
    fs,
    os::fd::BorrowedFd,
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc, OnceLock,
    },
};

use ddcio_common::{
    stats::{self, IoStats},
    time::monotonic_nanos,
    IoEvent, Status,
};
use tracing::{debug, warn};

use crate::{FileIo, I2cIo, IoStrategy, IoctlIo};

static GLOBAL: OnceLock<Dispatcher> = OnceLock::new();

/// The process-wide dispatcher, using the built-in strategies.
pub fn global() -> &'static Dispatcher {
    GLOBAL.get_or_init(Dispatcher::default)
}

/// Looks up the kernel driver bound to an I2C bus.
pub type DriverProbe = fn(u32) -> Option<String>;

/// Reads the name of the kernel module driving `/dev/i2c-{busno}` from sysfs.
pub fn sysfs_driver(busno: u32) -> Option<String> {
    let candidates = [
        format!("/sys/bus/i2c/devices/i2c-{busno}/device/driver/module"),
        format!("/sys/bus/i2c/devices/i2c-{busno}/device/device/device/driver/module"),
    ];

    candidates.iter().find_map(|p| {
        let resolved = fs::canonicalize(Path::new(p)).ok()?;
        resolved.file_name().map(|n| n.to_string_lossy().into_owned())
    })
}

/// Routes every write and read to the active [`I2cIo`] strategy, and records the I/O event.
///
/// Exactly one strategy is active at a time. It can only be switched before the first
/// primitive has been issued, with one exception: an `EINVAL` from the ioctl strategy on a bus
/// driven by the proprietary nvidia driver permanently forces the file strategy.
#[derive(Debug)]
pub struct Dispatcher {
    file_io: Arc<dyn I2cIo>,
    ioctl_io: Arc<dyn I2cIo>,
    active: AtomicU8,
    issued: AtomicBool,
    nvidia_fallback: AtomicBool,
    probe: DriverProbe,
    stats: &'static IoStats,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::with_strategies(Arc::new(FileIo), Arc::new(IoctlIo))
    }
}

impl Dispatcher {
    /// Creates a dispatcher with custom implementations behind each strategy slot.
    pub fn with_strategies(file_io: Arc<dyn I2cIo>, ioctl_io: Arc<dyn I2cIo>) -> Self {
        Self {
            file_io,
            ioctl_io,
            active: AtomicU8::new(IoStrategy::FileIo as u8),
            issued: AtomicBool::new(false),
            nvidia_fallback: AtomicBool::new(false),
            probe: sysfs_driver,
            stats: stats::global(),
        }
    }

    /// Replaces the sysfs driver lookup used for the nvidia fallback.
    pub fn with_driver_probe(mut self, probe: DriverProbe) -> Self {
        self.probe = probe;
        self
    }

    /// Creates a dispatcher with `strategy` active.
    pub fn new(strategy: IoStrategy) -> Self {
        let this = Self::default();
        this.active.store(strategy as u8, Ordering::Relaxed);
        this
    }

    pub fn strategy(&self) -> IoStrategy {
        match self.active.load(Ordering::Acquire) {
            1 => IoStrategy::Ioctl,
            _ => IoStrategy::FileIo,
        }
    }

    /// Switches the active strategy. Fails once any primitive has been issued.
    pub fn set_strategy(&self, strategy: IoStrategy) -> Result<(), Status> {
        if self.issued.load(Ordering::Acquire) {
            return Err(Status::InvalidOperation("I/O strategy switched after first I/O"));
        }

        debug!(%strategy, "I/O strategy set");
        self.active.store(strategy as u8, Ordering::Release);
        Ok(())
    }

    /// Whether the nvidia `EINVAL` fallback has been taken.
    pub fn nvidia_fallback_taken(&self) -> bool {
        self.nvidia_fallback.load(Ordering::Relaxed)
    }

    fn io(&self, strategy: IoStrategy) -> &dyn I2cIo {
        match strategy {
            IoStrategy::FileIo => self.file_io.as_ref(),
            IoStrategy::Ioctl => self.ioctl_io.as_ref(),
        }
    }

    /// Writes `bytes` to `addr` on the device open as `fd` for bus `busno`.
    pub fn write(
        &self,
        fd: BorrowedFd<'_>,
        busno: u32,
        addr: u8,
        bytes: &[u8],
    ) -> Result<(), Status> {
        loop {
            let strategy = self.begin();

            #[cfg(feature = "failsim")]
            if let Some(status) = crate::failsim::check("dispatcher", "write") {
                self.stats.record_io_event(IoEvent::Write, 0, Err(status));
                return Err(status);
            }

            let start = monotonic_nanos();
            let result = self.io(strategy).write(fd, addr, bytes);
            self.stats.record_io_event(IoEvent::Write, monotonic_nanos() - start, result);

            match result {
                Err(status) if self.should_fall_back(strategy, busno, status) => {
                    self.bind_for_fileio(fd, addr)?;
                }
                result => return result,
            }
        }
    }

    /// Fills `buf` from `addr` on the device open as `fd` for bus `busno`.
    pub fn read(
        &self,
        fd: BorrowedFd<'_>,
        busno: u32,
        addr: u8,
        bytewise: bool,
        buf: &mut [u8],
    ) -> Result<(), Status> {
        loop {
            let strategy = self.begin();

            #[cfg(feature = "failsim")]
            if let Some(status) = crate::failsim::check("dispatcher", "read") {
                self.stats.record_io_event(IoEvent::Read, 0, Err(status));
                return Err(status);
            }

            let start = monotonic_nanos();
            let result = self.io(strategy).read(fd, addr, bytewise, buf);
            self.stats.record_io_event(IoEvent::Read, monotonic_nanos() - start, result);

            match result {
                Err(status) if self.should_fall_back(strategy, busno, status) => {
                    self.bind_for_fileio(fd, addr)?;
                }
                result => return result,
            }
        }
    }

    #[inline]
    fn begin(&self) -> IoStrategy {
        self.issued.store(true, Ordering::Release);
        self.strategy()
    }

    /// Descriptors opened for the ioctl strategy carry no slave address. Bind it before the
    /// file strategy takes over.
    fn bind_for_fileio(&self, fd: BorrowedFd<'_>, addr: u8) -> Result<(), Status> {
        let start = monotonic_nanos();
        let result = self.file_io.bind_address(fd, addr);
        self.stats.record_io_event(IoEvent::Other, monotonic_nanos() - start, result);
        if let Err(status) = result {
            warn!(addr, %status, "failed to bind slave address after fileio fallback");
        }
        result
    }

    fn should_fall_back(&self, strategy: IoStrategy, busno: u32, status: Status) -> bool {
        if strategy != IoStrategy::Ioctl || status != Status::Errno(libc::EINVAL) {
            return false;
        }

        if (self.probe)(busno).as_deref() != Some("nvidia") {
            return false;
        }

        warn!(busno, "nvidia/i2c-dev EINVAL bug encountered, forcing fileio strategy and retrying");
        self.active.store(IoStrategy::FileIo as u8, Ordering::Release);
        self.nvidia_fallback.store(true, Ordering::Relaxed);
        true
    }
}
