use std::{
    fs::{File, OpenOptions},
    io,
    os::{
        fd::{AsFd, AsRawFd, BorrowedFd},
        unix::fs::OpenOptionsExt,
    },
    path::{Path, PathBuf},
    time::Duration,
};

use ddcio_common::{
    constants::DDC_SLAVE_ADDR,
    stats,
    time::{monotonic_millis, monotonic_nanos, sleep_millis},
    IoEvent, Status,
};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::{ioctl::I2C_SLAVE, IoStrategy};

/// Path of the I2C character device for `busno`.
pub fn bus_path(busno: u32) -> PathBuf {
    if cfg!(any(target_os = "freebsd", target_os = "dragonfly")) {
        PathBuf::from(format!("/dev/iic{busno}"))
    } else {
        PathBuf::from(format!("/dev/i2c-{busno}"))
    }
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("failed to open {path}: {source}")]
    Open { path: PathBuf, source: io::Error },
    #[error("failed to bind slave address {addr:#04x} on {path}: {source}")]
    SlaveAddress { path: PathBuf, addr: u8, source: io::Error },
    #[error("{path} is locked by another process")]
    Locked { path: PathBuf },
    #[error("simulated failure: {0}")]
    Simulated(Status),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl DeviceError {
    /// The status equivalent of this error.
    pub fn status(&self) -> Status {
        match self {
            Self::Open { source, .. } | Self::SlaveAddress { source, .. } | Self::Io(source) => {
                Status::from(clone_io_error(source))
            }
            Self::Locked { .. } => Status::Locked,
            Self::Simulated(status) => *status,
        }
    }
}

fn clone_io_error(e: &io::Error) -> io::Error {
    match e.raw_os_error() {
        Some(errno) => io::Error::from_raw_os_error(errno),
        None => io::Error::from(e.kind()),
    }
}

/// Cross-instance advisory lock options.
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// Take an exclusive `flock` on open.
    pub enabled: bool,
    /// Time between attempts while another process holds the lock.
    pub poll_interval: Duration,
    /// Give up after this long.
    pub max_wait: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_millis(100),
            max_wait: Duration::from_millis(3000),
        }
    }
}

impl LockOptions {
    pub fn disabled() -> Self {
        Self { enabled: false, ..Default::default() }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }
}

/// An open I2C bus device. The advisory lock, if taken, is released when the device is
/// dropped.
#[derive(Debug)]
pub struct I2cDevice {
    busno: u32,
    path: PathBuf,
    file: File,
    locked: bool,
}

impl I2cDevice {
    /// Opens `/dev/i2c-{busno}`, binds the DDC slave address if `strategy` needs it, and takes
    /// the advisory lock.
    pub fn open(busno: u32, strategy: IoStrategy, lock: &LockOptions) -> Result<Self, DeviceError> {
        Self::open_path(bus_path(busno), busno, strategy, lock)
    }

    /// Like [`I2cDevice::open`], for an explicit path.
    pub fn open_path(
        path: impl AsRef<Path>,
        busno: u32,
        strategy: IoStrategy,
        lock: &LockOptions,
    ) -> Result<Self, DeviceError> {
        let path = path.as_ref().to_path_buf();

        #[cfg(feature = "failsim")]
        if let Some(status) = crate::failsim::check("device", "open") {
            stats::global().record_io_event(IoEvent::Open, 0, Err(status));
            return Err(DeviceError::Simulated(status));
        }

        let start = monotonic_nanos();
        let opened =
            OpenOptions::new().read(true).write(true).custom_flags(libc::O_CLOEXEC).open(&path);
        let elapsed = monotonic_nanos() - start;

        let file = match opened {
            Ok(file) => {
                stats::global().record_io_event(IoEvent::Open, elapsed, Ok(()));
                file
            }
            Err(source) => {
                let status = Status::from(clone_io_error(&source));
                stats::global().record_io_event(IoEvent::Open, elapsed, Err(status));
                error!(path = %path.display(), %source, "failed to open I2C device");
                return Err(DeviceError::Open { path, source });
            }
        };

        let mut device = Self { busno, path, file, locked: false };

        if strategy.binds_slave_address() {
            device.bind_slave_address(DDC_SLAVE_ADDR)?;
        }

        if lock.enabled {
            device.lock(lock)?;
        }

        debug!(busno, path = %device.path.display(), %strategy, locked = device.locked, "opened I2C device");
        Ok(device)
    }

    /// Binds `addr` as the target of subsequent `read(2)`/`write(2)` calls.
    pub fn bind_slave_address(&self, addr: u8) -> Result<(), DeviceError> {
        // SAFETY: I2C_SLAVE takes the address by value.
        let rc = unsafe {
            libc::ioctl(self.file.as_raw_fd(), I2C_SLAVE as _, addr as libc::c_ulong)
        };

        if rc < 0 {
            let source = io::Error::last_os_error();
            stats::global().record_io_event(
                IoEvent::Other,
                0,
                Err(Status::from(clone_io_error(&source))),
            );
            return Err(DeviceError::SlaveAddress { path: self.path.clone(), addr, source });
        }

        stats::global().record_io_event(IoEvent::Other, 0, Ok(()));
        Ok(())
    }

    fn lock(&mut self, opts: &LockOptions) -> Result<(), DeviceError> {
        let deadline = monotonic_millis() + opts.max_wait.as_millis() as u64;
        let mut waited = false;

        loop {
            // SAFETY: plain syscall on an owned descriptor.
            let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if rc == 0 {
                self.locked = true;
                return Ok(());
            }

            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EWOULDBLOCK) {
                return Err(DeviceError::Io(err));
            }

            if monotonic_millis() >= deadline {
                warn!(path = %self.path.display(), max_wait = ?opts.max_wait, "device locked by another process");
                return Err(DeviceError::Locked { path: self.path.clone() });
            }

            if !waited {
                debug!(path = %self.path.display(), "waiting for advisory lock");
                waited = true;
            }
            sleep_millis(opts.poll_interval.as_millis() as u32);
        }
    }

    #[inline]
    pub fn busno(&self) -> u32 {
        self.busno
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked
    }
}

impl AsFd for I2cDevice {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl Drop for I2cDevice {
    fn drop(&mut self) {
        if self.locked {
            // SAFETY: plain syscall on an owned descriptor.
            unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        }
        stats::global().record_io_event(IoEvent::Close, 0, Ok(()));
    }
}
