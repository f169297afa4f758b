use std::{fmt, os::fd::BorrowedFd};

use ddcio_common::Status;

mod device;
pub use device::{bus_path, DeviceError, I2cDevice, LockOptions};

mod dispatcher;
pub use dispatcher::{global, sysfs_driver, Dispatcher, DriverProbe};

mod fileio;
pub use fileio::FileIo;

mod ioctl;
pub use ioctl::IoctlIo;

#[cfg(feature = "failsim")]
pub mod failsim;

/// A pair of write/read primitives against an opened I2C character device.
///
/// Implementations are stateless and shared between threads.
pub trait I2cIo: Send + Sync + fmt::Debug {
    /// Human readable name, used in logs.
    fn name(&self) -> &'static str;

    /// Writes `bytes` to the slave at `addr`.
    fn write(&self, fd: BorrowedFd<'_>, addr: u8, bytes: &[u8]) -> Result<(), Status>;

    /// Fills `buf` from the slave at `addr`. If `bytewise` is set, the read is issued one byte
    /// at a time, which some monitors require.
    fn read(
        &self,
        fd: BorrowedFd<'_>,
        addr: u8,
        bytewise: bool,
        buf: &mut [u8],
    ) -> Result<(), Status>;

    /// Makes `addr` the target of later calls on `fd`. Strategies that carry the address per
    /// transfer need nothing here.
    fn bind_address(&self, _fd: BorrowedFd<'_>, _addr: u8) -> Result<(), Status> {
        Ok(())
    }
}

/// The built-in I/O strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IoStrategy {
    /// `read(2)`/`write(2)` on the character device, with the slave address bound beforehand.
    #[default]
    FileIo,
    /// A single `I2C_RDWR` block transfer carrying the address per message.
    Ioctl,
}

impl IoStrategy {
    /// Whether this strategy needs the slave address bound on the descriptor at open time.
    #[inline]
    pub fn binds_slave_address(self) -> bool {
        matches!(self, Self::FileIo)
    }
}

impl fmt::Display for IoStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FileIo => f.write_str("fileio"),
            Self::Ioctl => f.write_str("ioctl"),
        }
    }
}

/// Maps a raw `read(2)`/`write(2)`/`ioctl(2)` return value to a status.
#[inline]
pub(crate) fn check_rc(rc: isize) -> Result<usize, Status> {
    if rc < 0 {
        Err(Status::last_os_error())
    } else {
        Ok(rc as usize)
    }
}
