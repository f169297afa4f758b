use std::io;

use thiserror::Error;

/// Base of the DDC protocol status range. Protocol codes are `-(DDC_RANGE_START + n)`.
pub const DDC_RANGE_START: i32 = 3000;

/// The closed set of result kinds produced by I/O primitives, protocol checks and the
/// retry engine.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Status {
    /// `EIO` from the kernel.
    #[error("I/O error")]
    IoError,
    /// `ETIMEDOUT` from the kernel.
    #[error("timed out")]
    Timeout,
    /// A read or write transferred fewer bytes than requested.
    #[error("bad byte count")]
    BadByteCount,
    /// `EBUSY` from the kernel.
    #[error("device busy")]
    DeviceBusy,
    /// The monitor answered with the DDC null message.
    #[error("DDC null response")]
    NullResponse,
    /// Every byte of the response was zero.
    #[error("read all zero")]
    ReadAllZero,
    /// Malformed DDC packet (checksum, envelope, length).
    #[error("invalid DDC data")]
    DdcData,
    /// The device disappeared (`ENODEV`, `ENXIO`). Fatal.
    #[error("device gone (errno {0})")]
    DeviceGone(i32),
    /// Any other errno.
    #[error("errno {0}")]
    Errno(i32),
    /// The retry budget was used up.
    #[error("maximum retries exceeded")]
    RetriesExhausted,
    /// Every attempt of an exhausted loop read back all zeros.
    #[error("all tries returned zero")]
    AllTriesZero,
    /// The monitor reported the feature as unsupported.
    #[error("determined unsupported")]
    DeterminedUnsupported,
    /// An operation was requested for an unsupported I/O mode.
    #[error("invalid I/O mode")]
    InvalidMode,
    /// Programmer error: an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// Programmer error: the operation is not valid in the current state.
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),
    /// The device is locked by another process.
    #[error("device locked by another process")]
    Locked,
    /// Persistent data failed validation.
    #[error("bad data")]
    BadData,
}

/// How the retry engine treats a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    /// The attempt may be repeated.
    Retryable,
    /// The operation itself signals that its own retries are used up.
    Exhausted,
    /// Terminal for the current operation.
    Fatal,
}

impl Status {
    /// Normalises a raw (positive) errno value.
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::EBUSY => Self::DeviceBusy,
            libc::ENXIO | libc::ENODEV => Self::DeviceGone(errno),
            libc::EIO => Self::IoError,
            libc::ETIMEDOUT => Self::Timeout,
            e => Self::Errno(e),
        }
    }

    /// Normalises the calling thread's last OS error.
    pub fn last_os_error() -> Self {
        io::Error::last_os_error().into()
    }

    /// The integer code of this status: a negative errno for OS errors and a negative code
    /// in the DDC range for protocol errors.
    pub fn code(&self) -> i32 {
        match self {
            Self::IoError => -libc::EIO,
            Self::Timeout => -libc::ETIMEDOUT,
            Self::DeviceBusy => -libc::EBUSY,
            Self::DeviceGone(e) | Self::Errno(e) => -e,
            Self::DdcData => -(DDC_RANGE_START + 31),
            Self::NullResponse => -(DDC_RANGE_START + 6),
            Self::AllTriesZero => -(DDC_RANGE_START + 8),
            Self::ReadAllZero => -(DDC_RANGE_START + 11),
            Self::BadByteCount => -(DDC_RANGE_START + 12),
            Self::InvalidMode => -(DDC_RANGE_START + 14),
            Self::RetriesExhausted => -(DDC_RANGE_START + 15),
            Self::DeterminedUnsupported => -(DDC_RANGE_START + 17),
            Self::InvalidArgument(_) => -(DDC_RANGE_START + 18),
            Self::InvalidOperation(_) => -(DDC_RANGE_START + 19),
            Self::Locked => -(DDC_RANGE_START + 34),
            Self::BadData => -(DDC_RANGE_START + 35),
        }
    }

    /// Short symbolic name, used in chain summaries.
    pub fn name(&self) -> &'static str {
        match self {
            Self::IoError => "EIO",
            Self::Timeout => "ETIMEDOUT",
            Self::BadByteCount => "BadByteCount",
            Self::DeviceBusy => "EBUSY",
            Self::NullResponse => "NullResponse",
            Self::ReadAllZero => "ReadAllZero",
            Self::DdcData => "DdcData",
            Self::DeviceGone(e) if *e == libc::ENXIO => "ENXIO",
            Self::DeviceGone(_) => "ENODEV",
            Self::Errno(_) => "Errno",
            Self::RetriesExhausted => "RetriesExhausted",
            Self::AllTriesZero => "AllTriesZero",
            Self::DeterminedUnsupported => "DeterminedUnsupported",
            Self::InvalidMode => "InvalidMode",
            Self::InvalidArgument(_) => "InvalidArgument",
            Self::InvalidOperation(_) => "InvalidOperation",
            Self::Locked => "Locked",
            Self::BadData => "BadData",
        }
    }

    /// Classifies this status for the retry engine. The partition is total and disjoint.
    pub fn partition(&self) -> Partition {
        match self {
            Self::RetriesExhausted | Self::AllTriesZero => Partition::Exhausted,
            Self::DeviceGone(_) |
            Self::DeterminedUnsupported |
            Self::InvalidMode |
            Self::InvalidArgument(_) |
            Self::InvalidOperation(_) |
            Self::Locked |
            Self::BadData => Partition::Fatal,
            Self::IoError |
            Self::Timeout |
            Self::BadByteCount |
            Self::DeviceBusy |
            Self::NullResponse |
            Self::ReadAllZero |
            Self::DdcData |
            Self::Errno(_) => Partition::Retryable,
        }
    }

    #[inline]
    pub fn is_retryable(&self) -> bool {
        self.partition() == Partition::Retryable
    }

    #[inline]
    pub fn is_fatal(&self) -> bool {
        self.partition() == Partition::Fatal
    }

    /// Programmer errors bubble up unwrapped and are never counted as device failures.
    #[inline]
    pub fn is_programmer_error(&self) -> bool {
        matches!(self, Self::InvalidMode | Self::InvalidArgument(_) | Self::InvalidOperation(_))
    }
}

impl From<io::Error> for Status {
    fn from(e: io::Error) -> Self {
        match e.raw_os_error() {
            Some(errno) => Self::from_errno(errno),
            None => match e.kind() {
                io::ErrorKind::TimedOut => Self::Timeout,
                io::ErrorKind::UnexpectedEof | io::ErrorKind::WriteZero => Self::BadByteCount,
                _ => Self::IoError,
            },
        }
    }
}
