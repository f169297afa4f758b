use std::os::fd::{AsRawFd, BorrowedFd};

use ddcio_common::Status;
use tracing::trace;

use crate::{check_rc, ioctl::I2C_SLAVE, I2cIo};

/// Byte-stream strategy. The slave address must already be bound on the descriptor with
/// `I2C_SLAVE`, so `addr` is only used for logging.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileIo;

impl I2cIo for FileIo {
    fn name(&self) -> &'static str {
        "fileio"
    }

    fn write(&self, fd: BorrowedFd<'_>, addr: u8, bytes: &[u8]) -> Result<(), Status> {
        // SAFETY: `bytes` is a valid slice for the duration of the call.
        let rc = unsafe { libc::write(fd.as_raw_fd(), bytes.as_ptr().cast(), bytes.len()) };
        let written = check_rc(rc)?;
        trace!(addr, written, len = bytes.len(), "fileio write");

        if written != bytes.len() {
            return Err(Status::BadByteCount);
        }

        Ok(())
    }

    fn read(
        &self,
        fd: BorrowedFd<'_>,
        addr: u8,
        bytewise: bool,
        buf: &mut [u8],
    ) -> Result<(), Status> {
        if bytewise {
            for (i, byte) in buf.iter_mut().enumerate() {
                // SAFETY: `byte` points to one writable byte.
                let rc = unsafe { libc::read(fd.as_raw_fd(), (byte as *mut u8).cast(), 1) };
                if check_rc(rc)? != 1 {
                    trace!(addr, read = i, len = buf.len(), "fileio bytewise read came up short");
                    return Err(Status::BadByteCount);
                }
            }
            return Ok(());
        }

        // SAFETY: `buf` is a valid writable slice for the duration of the call.
        let rc = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
        let read = check_rc(rc)?;
        trace!(addr, read, len = buf.len(), "fileio read");

        if read != buf.len() {
            return Err(Status::BadByteCount);
        }

        Ok(())
    }

    fn bind_address(&self, fd: BorrowedFd<'_>, addr: u8) -> Result<(), Status> {
        // SAFETY: I2C_SLAVE takes the address by value.
        let rc = unsafe { libc::ioctl(fd.as_raw_fd(), I2C_SLAVE as _, addr as libc::c_ulong) };
        check_rc(rc as isize)?;
        trace!(addr, "fileio slave address bound");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Seek, SeekFrom, Write},
        os::fd::AsFd,
    };

    use super::*;

    #[test]
    fn write_then_read_back() {
        let mut file = tempfile::tempfile().unwrap();
        FileIo.write(file.as_fd(), 0x37, &[0x51, 0x82, 0x01, 0x10]).unwrap();

        file.seek(SeekFrom::Start(0)).unwrap();
        let mut buf = [0u8; 4];
        FileIo.read(file.as_fd(), 0x37, false, &mut buf).unwrap();
        assert_eq!(buf, [0x51, 0x82, 0x01, 0x10]);
    }

    #[test]
    fn short_read_is_bad_byte_count() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&[1, 2]).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(FileIo.read(file.as_fd(), 0x37, false, &mut buf), Err(Status::BadByteCount));
    }

    #[test]
    fn bytewise_read() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&[9, 8, 7]).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();

        let mut buf = [0u8; 3];
        FileIo.read(file.as_fd(), 0x37, true, &mut buf).unwrap();
        assert_eq!(buf, [9, 8, 7]);

        let mut buf = [0u8; 1];
        assert_eq!(FileIo.read(file.as_fd(), 0x37, true, &mut buf), Err(Status::BadByteCount));
    }

    #[test]
    fn binding_needs_an_i2c_device() {
        let file = tempfile::tempfile().unwrap();
        assert_eq!(FileIo.bind_address(file.as_fd(), 0x37), Err(Status::Errno(libc::ENOTTY)));
    }

    #[test]
    fn bytewise_read_short_file() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&[1, 2]).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(FileIo.read(file.as_fd(), 0x37, true, &mut buf), Err(Status::BadByteCount));
        assert_eq!(buf[..2], [1, 2]);
    }
}
