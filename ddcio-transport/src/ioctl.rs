use std::os::fd::{AsRawFd, BorrowedFd};

use ddcio_common::Status;
use tracing::debug;

use crate::{check_rc, I2cIo};

/// `I2C_RDWR` from `<linux/i2c-dev.h>`.
pub(crate) const I2C_RDWR: libc::c_ulong = 0x0707;
/// `I2C_SLAVE` from `<linux/i2c-dev.h>`.
pub(crate) const I2C_SLAVE: libc::c_ulong = 0x0703;

const I2C_M_RD: u16 = 0x0001;

/// `struct i2c_msg` from `<linux/i2c.h>`.
#[repr(C)]
#[allow(non_camel_case_types)]
struct i2c_msg {
    addr: u16,
    flags: u16,
    len: u16,
    buf: *mut u8,
}

/// `struct i2c_rdwr_ioctl_data` from `<linux/i2c-dev.h>`.
#[repr(C)]
#[allow(non_camel_case_types)]
struct i2c_rdwr_ioctl_data {
    msgs: *mut i2c_msg,
    nmsgs: u32,
}

/// Block-transfer strategy. Every transfer carries the slave address, so no address needs to
/// be bound on the descriptor.
#[derive(Debug, Default, Clone, Copy)]
pub struct IoctlIo;

impl IoctlIo {
    fn transfer(fd: BorrowedFd<'_>, addr: u8, flags: u16, buf: &mut [u8]) -> Result<(), Status> {
        let len = u16::try_from(buf.len()).map_err(|_| Status::InvalidArgument("transfer length"))?;
        let mut msg = i2c_msg { addr: addr as u16, flags, len, buf: buf.as_mut_ptr() };
        let mut data = i2c_rdwr_ioctl_data { msgs: &mut msg, nmsgs: 1 };

        // SAFETY: `data` points to one valid message whose buffer outlives the call.
        let rc = unsafe { libc::ioctl(fd.as_raw_fd(), I2C_RDWR as _, &mut data) };
        let rc = check_rc(rc as isize)?;

        // The kernel returns the number of messages transferred.
        if rc != 1 {
            debug!(rc, addr, flags, "I2C_RDWR returned unexpected message count");
        }

        Ok(())
    }
}

impl I2cIo for IoctlIo {
    fn name(&self) -> &'static str {
        "ioctl"
    }

    fn write(&self, fd: BorrowedFd<'_>, addr: u8, bytes: &[u8]) -> Result<(), Status> {
        let mut buf = bytes.to_vec();
        Self::transfer(fd, addr, 0, &mut buf)
    }

    fn read(
        &self,
        fd: BorrowedFd<'_>,
        addr: u8,
        bytewise: bool,
        buf: &mut [u8],
    ) -> Result<(), Status> {
        if bytewise {
            for chunk in buf.chunks_mut(1) {
                Self::transfer(fd, addr, I2C_M_RD, chunk)?;
            }
            return Ok(());
        }

        Self::transfer(fd, addr, I2C_M_RD, buf)
    }
}
