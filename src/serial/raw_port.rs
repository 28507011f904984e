//! Exclusive raw serial port I/O.
//!
//! Grounded on `flashtool.py::SerialSocket._open_device`/`_request_usb_bootloader`,
//! which opens the device with pyserial's `exclusive=True` and drives DTR
//! and line speed through raw `termios`/`fcntl` calls. Arbitrary baud rates
//! (e.g. Katapult's default 250000) are not representable by the fixed
//! `Bxxx` constants in POSIX termios, so this uses the Linux `termios2`
//! ioctl pair (`TCGETS2`/`TCSETS2`) with `BOTHER`, the same mechanism
//! userspace serial libraries fall back to for non-standard speeds.

use crate::error::KatapultError;
use std::ffi::CString;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

pub struct RawSerialPort {
    fd: RawFd,
}

impl RawSerialPort {
    /// Open `path` exclusively, configure it raw at `baud`, and leave it
    /// non-blocking.
    pub fn open(path: &str, baud: u32) -> Result<Self, KatapultError> {
        let cpath = CString::new(path)
            .map_err(|_| KatapultError::invalid_input(format!("invalid device path '{path}'")))?;
        let fd = unsafe {
            libc::open(
                cpath.as_ptr(),
                libc::O_RDWR | libc::O_NOCTTY | libc::O_NONBLOCK,
            )
        };
        if fd == -1 {
            return Err(KatapultError::transport_io(path, io::Error::last_os_error()));
        }

        if unsafe { libc::ioctl(fd, libc::TIOCEXCL) } == -1 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(KatapultError::invalid_input(format!(
                "serial device {path} is already open exclusively: {err}"
            )));
        }

        let port = RawSerialPort { fd };
        if let Err(e) = port.configure_raw(baud) {
            return Err(e);
        }
        Ok(port)
    }

    fn configure_raw(&self, baud: u32) -> Result<(), KatapultError> {
        set_baud(self.fd, baud)?;
        Ok(())
    }

    pub fn assert_dtr(&self) -> Result<(), KatapultError> {
        set_dtr(self.fd, true)
    }

    pub fn deassert_dtr(&self) -> Result<(), KatapultError> {
        set_dtr(self.fd, false)
    }

    pub fn set_baud(&self, baud: u32) -> Result<(), KatapultError> {
        set_baud(self.fd, baud)
    }

    pub fn raw_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    pub fn raw_write(&self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe { libc::write(self.fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

impl Drop for RawSerialPort {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

impl AsRawFd for RawSerialPort {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

fn set_dtr(fd: RawFd, on: bool) -> Result<(), KatapultError> {
    let bit: libc::c_int = libc::TIOCM_DTR;
    let request = if on { libc::TIOCMBIS } else { libc::TIOCMBIC };
    if unsafe { libc::ioctl(fd, request as _, &bit) } == -1 {
        return Err(KatapultError::transport_io("serial", io::Error::last_os_error()));
    }
    Ok(())
}

fn set_baud(fd: RawFd, baud: u32) -> Result<(), KatapultError> {
    let mut tio: libc::termios2 = unsafe { std::mem::zeroed() };
    if unsafe { libc::ioctl(fd, libc::TCGETS2 as _, &mut tio) } == -1 {
        return Err(KatapultError::transport_io("serial", io::Error::last_os_error()));
    }

    // Raw mode: no input/output processing, no line editing, no signal
    // generation, 8 data bits, one read returns as soon as any byte is
    // available.
    tio.c_iflag &= !(libc::IGNBRK
        | libc::BRKINT
        | libc::PARMRK
        | libc::ISTRIP
        | libc::INLCR
        | libc::IGNCR
        | libc::ICRNL
        | libc::IXON);
    tio.c_oflag &= !libc::OPOST;
    tio.c_lflag &= !(libc::ECHO | libc::ECHONL | libc::ICANON | libc::ISIG | libc::IEXTEN);
    tio.c_cflag &= !(libc::CSIZE | libc::PARENB);
    tio.c_cflag |= libc::CS8 | libc::CREAD | libc::CLOCAL;
    tio.c_cc[libc::VMIN] = 0;
    tio.c_cc[libc::VTIME] = 0;

    tio.c_cflag &= !libc::CBAUD;
    tio.c_cflag |= libc::BOTHER;
    tio.c_ispeed = baud;
    tio.c_ospeed = baud;

    if unsafe { libc::ioctl(fd, libc::TCSETS2 as _, &tio) } == -1 {
        return Err(KatapultError::transport_io("serial", io::Error::last_os_error()));
    }
    Ok(())
}
