//! Raw SocketCAN file descriptor: an unsafe libc socket bound to a named
//! CAN interface, with a fixed 16-byte kernel frame layout read/written
//! directly.

use crate::error::KatapultError;
use std::ffi::CString;
use std::io;
use std::mem::size_of;
use std::os::unix::io::{AsRawFd, RawFd};

pub(crate) const PF_CAN: libc::c_int = 29;
pub(crate) const CAN_RAW: libc::c_int = 1;

/// Kernel `struct can_frame` is 16 bytes: `can_id:u32 | dlc:u8 | pad[3] | data[8]`.
pub const KERNEL_FRAME_LEN: usize = 16;

/// EFF (extended frame format) flag, set on `can_id` for IDs above 0x7FF.
pub const EFF_FLAG: u32 = 0x8000_0000;
/// Mask applied to `can_id` on receive.
pub const EFF_MASK: u32 = 0x1FFF_FFFF;

#[repr(C)]
struct SockAddrCan {
    can_family: libc::sa_family_t,
    can_ifindex: libc::c_int,
    _can_addr: [u8; 16],
}

pub struct RawCanSocket {
    fd: RawFd,
}

impl RawCanSocket {
    pub fn open(interface_name: &str) -> Result<Self, KatapultError> {
        let ifindex = interface_index(interface_name)?;

        let fd = unsafe { libc::socket(PF_CAN, libc::SOCK_RAW, CAN_RAW) };
        if fd == -1 {
            return Err(KatapultError::transport_io(
                interface_name,
                io::Error::last_os_error(),
            ));
        }

        let addr = SockAddrCan {
            can_family: libc::AF_CAN as libc::sa_family_t,
            can_ifindex: ifindex,
            _can_addr: [0u8; 16],
        };
        let bind_result = unsafe {
            libc::bind(
                fd,
                &addr as *const SockAddrCan as *const libc::sockaddr,
                size_of::<SockAddrCan>() as libc::socklen_t,
            )
        };
        if bind_result == -1 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(KatapultError::invalid_input(format!(
                "unable to bind socket to {interface_name}: {err}"
            )));
        }

        let socket = RawCanSocket { fd };
        socket.set_nonblocking()?;
        Ok(socket)
    }

    fn set_nonblocking(&self) -> Result<(), KatapultError> {
        let flags = unsafe { libc::fcntl(self.fd, libc::F_GETFL) };
        if flags == -1 {
            return Err(KatapultError::transport_io("can", io::Error::last_os_error()));
        }
        let result = unsafe { libc::fcntl(self.fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        if result == -1 {
            return Err(KatapultError::transport_io("can", io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Non-blocking read of up to `buf.len()` raw bytes (multiple 16-byte
    /// kernel frames may be returned in one call).
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

impl Drop for RawCanSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

impl AsRawFd for RawCanSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

fn interface_index(name: &str) -> Result<libc::c_int, KatapultError> {
    let cname = CString::new(name)
        .map_err(|_| KatapultError::invalid_input(format!("invalid interface name '{name}'")))?;
    let index = unsafe { libc::if_nametoindex(cname.as_ptr()) };
    if index == 0 {
        return Err(KatapultError::invalid_input(format!(
            "no such CAN interface '{name}'"
        )));
    }
    Ok(index as libc::c_int)
}

/// Pack a logical CAN id + up to 8 payload bytes into the 16-byte kernel
/// frame layout.
pub fn pack_kernel_frame(can_id: u32, data: &[u8]) -> [u8; KERNEL_FRAME_LEN] {
    debug_assert!(data.len() <= 8);
    let mut frame = [0u8; KERNEL_FRAME_LEN];
    let id = if can_id > 0x7FF { can_id | EFF_FLAG } else { can_id };
    frame[0..4].copy_from_slice(&id.to_le_bytes());
    frame[4] = data.len() as u8;
    frame[8..8 + data.len()].copy_from_slice(data);
    frame
}

/// Unpack a 16-byte kernel frame into (masked can_id, dlc, data buffer).
pub fn unpack_kernel_frame(raw: &[u8]) -> (u32, u8, [u8; 8]) {
    debug_assert_eq!(raw.len(), KERNEL_FRAME_LEN);
    let can_id = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) & EFF_MASK;
    let dlc = raw[4];
    let mut data = [0u8; 8];
    data.copy_from_slice(&raw[8..16]);
    (can_id, dlc, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_round_trip() {
        let payload = [1, 2, 3, 4, 5];
        let raw = pack_kernel_frame(0x123, &payload);
        let (id, dlc, data) = unpack_kernel_frame(&raw);
        assert_eq!(id, 0x123);
        assert_eq!(dlc, 5);
        assert_eq!(&data[..5], &payload);
    }

    #[test]
    fn extended_id_sets_eff_flag_on_wire() {
        let raw = pack_kernel_frame(0x1FFFFF00, &[]);
        let id_field = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        assert_ne!(id_field & EFF_FLAG, 0);
    }
}
