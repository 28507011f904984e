//! Serial/USB transport: exclusive port open, USB bootloader entry, and the
//! async reactor that feeds the endpoint reassembler.

pub mod holder;
pub mod raw_port;
pub mod transport;
pub mod usb;

use crate::error::KatapultError;
use raw_port::RawSerialPort;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
pub use transport::SerialTransport;

/// The fixed magic byte string a non-USB RS-232 device watches for to jump
/// into its bootloader.
pub const SERIAL_BOOTLOADER_REQUEST: &[u8] = b"~ \x1c Request Serial Bootloader!! ~";

fn output(msg: &str) {
    print!("{msg}");
    let _ = std::io::stdout().flush();
}

fn output_line(msg: &str) {
    println!("{msg}");
}

/// Result of opening a serial device for flashing.
pub enum SerialOpen {
    /// Ready to flash; `needs_priming` is set for USB double-buffered
    /// STM32 parts per `usb::has_double_buffering`.
    Ready {
        transport: Arc<SerialTransport>,
        needs_priming: bool,
    },
    /// `--request-bootloader` was satisfied and there is nothing left to do.
    RequestSatisfied,
}

/// Validate the device isn't held by another process, perform USB
/// bootloader entry if this is a Klipper/Katapult USB-CDC device, and open
/// the resulting port. Mirrors `flashtool.py::SerialSocket.run`.
pub async fn open(device: &str, baud: u32, request_only: bool) -> Result<SerialOpen, KatapultError> {
    let device_path = PathBuf::from(device);
    if let Some(holder) = holder::find_holder(&device_path).await? {
        return Err(KatapultError::invalid_input(format!(
            "serial device {device} is in use by another program ({holder})"
        )));
    }

    let usb_dev_path = usb::usb_device_path(&device_path);
    let info = usb_dev_path.as_deref().map(usb::usb_info).unwrap_or_default();

    let mut actual_device = device.to_string();
    let mut usb_product = String::new();

    let is_klipper = info.manufacturer == "klipper" || info.usb_id.as_deref() == Some(usb::KLIPPER_USB_ID);
    let is_katapult = info.manufacturer == "katapult" || info.usb_id.as_deref() == Some(usb::KATAPULT_USB_ID);

    if is_klipper {
        output_line("Detected USB device running Klipper");
        let usb_dev_path = usb_dev_path.expect("usb id matched implies a usb sysfs path");
        let stable = request_usb_bootloader(&device_path, &usb_dev_path).await?;
        actual_device = stable.to_string_lossy().into_owned();
        if request_only {
            return Ok(SerialOpen::RequestSatisfied);
        }
    } else if is_katapult {
        output_line("Detected USB device running Katapult");
        if request_only {
            return Ok(SerialOpen::RequestSatisfied);
        }
    } else if request_only {
        request_serial_bootloader(device, baud).await?;
        return Ok(SerialOpen::RequestSatisfied);
    } else {
        usb_product = info.product;
    }

    let port = RawSerialPort::open(&actual_device, baud)?;
    let transport = SerialTransport::from_port(port)?;
    Ok(SerialOpen::Ready {
        transport,
        needs_priming: usb::has_double_buffering(&usb_product),
    })
}

async fn request_usb_bootloader(device: &Path, usb_dev_path: &Path) -> Result<PathBuf, KatapultError> {
    output_line(&format!("Requesting USB bootloader for {}...", device.display()));
    let stable = usb::stable_symlink(device);

    if let Ok(port) = RawSerialPort::open(&device.to_string_lossy(), 1200) {
        let _ = port.assert_dtr();
        let _ = port.set_baud(1200);
        let _ = port.deassert_dtr();
    }

    output("Waiting for USB Reconnect.");
    let mut detected = false;
    for _ in 0..8 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        output(".");
        let info = usb::usb_info(usb_dev_path);
        if info.manufacturer == "katapult" {
            output_line("Katapult detected");
            tokio::time::sleep(Duration::from_secs(1)).await;
            detected = true;
            break;
        }
    }
    if !detected {
        output_line("timed out");
    }
    Ok(stable)
}

async fn request_serial_bootloader(device: &str, baud: u32) -> Result<(), KatapultError> {
    output_line(&format!("Requesting serial bootloader for device {device}..."));
    let port = RawSerialPort::open(device, baud)?;
    let mut written = 0;
    while written < SERIAL_BOOTLOADER_REQUEST.len() {
        match port.raw_write(&SERIAL_BOOTLOADER_REQUEST[written..]) {
            Ok(n) => written += n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Err(e) => return Err(KatapultError::transport_io(device, e)),
        }
    }
    tokio::time::sleep(Duration::from_secs(1)).await;
    Ok(())
}
