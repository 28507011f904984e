//! USB sysfs introspection for serial devices.
//!
//! Grounded on `flashtool.py`'s `get_usb_path`/`get_usb_info`/
//! `get_stable_usb_symlink` and the sysfs-walking style of
//! `ports/list_linux.rs` in the `btcven-ti-bootloader` pack.

use std::fs;
use std::path::{Path, PathBuf};

pub const KLIPPER_USB_ID: &str = "1d50:614e";
pub const KATAPULT_USB_ID: &str = "1d50:6177";

#[derive(Debug, Default, Clone)]
pub struct UsbInfo {
    pub usb_id: Option<String>,
    pub manufacturer: String,
    pub product: String,
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_lowercase())
}

/// Walk up from `/sys/class/tty/<name>` looking for the ancestor directory
/// that carries `busnum`/`devnum` (the USB device node itself).
pub fn usb_device_path(device: &Path) -> Option<PathBuf> {
    let device = fs::canonicalize(device).ok()?;
    let name = device.file_name()?;
    let sys_path = Path::new("/sys/class/tty").join(name);
    if !sys_path.exists() {
        return None;
    }
    let sys_path = fs::canonicalize(sys_path).ok()?;
    for ancestor in sys_path.ancestors() {
        if ancestor.join("devnum").is_file() && ancestor.join("busnum").is_file() {
            return Some(ancestor.to_path_buf());
        }
    }
    None
}

pub fn usb_info(usb_path: &Path) -> UsbInfo {
    let mut info = UsbInfo {
        manufacturer: "unknown".to_string(),
        product: "unknown".to_string(),
        usb_id: None,
    };
    let vid = read_trimmed(&usb_path.join("idVendor"));
    let pid = read_trimmed(&usb_path.join("idProduct"));
    if let (Some(vid), Some(pid)) = (&vid, &pid) {
        info.usb_id = Some(format!("{vid}:{pid}"));
    }
    if let Some(mfr) = read_trimmed(&usb_path.join("manufacturer")) {
        info.manufacturer = mfr;
    }
    if let Some(product) = read_trimmed(&usb_path.join("product")) {
        info.product = product;
    }
    info
}

/// Prefer the stable `/dev/serial/by-path/...` symlink for `device` so that
/// a USB reconnect (after the Klipper->Katapult bootloader jump) resolves
/// to the same physical port.
pub fn stable_symlink(device: &Path) -> PathBuf {
    let Ok(resolved) = fs::canonicalize(device) else {
        return device.to_path_buf();
    };
    let by_path = Path::new("/dev/serial/by-path");
    if let Ok(entries) = fs::read_dir(by_path) {
        for entry in entries.flatten() {
            if let Ok(target) = fs::canonicalize(entry.path()) {
                if target == resolved {
                    return entry.path();
                }
            }
        }
    }
    device.to_path_buf()
}

/// STM32 parts whose usbfs is double-buffered need a dummy command sent
/// before CONNECT to flush their reply pipeline (every STM32 except the
/// f2/f4/h7 families).
pub fn has_double_buffering(product: &str) -> bool {
    let Some(variant) = product.strip_prefix("stm32") else {
        return false;
    };
    !matches!(variant.get(0..2), Some("f2") | Some("f4") | Some("h7"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_buffering_excludes_f2_f4_h7() {
        assert!(has_double_buffering("stm32g0b1xx"));
        assert!(!has_double_buffering("stm32f429xx"));
        assert!(!has_double_buffering("stm32h743xx"));
        assert!(!has_double_buffering("atsamd21"));
    }
}
