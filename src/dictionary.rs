//! Embedded Klipper dictionary extraction.
//!
//! Grounded on `flashtool.py::CanFlasher._check_binary`: a Klipper firmware
//! image carries its MCU dictionary as a zlib-compressed JSON blob appended
//! somewhere past the executable code. The extraction scans every byte
//! offset for the first one that both inflates and parses as JSON with
//! `"app": "Klipper"`. This is advisory only: any failure is swallowed and
//! the flash proceeds without it.

use flate2::read::ZlibDecoder;
use serde::Deserialize;
use std::io::Read;

#[derive(Debug, Clone, Deserialize)]
pub struct KlipperDict {
    pub app: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub config: KlipperConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KlipperConfig {
    #[serde(rename = "MCU", default)]
    pub mcu: String,
}

/// Scan `binary` for the first zlib window that inflates to Klipper's JSON
/// dictionary. Returns `None` on any failure; never panics.
pub fn extract(binary: &[u8]) -> Option<KlipperDict> {
    for start in 0..binary.len() {
        let mut decoder = ZlibDecoder::new(&binary[start..]);
        let mut raw = Vec::new();
        if decoder.read_to_end(&mut raw).is_err() {
            continue;
        }
        match serde_json::from_slice::<KlipperDict>(&raw) {
            Ok(dict) if dict.app == "Klipper" => return Some(dict),
            _ => continue,
        }
    }
    None
}
