//! Flash engine: CONNECT negotiation, SEND/VERIFY loops and the session
//! state machine.
//!
//! Grounded on `flashtool.py::CanFlasher`.

use crate::command::CommandEngine;
use crate::dictionary::{self, KlipperDict};
use crate::error::KatapultError;
use crate::frame;
use crate::uuid::Uuid48;
use byteorder::{ByteOrder, LittleEndian};
use sha1::{Digest, Sha1};
use std::io::Write;
use std::path::PathBuf;

const VALID_BLOCK_SIZES: [u32; 4] = [64, 128, 256, 512];
const BLOCK_RETRY_ATTEMPTS: u32 = 3;
const BLOCK_RETRY_BACKOFF: std::time::Duration = std::time::Duration::from_millis(100);

/// Three-byte protocol version, preserving the CONNECT reply's reversed
/// byte order (`ver_bytes[2], ver_bytes[1], ver_bytes[0]`): see DESIGN.md.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProtocolVersion(pub u8, pub u8, pub u8);

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.0, self.1, self.2)
    }
}

#[derive(Debug, Clone)]
pub struct ConnectInfo {
    pub proto_version: ProtocolVersion,
    pub app_start_addr: u32,
    pub block_size: u32,
    pub mcu_type: String,
    pub software_version: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Disconnected,
    Connected,
    Writing,
    Written,
    Verifying,
    Verified,
    Completed,
}

pub struct FlashEngine {
    engine: CommandEngine,
    state: EngineState,
    firmware_path: PathBuf,
    firmware: Vec<u8>,
    klipper_dict: Option<KlipperDict>,
    connect_info: Option<ConnectInfo>,
    block_count: u32,
    fw_sha: Sha1,
}

impl FlashEngine {
    pub fn new(engine: CommandEngine, firmware_path: PathBuf) -> Result<Self, KatapultError> {
        let firmware = std::fs::read(&firmware_path).map_err(|e| {
            KatapultError::invalid_input(format!(
                "unable to read firmware file {}: {e}",
                firmware_path.display()
            ))
        })?;

        let klipper_dict = if firmware_path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.eq_ignore_ascii_case("klipper.bin"))
            .unwrap_or(false)
        {
            let dict = dictionary::extract(&firmware);
            if let Some(ref d) = dict {
                log::info!(
                    "Detected Klipper binary version {}, MCU: {}",
                    d.version,
                    d.config.mcu
                );
            }
            dict
        } else {
            None
        };

        Ok(FlashEngine {
            engine,
            state: EngineState::Disconnected,
            firmware_path,
            firmware,
            klipper_dict,
            connect_info: None,
            block_count: 0,
            fw_sha: Sha1::new(),
        })
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Send the deliberately-invalid prime frame for USB double-buffered
    /// endpoints. Must be called before `connect` if at all.
    pub async fn prime(&mut self) -> Result<(), KatapultError> {
        self.engine.prime().await
    }

    pub async fn connect(&mut self) -> Result<ConnectInfo, KatapultError> {
        output_line("Attempting to connect to bootloader");
        let reply = self.engine.send_command(frame::CMD_CONNECT, &[]).await?;
        if reply.len() < 12 {
            return Err(KatapultError::protocol(format!(
                "CONNECT reply too short: {} bytes",
                reply.len()
            )));
        }

        let ver_bytes = &reply[0..4];
        let app_start_addr = LittleEndian::read_u32(&reply[4..8]);
        let block_size = LittleEndian::read_u32(&reply[8..12]);
        let proto_version = ProtocolVersion(ver_bytes[2], ver_bytes[1], ver_bytes[0]);

        if !VALID_BLOCK_SIZES.contains(&block_size) {
            return Err(KatapultError::protocol(format!(
                "invalid block size: {block_size}"
            )));
        }

        let mcu_info = &reply[12..];
        let (mcu_type, software_version) = if proto_version >= ProtocolVersion(1, 1, 0) {
            let split = mcu_info.iter().position(|&b| b == 0).ok_or_else(|| {
                KatapultError::protocol("CONNECT reply missing MCU/software-version separator")
            })?;
            let mcu_type = String::from_utf8_lossy(&mcu_info[..split]).into_owned();
            let software_version = String::from_utf8_lossy(&mcu_info[split + 1..]).into_owned();
            (mcu_type, Some(software_version))
        } else {
            (String::from_utf8_lossy(mcu_info).into_owned(), None)
        };

        output_line(&format!(
            "Katapult Connected\nSoftware Version: {}\nProtocol Version: {proto_version}\n\
             Block Size: {block_size} bytes\nApplication Start: {app_start_addr:#06x}\nMCU type: {mcu_type}",
            software_version.as_deref().unwrap_or("?"),
        ));

        if let Some(dict) = &self.klipper_dict {
            let bin_mcu = &dict.config.mcu;
            if !bin_mcu.is_empty() && bin_mcu != &mcu_type {
                log::warn!(
                    "MCU returned by Katapult does not match MCU stored in klipper.bin.\n\
                     Katapult MCU: {mcu_type}\nKlipper Binary MCU: {bin_mcu}"
                );
            }
        }

        let info = ConnectInfo {
            proto_version,
            app_start_addr,
            block_size,
            mcu_type,
            software_version,
        };
        self.connect_info = Some(info.clone());
        self.state = EngineState::Connected;
        Ok(info)
    }

    /// CAN-only: confirm the node now answering as our assigned NodeID
    /// really is the device we targeted.
    pub async fn verify_canbus_uuid(&mut self, expected: Uuid48) -> Result<(), KatapultError> {
        output_line("Verifying canbus connection");
        let reply = self.engine.send_command(frame::CMD_GET_CANBUS_ID, &[]).await?;
        if reply.len() < 6 {
            return Err(KatapultError::protocol("GET_CANBUS_ID reply too short"));
        }
        let mut bytes = [0u8; 6];
        bytes.copy_from_slice(&reply[..6]);
        let actual = Uuid48::from_bytes(bytes);
        if actual != expected {
            return Err(KatapultError::protocol(format!(
                "UUID mismatch ({expected} vs {actual})"
            )));
        }
        Ok(())
    }

    pub async fn send_file(&mut self) -> Result<(), KatapultError> {
        let info = self
            .connect_info
            .clone()
            .ok_or_else(|| KatapultError::protocol("send_file called before connect"))?;
        self.state = EngineState::Writing;

        output_line(&format!("Flashing '{}'...", self.firmware_path.display()));
        output("\n[");

        let file_size = self.firmware.len();
        let block_size = info.block_size as usize;
        let mut last_percent: i64 = 0;
        let mut flash_address = info.app_start_addr;

        for chunk in self.firmware.clone().chunks(block_size) {
            let mut block = chunk.to_vec();
            if block.len() < block_size {
                block.resize(block_size, 0xFF);
            }
            self.fw_sha.update(&block);

            let mut payload = vec![0u8; 4 + block.len()];
            LittleEndian::write_u32(&mut payload[0..4], flash_address);
            payload[4..].copy_from_slice(&block);

            let mut written = false;
            let mut recd_addr = 0u32;
            for _ in 0..BLOCK_RETRY_ATTEMPTS {
                let resp = self.engine.send_command(frame::CMD_SEND_BLOCK, &payload).await?;
                if resp.len() < 4 {
                    return Err(KatapultError::protocol("SEND_BLOCK reply too short"));
                }
                recd_addr = LittleEndian::read_u32(&resp[0..4]);
                if recd_addr == flash_address {
                    written = true;
                    break;
                }
                log::info!(
                    "Block write mismatch: expected {flash_address:#010x}, received {recd_addr:#010x}"
                );
                tokio::time::sleep(BLOCK_RETRY_BACKOFF).await;
            }
            if !written {
                return Err(KatapultError::protocol(format!(
                    "flash write failed, block address {recd_addr:#010x}"
                )));
            }

            flash_address += block_size as u32;
            self.block_count += 1;
            let uploaded = self.block_count as usize * block_size;
            let pct = (uploaded as f64 / file_size as f64 * 100.0 + 0.5) as i64;
            if pct >= last_percent + 2 {
                last_percent += 2;
                output("#");
            }
        }

        let resp = self.engine.send_command(frame::CMD_SEND_EOF, &[]).await?;
        if resp.len() < 4 {
            return Err(KatapultError::protocol("SEND_EOF reply too short"));
        }
        let page_count = LittleEndian::read_u32(&resp[0..4]);
        output_line(&format!("]\n\nWrite complete: {page_count} pages"));

        self.state = EngineState::Written;
        Ok(())
    }

    pub async fn verify_file(&mut self) -> Result<(), KatapultError> {
        let info = self
            .connect_info
            .clone()
            .ok_or_else(|| KatapultError::protocol("verify_file called before connect"))?;
        self.state = EngineState::Verifying;

        output_line(&format!("Verifying (block count = {})...", self.block_count));
        output("\n[");

        let file_size = self.firmware.len().max(1);
        let block_size = info.block_size;
        let mut last_percent: i64 = 0;
        let mut verify_sha = Sha1::new();

        for i in 0..self.block_count {
            let flash_address = i * block_size + info.app_start_addr;
            let mut payload = [0u8; 4];
            LittleEndian::write_u32(&mut payload, flash_address);

            let mut block_bytes: Option<Vec<u8>> = None;
            let mut recd_addr = 0u32;
            for _ in 0..BLOCK_RETRY_ATTEMPTS {
                let resp = self
                    .engine
                    .send_command(frame::CMD_REQUEST_BLOCK, &payload)
                    .await?;
                if resp.len() < 4 {
                    return Err(KatapultError::protocol("REQUEST_BLOCK reply too short"));
                }
                recd_addr = LittleEndian::read_u32(&resp[0..4]);
                if recd_addr == flash_address {
                    block_bytes = Some(resp[4..].to_vec());
                    break;
                }
                log::info!(
                    "Block read mismatch: expected {flash_address:#010x}, received {recd_addr:#010x}"
                );
                tokio::time::sleep(BLOCK_RETRY_BACKOFF).await;
            }
            let Some(block_bytes) = block_bytes else {
                output_line("Error");
                return Err(KatapultError::protocol(format!(
                    "block request error, block: {i} (last address {recd_addr:#010x})"
                )));
            };
            verify_sha.update(&block_bytes);

            let pct = ((i * block_size) as f64 / file_size as f64 * 100.0 + 0.5) as i64;
            if pct >= last_percent + 2 {
                last_percent += 2;
                output("#");
            }
        }

        let verify_hex = hex::encode_upper(verify_sha.finalize());
        let fw_hex = hex::encode_upper(self.fw_sha.clone().finalize());
        if verify_hex != fw_hex {
            return Err(KatapultError::protocol(format!(
                "checksum mismatch: expected {fw_hex}, received {verify_hex}"
            )));
        }
        output_line(&format!("]\n\nVerification Complete: SHA = {verify_hex}"));

        self.state = EngineState::Verified;
        Ok(())
    }

    /// Always attempted on exit, even after an earlier failure: errors here
    /// are logged and swallowed so they never shadow the original one.
    pub async fn finish(&mut self) {
        if self.state == EngineState::Completed {
            return;
        }
        if self.state == EngineState::Disconnected {
            return;
        }
        if let Err(e) = self.engine.send_command(frame::CMD_COMPLETE, &[]).await {
            log::warn!("COMPLETE command failed: {e}");
        }
        self.state = EngineState::Completed;
    }
}

fn output(msg: &str) {
    print!("{msg}");
    let _ = std::io::stdout().flush();
}

fn output_line(msg: &str) {
    println!("{msg}");
}
