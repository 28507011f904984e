//! End-to-end exercises against a scripted in-memory bootloader, covering
//! the CAN happy path, retry-under-corruption, busy backoff, UUID
//! discovery rejection, verify-mismatch, and USB double-buffer priming.

use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian};
use katapult_flash::can::{require_discovered, AppType, DiscoveredDevice};
use katapult_flash::command::CommandEngine;
use katapult_flash::endpoint::{Endpoint, EndpointId, Transport};
use katapult_flash::error::KatapultError;
use katapult_flash::flash::{EngineState, FlashEngine};
use katapult_flash::frame;
use katapult_flash::serial::usb;
use katapult_flash::uuid::Uuid48;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

struct TempFirmware(PathBuf);

impl TempFirmware {
    fn new(name: &str, bytes: &[u8]) -> Self {
        let path = std::env::temp_dir().join(format!("katapult_flash_test_{name}.bin"));
        std::fs::write(&path, bytes).expect("write temp firmware");
        TempFirmware(path)
    }

    fn path(&self) -> PathBuf {
        self.0.clone()
    }
}

impl Drop for TempFirmware {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

struct Inner {
    blocks: HashMap<u32, Vec<u8>>,
    crc_corrupt_next_send_block: bool,
    busy_remaining: u32,
    verify_corrupt_addr: Option<u32>,
    complete_count: u32,
}

/// Scripted Katapult device: replies to CONNECT/SEND_BLOCK/SEND_EOF/
/// REQUEST_BLOCK/GET_CANBUS_ID/COMPLETE/PRIME the way a real bootloader
/// would, with a few injectable faults for retry/corruption scenarios.
struct BootloaderSim {
    endpoint: Endpoint,
    block_size: u32,
    app_start_addr: u32,
    mcu_type: String,
    canbus_uuid: Option<Uuid48>,
    inner: Mutex<Inner>,
}

impl BootloaderSim {
    fn new(endpoint: Endpoint, block_size: u32, app_start_addr: u32, mcu_type: &str) -> Self {
        BootloaderSim {
            endpoint,
            block_size,
            app_start_addr,
            mcu_type: mcu_type.to_string(),
            canbus_uuid: None,
            inner: Mutex::new(Inner {
                blocks: HashMap::new(),
                crc_corrupt_next_send_block: false,
                busy_remaining: 0,
                verify_corrupt_addr: None,
                complete_count: 0,
            }),
        }
    }

    fn with_canbus_uuid(mut self, uuid: Uuid48) -> Self {
        self.canbus_uuid = Some(uuid);
        self
    }

    fn with_crc_corrupt_first_send_block(self) -> Self {
        self.inner.lock().unwrap().crc_corrupt_next_send_block = true;
        self
    }

    fn with_busy_replies(self, n: u32) -> Self {
        self.inner.lock().unwrap().busy_remaining = n;
        self
    }

    fn with_verify_corruption_at(self, addr: u32) -> Self {
        self.inner.lock().unwrap().verify_corrupt_addr = Some(addr);
        self
    }

    fn send_block_addresses(&self) -> Vec<u32> {
        let inner = self.inner.lock().unwrap();
        let mut addrs: Vec<u32> = inner.blocks.keys().copied().collect();
        addrs.sort_unstable();
        addrs
    }

    fn block_at(&self, addr: u32) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().blocks.get(&addr).cloned()
    }

    fn complete_count(&self) -> u32 {
        self.inner.lock().unwrap().complete_count
    }

    fn connect_reply_wire(&self) -> Vec<u8> {
        let mut body = vec![0, 1, 1, 0]; // ver_bytes => proto_version (1,1,0)
        body.extend_from_slice(&self.app_start_addr.to_le_bytes());
        body.extend_from_slice(&self.block_size.to_le_bytes());
        body.extend_from_slice(self.mcu_type.as_bytes());
        body.push(0); // separator before the (unused) software version
        body.extend_from_slice(b"v0.0.0");
        while body.len() % 4 != 0 {
            body.push(0);
        }
        let mut payload = (frame::CMD_CONNECT as u32).to_le_bytes().to_vec();
        payload.extend_from_slice(&body);
        frame::encode(frame::ACK_SUCCESS, &payload)
    }
}

#[async_trait]
impl Transport for BootloaderSim {
    async fn send(&self, _id: EndpointId, wire: &[u8]) -> Result<(), KatapultError> {
        let decoded = match frame::scan(wire) {
            frame::Scan::Frame { frame, .. } => frame,
            _ => panic!("test harness sent a malformed frame"),
        };

        if decoded.cmd == frame::CMD_PRIME {
            self.endpoint.feed(&frame::encode(frame::ACK_ERROR, &[]));
            return Ok(());
        }

        let mut inner = self.inner.lock().unwrap();
        match decoded.cmd {
            frame::CMD_CONNECT => {
                drop(inner);
                self.endpoint.feed(&self.connect_reply_wire());
            }
            frame::CMD_GET_CANBUS_ID => {
                let uuid = self.canbus_uuid.expect("canbus uuid configured for this test");
                let mut payload = (frame::CMD_GET_CANBUS_ID as u32).to_le_bytes().to_vec();
                payload.extend_from_slice(uuid.as_bytes());
                payload.extend_from_slice(&[0, 0]);
                self.endpoint.feed(&frame::encode(frame::ACK_SUCCESS, &payload));
            }
            frame::CMD_SEND_BLOCK => {
                let addr = LittleEndian::read_u32(&decoded.payload[0..4]);
                let block = decoded.payload[4..].to_vec();

                if inner.busy_remaining > 0 {
                    inner.busy_remaining -= 1;
                    self.endpoint.feed(&frame::encode(frame::ACK_BUSY, &[]));
                    return Ok(());
                }
                if inner.crc_corrupt_next_send_block {
                    inner.crc_corrupt_next_send_block = false;
                    let mut payload = (frame::CMD_SEND_BLOCK as u32).to_le_bytes().to_vec();
                    payload.extend_from_slice(&addr.to_le_bytes());
                    let mut wire = frame::encode(frame::ACK_SUCCESS, &payload);
                    let crc_byte = wire.len() - 4;
                    wire[crc_byte] ^= 0xFF;
                    self.endpoint.feed(&wire);
                    return Ok(());
                }

                inner.blocks.insert(addr, block);
                let mut payload = (frame::CMD_SEND_BLOCK as u32).to_le_bytes().to_vec();
                payload.extend_from_slice(&addr.to_le_bytes());
                self.endpoint.feed(&frame::encode(frame::ACK_SUCCESS, &payload));
            }
            frame::CMD_SEND_EOF => {
                let page_count = inner.blocks.len() as u32;
                let mut payload = (frame::CMD_SEND_EOF as u32).to_le_bytes().to_vec();
                payload.extend_from_slice(&page_count.to_le_bytes());
                self.endpoint.feed(&frame::encode(frame::ACK_SUCCESS, &payload));
            }
            frame::CMD_REQUEST_BLOCK => {
                let addr = LittleEndian::read_u32(&decoded.payload[0..4]);
                let mut block = inner
                    .blocks
                    .get(&addr)
                    .cloned()
                    .unwrap_or_else(|| vec![0u8; self.block_size as usize]);
                if inner.verify_corrupt_addr == Some(addr) {
                    block[0] ^= 0xFF;
                    inner.verify_corrupt_addr = None;
                }
                let mut payload = (frame::CMD_REQUEST_BLOCK as u32).to_le_bytes().to_vec();
                payload.extend_from_slice(&addr.to_le_bytes());
                payload.extend_from_slice(&block);
                self.endpoint.feed(&frame::encode(frame::ACK_SUCCESS, &payload));
            }
            frame::CMD_COMPLETE => {
                inner.complete_count += 1;
                let payload = (frame::CMD_COMPLETE as u32).to_le_bytes().to_vec();
                self.endpoint.feed(&frame::encode(frame::ACK_SUCCESS, &payload));
            }
            other => panic!("unexpected command {other:#04x} sent to mock device"),
        }
        Ok(())
    }

    async fn close(&self) {
        self.endpoint.close();
    }
}

/// CAN happy path: 130 bytes of 0xAA, block size 64, three blocks,
/// last one padded with 0xFF; verify reproduces the same padded bytes.
#[tokio::test(start_paused = true)]
async fn can_happy_path_writes_padded_blocks_and_verifies() {
    let firmware = vec![0xAAu8; 130];
    let fw = TempFirmware::new("happy_path", &firmware);
    let endpoint = Endpoint::new(EndpointId::CanNode(128));
    let sim = Arc::new(BootloaderSim::new(endpoint.clone(), 64, 0x08002000, "stm32f103xe"));
    let engine = CommandEngine::new(sim.clone() as Arc<dyn Transport>, EndpointId::CanNode(128), endpoint);
    let mut flash = FlashEngine::new(engine, fw.path()).unwrap();

    let info = flash.connect().await.unwrap();
    assert_eq!(info.block_size, 64);
    assert_eq!(info.mcu_type, "stm32f103xe");

    flash.send_file().await.unwrap();
    flash.verify_file().await.unwrap();
    flash.finish().await;

    assert_eq!(flash.state(), EngineState::Completed);
    assert_eq!(sim.send_block_addresses(), vec![0x08002000, 0x08002040, 0x08002080]);
    let last_block = sim.block_at(0x08002080).unwrap();
    assert_eq!(&last_block[..2], &[0xAA, 0xAA]);
    assert!(last_block[2..].iter().all(|&b| b == 0xFF));
    assert_eq!(sim.complete_count(), 1);
}

/// CRC corruption on the first SEND_BLOCK reply; the engine retries
/// and the block count still advances by exactly one.
#[tokio::test(start_paused = true)]
async fn send_block_retries_past_crc_corruption() {
    let firmware = vec![0xAAu8; 130];
    let fw = TempFirmware::new("crc_retry", &firmware);
    let endpoint = Endpoint::new(EndpointId::CanNode(128));
    let sim = Arc::new(
        BootloaderSim::new(endpoint.clone(), 64, 0x08002000, "stm32f103xe")
            .with_crc_corrupt_first_send_block(),
    );
    let engine = CommandEngine::new(sim.clone() as Arc<dyn Transport>, EndpointId::CanNode(128), endpoint);
    let mut flash = FlashEngine::new(engine, fw.path()).unwrap();

    flash.connect().await.unwrap();
    flash.send_file().await.unwrap();
    flash.verify_file().await.unwrap();

    assert_eq!(sim.send_block_addresses(), vec![0x08002000, 0x08002040, 0x08002080]);
}

/// ACK_BUSY twice, success on the third attempt; block count still
/// advances by exactly one for that block.
#[tokio::test(start_paused = true)]
async fn ack_busy_backs_off_then_succeeds() {
    let firmware = vec![0xAAu8; 64];
    let fw = TempFirmware::new("busy_retry", &firmware);
    let endpoint = Endpoint::new(EndpointId::CanNode(128));
    let sim = Arc::new(
        BootloaderSim::new(endpoint.clone(), 64, 0x08000000, "stm32f103xe").with_busy_replies(2),
    );
    let engine = CommandEngine::new(sim.clone() as Arc<dyn Transport>, EndpointId::CanNode(128), endpoint);
    let mut flash = FlashEngine::new(engine, fw.path()).unwrap();

    flash.connect().await.unwrap();
    flash.send_file().await.unwrap();

    assert_eq!(sim.send_block_addresses(), vec![0x08000000]);
    assert_eq!(sim.block_at(0x08000000).unwrap().len(), 64);
}

/// A discovered-UUID set that does not contain the target UUID fails
/// fast with InvalidInput, before any node ID assignment or CONNECT.
#[test]
fn uuid_not_discovered_rejects_before_connect() {
    let target = Uuid48::parse("112233445566").unwrap();
    let seen = vec![DiscoveredDevice {
        uuid: Uuid48::parse("aabbccddeeff").unwrap(),
        app: AppType::Katapult,
    }];
    let err = require_discovered(&seen, target).unwrap_err();
    assert!(matches!(err, KatapultError::InvalidInput(_)));
}

/// One corrupted byte on read-back during verify; the engine reports
/// a checksum mismatch and COMPLETE is still attempted exactly once.
#[tokio::test(start_paused = true)]
async fn verify_mismatch_still_completes() {
    let firmware = vec![0xAAu8; 130];
    let fw = TempFirmware::new("verify_mismatch", &firmware);
    let endpoint = Endpoint::new(EndpointId::CanNode(128));
    let sim = Arc::new(
        BootloaderSim::new(endpoint.clone(), 64, 0x08002000, "stm32f103xe")
            .with_verify_corruption_at(0x08002080),
    );
    let engine = CommandEngine::new(sim.clone() as Arc<dyn Transport>, EndpointId::CanNode(128), endpoint);
    let mut flash = FlashEngine::new(engine, fw.path()).unwrap();

    flash.connect().await.unwrap();
    flash.send_file().await.unwrap();
    let verify_result = flash.verify_file().await;
    assert!(matches!(verify_result, Err(KatapultError::Protocol(_))));

    flash.finish().await;
    assert_eq!(flash.state(), EngineState::Completed);
    assert_eq!(sim.complete_count(), 1);
}

/// A double-buffered STM32 product primes before CONNECT; the first
/// reassembled reply (the error response to the prime) is discarded and
/// the real CONNECT reply parses normally.
#[tokio::test(start_paused = true)]
async fn usb_double_buffer_priming_discards_first_reply() {
    assert!(usb::has_double_buffering("stm32g0b1xx"));

    let firmware = vec![0xAAu8; 64];
    let fw = TempFirmware::new("usb_priming", &firmware);
    let endpoint = Endpoint::new(EndpointId::Serial);
    let sim = Arc::new(BootloaderSim::new(endpoint.clone(), 64, 0x08000000, "stm32g0b1xx"));
    let engine = CommandEngine::new(sim.clone() as Arc<dyn Transport>, EndpointId::Serial, endpoint);
    let mut flash = FlashEngine::new(engine, fw.path()).unwrap();

    flash.prime().await.unwrap();
    let info = flash.connect().await.unwrap();
    assert_eq!(info.mcu_type, "stm32g0b1xx");
    flash.finish().await;
}

/// Protocol-level GET_CANBUS_ID check used as the post-connect defense
/// against a UUID mismatch, complementing the pre-connect discovery check.
#[tokio::test(start_paused = true)]
async fn canbus_uuid_mismatch_is_a_protocol_error() {
    let firmware = vec![0xAAu8; 64];
    let fw = TempFirmware::new("canbus_uuid", &firmware);
    let endpoint = Endpoint::new(EndpointId::CanNode(128));
    let device_uuid = Uuid48::parse("aabbccddeeff").unwrap();
    let sim = Arc::new(
        BootloaderSim::new(endpoint.clone(), 64, 0x08000000, "stm32f103xe").with_canbus_uuid(device_uuid),
    );
    let engine = CommandEngine::new(sim.clone() as Arc<dyn Transport>, EndpointId::CanNode(128), endpoint);
    let mut flash = FlashEngine::new(engine, fw.path()).unwrap();

    flash.connect().await.unwrap();
    let requested = Uuid48::parse("112233445566").unwrap();
    let result = flash.verify_canbus_uuid(requested).await;
    assert!(matches!(result, Err(KatapultError::Protocol(_))));
}
