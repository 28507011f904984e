//! Katapult application-layer frame codec.
//!
//! `01 88 | CMD | WORDCNT | PAYLOAD (WORDCNT*4 bytes) | CRC16-CCITT | 99 03`

use crate::crc::crc16_ccitt;
use byteorder::{ByteOrder, LittleEndian};

pub const HEADER: [u8; 2] = [0x01, 0x88];
pub const TRAILER: [u8; 2] = [0x99, 0x03];

pub const CMD_CONNECT: u8 = 0x11;
pub const CMD_SEND_BLOCK: u8 = 0x12;
pub const CMD_SEND_EOF: u8 = 0x13;
pub const CMD_REQUEST_BLOCK: u8 = 0x14;
pub const CMD_COMPLETE: u8 = 0x15;
pub const CMD_GET_CANBUS_ID: u8 = 0x16;
/// Deliberately invalid opcode used to prime double-buffered USB endpoints.
pub const CMD_PRIME: u8 = 0x90;

pub const ACK_SUCCESS: u8 = 0xa0;
pub const NACK: u8 = 0xf1;
pub const ACK_ERROR: u8 = 0xf2;
pub const ACK_BUSY: u8 = 0xf3;

/// Build a complete wire frame for `cmd` with `payload`.
///
/// `payload` length must be a multiple of 4; callers pad short values.
pub fn encode(cmd: u8, payload: &[u8]) -> Vec<u8> {
    debug_assert_eq!(payload.len() % 4, 0, "payload must be word-aligned");
    let word_count = (payload.len() / 4) as u8;

    let mut out = Vec::with_capacity(8 + payload.len());
    out.extend_from_slice(&HEADER);
    out.push(cmd);
    out.push(word_count);
    out.extend_from_slice(payload);
    let crc = crc16_ccitt(&out[2..]);
    let mut crc_bytes = [0u8; 2];
    LittleEndian::write_u16(&mut crc_bytes, crc);
    out.extend_from_slice(&crc_bytes);
    out.extend_from_slice(&TRAILER);
    out
}

/// A frame decoded from the wire, before CRC/trailer validation.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub cmd: u8,
    pub payload: Vec<u8>,
    pub crc_ok: bool,
    pub trailer_ok: bool,
}

/// Outcome of scanning an accumulation buffer for one frame.
pub enum Scan {
    /// Not enough bytes yet to know anything.
    NeedMore,
    /// The buffer does not start with a valid header; drop this many bytes
    /// and resynchronize.
    Garbage(usize),
    /// A complete frame (header through trailer) is present, spanning
    /// `consumed` bytes from the start of the buffer.
    Frame { frame: DecodedFrame, consumed: usize },
}

/// Scan `buf` for a single frame: while the buffer is at least 8 bytes,
/// either it starts with the header (in which case `WORDCNT` fixes the
/// expected total length and we wait for that many bytes) or the first
/// byte is dropped and resync continues.
pub fn scan(buf: &[u8]) -> Scan {
    if buf.len() < 8 {
        return Scan::NeedMore;
    }
    if buf[0..2] != HEADER {
        return Scan::Garbage(1);
    }
    let word_count = buf[3] as usize;
    let total_len = word_count * 4 + 8;
    if buf.len() < total_len {
        return Scan::NeedMore;
    }

    let cmd = buf[2];
    let payload = buf[4..4 + word_count * 4].to_vec();
    let crc_received = LittleEndian::read_u16(&buf[total_len - 4..total_len - 2]);
    let crc_calculated = crc16_ccitt(&buf[2..total_len - 4]);
    let trailer_ok = buf[total_len - 2..total_len] == TRAILER;

    Scan::Frame {
        frame: DecodedFrame {
            cmd,
            payload,
            crc_ok: crc_received == crc_calculated,
            trailer_ok,
        },
        consumed: total_len,
    }
}
