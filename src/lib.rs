//! Host-side flashing tool for the Katapult bootloader.
//!
//! Talks the Katapult wire protocol over either SocketCAN or a serial/USB
//! CDC connection: discovers a device, negotiates a flash session, writes
//! firmware in fixed-size blocks, reads it back, and verifies the SHA-1.

pub mod can;
pub mod command;
pub mod crc;
pub mod dictionary;
pub mod endpoint;
pub mod error;
pub mod flash;
pub mod frame;
pub mod logging;
pub mod reassembler;
pub mod serial;
pub mod uuid;

pub use error::{KatapultError, Result};
