//! 48-bit device UUID used on the CAN admin channel.

use crate::error::KatapultError;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Uuid48([u8; 6]);

impl Uuid48 {
    pub fn from_bytes(bytes: [u8; 6]) -> Self {
        Uuid48(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// Parse a 12 hex digit string, as accepted by the `--uuid` CLI flag.
    pub fn parse(text: &str) -> Result<Self, KatapultError> {
        let cleaned = text.trim();
        let raw = hex::decode(cleaned).map_err(|e| {
            KatapultError::invalid_input(format!("invalid uuid '{text}': {e}"))
        })?;
        if raw.len() != 6 {
            return Err(KatapultError::invalid_input(format!(
                "uuid '{text}' must decode to 6 bytes, found {}",
                raw.len()
            )));
        }
        let mut bytes = [0u8; 6];
        bytes.copy_from_slice(&raw);
        Ok(Uuid48(bytes))
    }
}

impl fmt::Display for Uuid48 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}
