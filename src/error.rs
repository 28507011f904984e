//! Error taxonomy for the Katapult flash engine.
//!
//! Distinguishes bad input from the caller, transport-level IO failure,
//! protocol-level disagreement with the device, timeouts, and the
//! (internally retried) busy signal.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KatapultError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("transport IO error on {endpoint}: {source}")]
    TransportIo {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("timeout waiting on {endpoint} after {millis}ms")]
    Timeout { endpoint: String, millis: u64 },

    #[error("device busy (command {0})")]
    DeviceBusy(String),

    #[error("endpoint {0} closed")]
    Eof(String),
}

impl KatapultError {
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        KatapultError::InvalidInput(msg.into())
    }

    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        KatapultError::Protocol(msg.into())
    }

    pub fn transport_io(endpoint: impl Into<String>, source: std::io::Error) -> Self {
        KatapultError::TransportIo {
            endpoint: endpoint.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, KatapultError>;
