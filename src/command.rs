//! Command engine: framing, retry, and ack dispatch shared by both
//! transports.
//!
//! Grounded on `flashtool.py::CanFlasher.send_command`.

use crate::endpoint::{Endpoint, EndpointId, Transport};
use crate::error::KatapultError;
use crate::frame::{self, Scan};
use byteorder::{ByteOrder, LittleEndian};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_TRIES: u32 = 5;
const BUSY_BACKOFF: Duration = Duration::from_millis(1500);
const RETRY_BACKOFF: Duration = Duration::from_millis(500);
const DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

pub struct CommandEngine {
    transport: Arc<dyn Transport>,
    endpoint_id: EndpointId,
    endpoint: Endpoint,
    primed: bool,
}

impl CommandEngine {
    pub fn new(transport: Arc<dyn Transport>, endpoint_id: EndpointId, endpoint: Endpoint) -> Self {
        CommandEngine {
            transport,
            endpoint_id,
            endpoint,
            primed: false,
        }
    }

    /// Write the deliberately-invalid prime frame directly, with no ack
    /// wait, and arm `primed` so the next `send_command`'s first
    /// fully-parsed reply is discarded in favor of a second one. Mirrors
    /// `flashtool.py::CanFlasher.prime`.
    pub async fn prime(&mut self) -> Result<(), KatapultError> {
        let wire = frame::encode(frame::CMD_PRIME, &[]);
        self.transport.send(self.endpoint_id, &wire).await?;
        self.primed = true;
        Ok(())
    }

    pub async fn send_command(&mut self, cmd: u8, payload: &[u8]) -> Result<Vec<u8>, KatapultError> {
        self.send_command_with_tries(cmd, payload, DEFAULT_TRIES).await
    }

    pub async fn send_command_with_tries(
        &mut self,
        cmd: u8,
        payload: &[u8],
        tries: u32,
    ) -> Result<Vec<u8>, KatapultError> {
        let wire = frame::encode(cmd, payload);
        let mut remaining = tries;

        while remaining > 0 {
            self.transport.send(self.endpoint_id, &wire).await?;

            match self.read_reply(cmd).await {
                Attempt::Success(data) => return Ok(data),
                Attempt::Busy => {
                    tokio::time::sleep(BUSY_BACKOFF).await;
                }
                Attempt::Retryable => {}
            }

            remaining -= 1;
            self.drain_residual().await;
            tokio::time::sleep(RETRY_BACKOFF).await;
        }

        Err(KatapultError::protocol(format!(
            "error sending command {cmd:#04x} to device"
        )))
    }

    async fn read_reply(&mut self, cmd: u8) -> Attempt {
        let mut data = Vec::new();
        let decoded = match self.read_frame(&mut data).await {
            Ok(frame) => frame,
            Err(KatapultError::Timeout { .. }) => {
                log::info!("Response for command {cmd:#04x} timed out");
                return Attempt::Retryable;
            }
            Err(e) => {
                log::info!("Device read error on command {cmd:#04x}: {e}");
                return Attempt::Retryable;
            }
        };

        let decoded = if self.primed {
            self.primed = false;
            let mut second = Vec::new();
            match self.read_frame(&mut second).await {
                Ok(frame) => frame,
                Err(e) => {
                    log::info!("Primed re-read for command {cmd:#04x} failed: {e}");
                    return Attempt::Retryable;
                }
            }
        } else {
            decoded
        };

        if !decoded.trailer_ok {
            log::info!("Command {cmd:#04x}: invalid trailer received");
            return Attempt::Retryable;
        }
        if !decoded.crc_ok {
            log::info!("Command {cmd:#04x}: frame CRC mismatch");
            return Attempt::Retryable;
        }
        match decoded.cmd {
            frame::ACK_ERROR => {
                log::info!("Command {cmd:#04x}: received error response");
                Attempt::Retryable
            }
            frame::ACK_BUSY => {
                log::info!("Command {cmd:#04x}: received busy signal");
                Attempt::Busy
            }
            frame::ACK_SUCCESS => {
                let echoed = if decoded.payload.len() >= 4 {
                    LittleEndian::read_u32(&decoded.payload[0..4])
                } else {
                    0
                };
                if echoed != cmd as u32 {
                    log::info!(
                        "Command {cmd:#04x}: acknowledged wrong command, received {echoed:#04x}"
                    );
                    return Attempt::Retryable;
                }
                let body = if decoded.payload.len() <= 4 {
                    Vec::new()
                } else {
                    decoded.payload[4..].to_vec()
                };
                Attempt::Success(body)
            }
            _ => {
                log::info!("Command {cmd:#04x}: received NACK");
                Attempt::Retryable
            }
        }
    }

    /// Read from the endpoint until a complete frame (by header + wordcnt)
    /// has accumulated, resyncing past garbage one byte at a time.
    async fn read_frame(&self, data: &mut Vec<u8>) -> Result<frame::DecodedFrame, KatapultError> {
        loop {
            let chunk = self.endpoint.read_until(&frame::TRAILER, None).await?;
            data.extend_from_slice(&chunk);
            loop {
                match frame::scan(data) {
                    Scan::Garbage(n) => {
                        data.drain(..n);
                    }
                    Scan::NeedMore => break,
                    Scan::Frame { frame, consumed } => {
                        if consumed == data.len() {
                            return Ok(frame);
                        }
                        data.drain(..consumed);
                    }
                }
            }
        }
    }

    async fn drain_residual(&self) {
        match self.endpoint.read(1024, Some(DRAIN_TIMEOUT)).await {
            Ok(leftover) if !leftover.is_empty() => {
                log::debug!("Read buffer contents: {leftover:02x?}");
            }
            _ => {}
        }
    }
}

enum Attempt {
    Success(Vec<u8>),
    Busy,
    Retryable,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reassembler::Reassembler;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct LoopbackTransport {
        reassembler: Reassembler,
        sent: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl Transport for LoopbackTransport {
        async fn send(&self, _id: EndpointId, payload: &[u8]) -> Result<(), KatapultError> {
            self.sent.lock().unwrap().push(payload.to_vec());
            Ok(())
        }

        async fn close(&self) {
            self.reassembler.close();
        }
    }

    #[tokio::test]
    async fn success_reply_strips_echoed_command_and_returns_body() {
        let endpoint = Endpoint::new(EndpointId::Serial);
        let transport = Arc::new(LoopbackTransport {
            reassembler: Reassembler::new("loop"),
            sent: Mutex::new(Vec::new()),
        });
        let mut engine = CommandEngine::new(transport, EndpointId::Serial, endpoint.clone());

        let mut body = vec![0u8; 8];
        LittleEndian::write_u32(&mut body[0..4], frame::CMD_CONNECT as u32);
        LittleEndian::write_u32(&mut body[4..8], 0xdead_beef);
        let wire = frame::encode(frame::ACK_SUCCESS, &body);

        let feeder = endpoint.clone();
        let feed_task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            feeder.feed(&wire);
        });

        let result = engine
            .send_command_with_tries(frame::CMD_CONNECT, &[], 1)
            .await
            .unwrap();
        feed_task.await.unwrap();
        assert_eq!(result, 0xdead_beef_u32.to_le_bytes());
    }
}
