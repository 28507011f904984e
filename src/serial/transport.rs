//! Serial session layer: async reactor over a raw serial fd.
//!
//! Structurally mirrors `can::transport::CanTransport`'s `AsyncFd` reactor
//! pattern but with a single endpoint and no fragmentation: every `send`
//! is written whole, exactly as `SerialSocket.send` does in
//! `flashtool.py`.

use crate::endpoint::{Endpoint, EndpointId, Transport};
use crate::error::KatapultError;
use crate::serial::raw_port::RawSerialPort;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::unix::AsyncFd;

const READ_CHUNK: usize = 4096;

pub struct SerialTransport {
    port: AsyncFd<RawSerialPort>,
    endpoint: Endpoint,
    output_busy: AtomicBool,
    closed: AtomicBool,
}

impl SerialTransport {
    pub fn from_port(port: RawSerialPort) -> Result<Arc<Self>, KatapultError> {
        let async_fd = AsyncFd::new(port).map_err(|e| KatapultError::transport_io("serial", e))?;
        let transport = Arc::new(SerialTransport {
            port: async_fd,
            endpoint: Endpoint::new(EndpointId::Serial),
            output_busy: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        let reactor = transport.clone();
        tokio::spawn(async move {
            reactor.receive_loop().await;
        });
        Ok(transport)
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    async fn receive_loop(self: Arc<Self>) {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            let mut guard = match self.port.readable().await {
                Ok(g) => g,
                Err(e) => {
                    log::error!("Serial readiness error, closing: {e}");
                    self.close().await;
                    return;
                }
            };
            let mut chunk = [0u8; READ_CHUNK];
            match guard.try_io(|fd| fd.get_ref().raw_read(&mut chunk)) {
                Ok(Ok(0)) => {
                    self.close().await;
                    return;
                }
                Ok(Ok(n)) => self.endpoint.feed(&chunk[..n]),
                Ok(Err(e)) => {
                    log::error!("Error on serial read, closing: {e}");
                    self.close().await;
                    return;
                }
                Err(_would_block) => continue,
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for SerialTransport {
    async fn send(&self, id: EndpointId, payload: &[u8]) -> Result<(), KatapultError> {
        if id != EndpointId::Serial {
            return Err(KatapultError::protocol(format!("unknown endpoint {id}")));
        }
        if self.output_busy.swap(true, Ordering::SeqCst) {
            // A concurrent write on this transport is a caller bug, not the
            // device-level ACK_BUSY the command engine retries around.
            return Err(KatapultError::protocol(
                "serial transport: concurrent send attempted while one was already in flight",
            ));
        }
        let mut written = 0;
        let result = loop {
            if written == payload.len() {
                break Ok(());
            }
            let mut guard = match self.port.writable().await {
                Ok(g) => g,
                Err(e) => break Err(KatapultError::transport_io("serial", e)),
            };
            match guard.try_io(|fd| fd.get_ref().raw_write(&payload[written..])) {
                Ok(Ok(n)) => written += n,
                Ok(Err(e)) => break Err(KatapultError::transport_io("serial", e)),
                Err(_would_block) => continue,
            }
        };
        self.output_busy.store(false, Ordering::SeqCst);
        if result.is_err() {
            self.close().await;
        }
        result
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.endpoint.close();
    }
}
