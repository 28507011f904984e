//! CAN bus session layer: async reactor over a raw SocketCAN fd, fan-out
//! to endpoints by CAN id, and outbound 8-byte fragmentation.

use crate::can::raw_socket::{pack_kernel_frame, unpack_kernel_frame, RawCanSocket, KERNEL_FRAME_LEN};
use crate::endpoint::{Endpoint, EndpointId, Transport};
use crate::error::KatapultError;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::unix::AsyncFd;

pub const CANBUS_ID_ADMIN: u32 = 0x3f0;
pub const CANBUS_ID_ADMIN_RESP: u32 = 0x3f1;
pub const CANBUS_NODEID_OFFSET: u32 = 128;

const READ_CHUNK: usize = 4096;

struct NodeEntry {
    tx_can_id: u32,
    endpoint: Endpoint,
}

pub struct CanTransport {
    socket: AsyncFd<RawCanSocket>,
    by_key: Mutex<HashMap<EndpointId, NodeEntry>>,
    by_rx_id: Mutex<HashMap<u32, Endpoint>>,
    out_queue: Mutex<VecDeque<Vec<u8>>>,
    output_busy: AtomicBool,
    input_busy: AtomicBool,
    closed: AtomicBool,
}

impl CanTransport {
    pub async fn open(interface_name: &str) -> Result<Arc<Self>, KatapultError> {
        let raw = RawCanSocket::open(interface_name)?;
        let socket = AsyncFd::new(raw)
            .map_err(|e| KatapultError::transport_io(interface_name, e))?;

        let transport = Arc::new(CanTransport {
            socket,
            by_key: Mutex::new(HashMap::new()),
            by_rx_id: Mutex::new(HashMap::new()),
            out_queue: Mutex::new(VecDeque::new()),
            output_busy: AtomicBool::new(false),
            input_busy: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        transport.register(EndpointId::CanAdmin, CANBUS_ID_ADMIN, CANBUS_ID_ADMIN_RESP);

        let reactor = transport.clone();
        tokio::spawn(async move {
            reactor.receive_loop().await;
        });

        Ok(transport)
    }

    fn register(&self, id: EndpointId, tx_can_id: u32, rx_can_id: u32) -> Endpoint {
        let endpoint = Endpoint::new(id);
        self.by_key.lock().unwrap().insert(
            id,
            NodeEntry {
                tx_can_id,
                endpoint: endpoint.clone(),
            },
        );
        self.by_rx_id.lock().unwrap().insert(rx_can_id, endpoint.clone());
        endpoint
    }

    pub fn admin_endpoint(&self) -> Endpoint {
        self.by_key
            .lock()
            .unwrap()
            .get(&EndpointId::CanAdmin)
            .expect("admin endpoint registered at open()")
            .endpoint
            .clone()
    }

    /// Register a newly assigned NodeID and return its endpoint. The device
    /// listens on `2*node_id + 0x100` and transmits on `2*node_id + 0x101`.
    pub fn register_node(&self, node_id: u32) -> Endpoint {
        let tx_can_id = 2 * node_id + 0x100;
        let rx_can_id = 2 * node_id + 0x101;
        self.register(EndpointId::CanNode(node_id), tx_can_id, rx_can_id)
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut input_buffer: Vec<u8> = Vec::new();
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            let mut guard = match self.socket.readable().await {
                Ok(g) => g,
                Err(e) => {
                    log::error!("CAN socket readiness error, closing: {e}");
                    self.close().await;
                    return;
                }
            };

            let mut chunk = [0u8; READ_CHUNK];
            let read_result = guard.try_io(|fd| fd.get_ref().raw_read(&mut chunk));
            match read_result {
                Ok(Ok(0)) => {
                    self.close().await;
                    return;
                }
                Ok(Ok(n)) => {
                    input_buffer.extend_from_slice(&chunk[..n]);
                    self.dispatch_frames(&mut input_buffer);
                }
                Ok(Err(e)) => {
                    log::error!("CAN socket read error, closing: {e}");
                    self.close().await;
                    return;
                }
                Err(_would_block) => continue,
            }
        }
    }

    fn dispatch_frames(&self, buffer: &mut Vec<u8>) {
        if self.input_busy.swap(true, Ordering::SeqCst) {
            // Reentrant call while a drain is already in progress; the
            // active drainer will pick up the newly appended bytes.
            return;
        }
        while buffer.len() >= KERNEL_FRAME_LEN {
            let (can_id, dlc, data) = unpack_kernel_frame(&buffer[..KERNEL_FRAME_LEN]);
            let len = (dlc as usize).min(8);
            if let Some(endpoint) = self.by_rx_id.lock().unwrap().get(&can_id) {
                endpoint.feed(&data[..len]);
            }
            buffer.drain(..KERNEL_FRAME_LEN);
        }
        self.input_busy.store(false, Ordering::SeqCst);
    }

    async fn drain_output(&self) -> Result<(), KatapultError> {
        loop {
            let next = { self.out_queue.lock().unwrap().pop_front() };
            let Some(frame) = next else {
                return Ok(());
            };
            loop {
                let mut guard = self
                    .socket
                    .writable()
                    .await
                    .map_err(|e| KatapultError::transport_io("can", e))?;
                match guard.try_io(|fd| fd.get_ref().raw_write(&frame)) {
                    Ok(Ok(_)) => break,
                    Ok(Err(e)) => return Err(KatapultError::transport_io("can", e)),
                    Err(_would_block) => continue,
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for CanTransport {
    async fn send(&self, id: EndpointId, payload: &[u8]) -> Result<(), KatapultError> {
        let tx_can_id = {
            let table = self.by_key.lock().unwrap();
            table
                .get(&id)
                .map(|entry| entry.tx_can_id)
                .ok_or_else(|| KatapultError::protocol(format!("unknown endpoint {id}")))?
        };

        let mut frames = Vec::new();
        if payload.is_empty() {
            frames.push(pack_kernel_frame(tx_can_id, &[]).to_vec());
        } else {
            for chunk in payload.chunks(8) {
                frames.push(pack_kernel_frame(tx_can_id, chunk).to_vec());
            }
        }

        {
            let mut queue = self.out_queue.lock().unwrap();
            queue.extend(frames);
        }

        if self.output_busy.swap(true, Ordering::SeqCst) {
            // Another caller already owns the drain; it will flush our
            // frames too since they are already queued.
            return Ok(());
        }
        let result = self.drain_output().await;
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
        let endpoints: Vec<Endpoint> = self
            .by_key
            .lock()
            .unwrap()
            .values()
            .map(|e| e.endpoint.clone())
            .collect();
        for endpoint in endpoints {
            endpoint.close();
        }
    }
}
