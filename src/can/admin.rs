//! CAN admin channel: UUID discovery, bootloader jump, node ID assignment.

use crate::can::transport::{CanTransport, CANBUS_NODEID_OFFSET};
use crate::endpoint::{Endpoint, EndpointId, Transport};
use crate::error::KatapultError;
use crate::uuid::Uuid48;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

const OPCODE_QUERY_UNASSIGNED: u8 = 0x00;
const OPCODE_APP_REBOOT: u8 = 0x02;
const OPCODE_SET_NODE_ID: u8 = 0x11;
const OPCODE_CLEAR_NODE_IDS: u8 = 0x12;
const RESP_NEED_NODEID: u8 = 0x20;

/// Application identified in a query-unassigned response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppType {
    Katapult,
    Klipper,
    Unknown,
}

impl AppType {
    // See DESIGN.md for the app-type byte mapping discrepancy against the
    // reference flashtool's app_names table; this mapping follows the
    // glossary definition.
    fn from_byte(byte: u8) -> Self {
        match byte {
            0x01 => AppType::Katapult,
            0x11 => AppType::Klipper,
            // Legacy query-unassigned responders omit the trailing byte and
            // are treated as a Klipper application.
            0x00 => AppType::Klipper,
            _ => AppType::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DiscoveredDevice {
    pub uuid: Uuid48,
    pub app: AppType,
}

/// Hands out monotonically increasing NodeIDs starting at
/// `CANBUS_NODEID_OFFSET`, isolated from `NodeManager` so the allocation
/// sequence can be tested without a live CAN transport.
struct NodeIdAllocator(AtomicU32);

impl NodeIdAllocator {
    fn new() -> Self {
        NodeIdAllocator(AtomicU32::new(CANBUS_NODEID_OFFSET))
    }

    fn next(&self) -> u32 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}

pub struct NodeManager {
    transport: Arc<CanTransport>,
    admin: Endpoint,
    next_node_id: NodeIdAllocator,
}

impl NodeManager {
    pub fn new(transport: Arc<CanTransport>) -> Self {
        let admin = transport.admin_endpoint();
        NodeManager {
            transport,
            admin,
            next_node_id: NodeIdAllocator::new(),
        }
    }

    /// Ask the running Klipper application to reboot into its bootloader.
    /// Best-effort: no reply is expected.
    pub async fn jump_to_bootloader(&self, uuid: Uuid48) -> Result<(), KatapultError> {
        let mut payload = vec![OPCODE_APP_REBOOT];
        payload.extend_from_slice(uuid.as_bytes());
        self.transport.send(EndpointId::CanAdmin, &payload).await
    }

    /// Broadcast clear of any previously assigned node IDs.
    pub async fn clear_node_ids(&self) -> Result<(), KatapultError> {
        self.transport
            .send(EndpointId::CanAdmin, &[OPCODE_CLEAR_NODE_IDS])
            .await
    }

    /// Query all unassigned nodes and collect Katapult devices for up to
    /// two seconds.
    pub async fn query_unassigned(&self) -> Result<Vec<DiscoveredDevice>, KatapultError> {
        self.transport
            .send(EndpointId::CanAdmin, &[OPCODE_QUERY_UNASSIGNED])
            .await?;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        let mut found = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            let timeout = remaining.max(Duration::from_millis(1));
            match self.admin.read(8, Some(timeout)).await {
                Ok(resp) => {
                    if resp.len() < 7 || resp[0] != RESP_NEED_NODEID {
                        continue;
                    }
                    let mut bytes = [0u8; 6];
                    bytes.copy_from_slice(&resp[1..7]);
                    let uuid = Uuid48::from_bytes(bytes);
                    let app = if resp.len() > 7 {
                        AppType::from_byte(resp[7])
                    } else {
                        AppType::Unknown
                    };
                    log::info!("Detected UUID: {uuid}, application: {app:?}");
                    if app == AppType::Katapult && !found.iter().any(|d: &DiscoveredDevice| d.uuid == uuid) {
                        found.push(DiscoveredDevice { uuid, app });
                    }
                }
                Err(KatapultError::Timeout { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(found)
    }

    /// Assign `uuid` the next monotonically increasing NodeID and return
    /// its endpoint.
    pub async fn set_node_id(&self, uuid: Uuid48) -> Result<Endpoint, KatapultError> {
        let node_id = self.next_node_id.next();
        let mut payload = vec![OPCODE_SET_NODE_ID];
        payload.extend_from_slice(uuid.as_bytes());
        payload.push(node_id as u8);
        self.transport.send(EndpointId::CanAdmin, &payload).await?;
        Ok(self.transport.register_node(node_id))
    }
}

/// Confirm `target` was actually seen in a discovery round before a node ID
/// is assigned to it. Failing fast here means a bad UUID never reaches
/// `set_node_id`/`connect`, so COMPLETE is never attempted for it.
pub fn require_discovered(devices: &[DiscoveredDevice], target: Uuid48) -> Result<(), KatapultError> {
    if devices.iter().any(|d| d.uuid == target) {
        Ok(())
    } else {
        Err(KatapultError::invalid_input(format!(
            "unable to find node matching UUID: {target}"
        )))
    }
}
