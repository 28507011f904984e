//! SocketCAN transport: raw frame I/O, the async reactor, and the admin
//! channel's node discovery/assignment protocol.

pub mod admin;
pub mod raw_socket;
pub mod transport;

pub use admin::{require_discovered, AppType, DiscoveredDevice, NodeManager};
pub use transport::CanTransport;
