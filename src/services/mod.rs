/// Device status, connectivity and pairing operations for the bridge.
pub mod device_service;
/// Local network presence seam.
pub mod discovery;
/// OpenAPI documentation generation.
pub mod documentation;
/// Game and control operations for the bridge.
pub mod game_service;
/// Health check service.
pub mod health_service;
/// Typed messaging with retry queue and duplicate suppression.
pub mod message_bus;
/// The sync node actor and its handle.
pub mod node;
/// Server-Sent Events broadcasting service.
pub mod sse_service;
/// Storage persistence worker with debouncing.
pub mod storage_supervisor;
/// Session transport seam.
pub mod transport;
/// Trusted device list writer running off the node loop.
pub mod trust_writer;
