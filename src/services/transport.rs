//! Seam between the node and whatever carries bytes between two devices.
//!
//! Implementations report asynchronous outcomes as [`TransportEvent`]s on the
//! channel handed out with them; the trait methods themselves never block.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::{
    services::discovery::{Discovery, DiscoveryEvent},
    state::identity::DeviceIdentity,
};

/// Something the transport observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A peer wants to open a session with us. Answer with `accept` or `reject`.
    Invited(DeviceIdentity),
    /// A session with the peer is live.
    Connected(DeviceIdentity),
    /// Our outbound attempt did not produce a session.
    ConnectFailed { peer: DeviceIdentity, reason: String },
    /// The live session went away without us asking.
    Disconnected(DeviceIdentity),
    /// One complete frame arrived from the session peer.
    Received(Vec<u8>),
}

/// Synchronous failure of a transport call.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no session is established")]
    NotConnected,
    #[error("peer {0} is not reachable")]
    Unreachable(String),
    #[error("session closed: {0}")]
    Closed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Ordered, reliable session to at most one peer at a time.
pub trait Transport: Send + Sync {
    /// Start an outbound session attempt; the result arrives as an event.
    fn connect(&self, peer: &DeviceIdentity) -> Result<(), TransportError>;
    /// Accept an invitation received as [`TransportEvent::Invited`].
    fn accept(&self, peer: &DeviceIdentity) -> Result<(), TransportError>;
    /// Refuse an invitation.
    fn reject(&self, peer: &DeviceIdentity);
    /// Queue one frame on the live session.
    fn send(&self, frame: Vec<u8>) -> Result<(), TransportError>;
    /// Tear down the live session or the in-flight attempt, if any.
    fn disconnect(&self);
}

/// Everything a node needs from the network, already bound to one device.
pub struct NetworkLink {
    pub transport: Arc<dyn Transport>,
    pub discovery: Arc<dyn Discovery>,
    pub transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    pub discovery_events: mpsc::UnboundedReceiver<DiscoveryEvent>,
}
