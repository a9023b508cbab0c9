use serde::Serialize;
use utoipa::ToSchema;

use crate::state::{hub::NodeEvent, identity::DeviceIdentity, state_machine::ConnectionState};

#[derive(Clone, Debug)]
/// Dispatched payload carried across the SSE channel.
pub struct ServerEvent {
    pub event: Option<String>,
    pub data: String,
}

impl ServerEvent {
    /// Convenience wrapper that serialises `payload` into the SSE data field.
    pub fn json<E, T>(event: E, payload: &T) -> serde_json::Result<Self>
    where
        E: Into<Option<String>>,
        T: Serialize,
    {
        Ok(Self {
            event: event.into(),
            data: serde_json::to_string(payload)?,
        })
    }

    /// Frame a node event under its own name.
    pub fn from_node(event: &NodeEvent) -> serde_json::Result<Self> {
        Self::json(event.name().to_string(), event)
    }
}

#[derive(Debug, Serialize, ToSchema)]
/// Initial metadata sent to an SSE client when it connects.
pub struct Handshake {
    /// Human-readable message confirming the subscription.
    pub message: String,
    pub device: DeviceIdentity,
    pub connection: ConnectionState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_events_are_named_and_tagged() {
        let event = ServerEvent::from_node(&NodeEvent::PeerRecording { is_recording: true }).unwrap();
        assert_eq!(event.event.as_deref(), Some(NodeEvent::PeerRecording { is_recording: true }.name()));
        let data: serde_json::Value = serde_json::from_str(&event.data).unwrap();
        assert_eq!(data["type"], "peer_recording");
        assert_eq!(data["is_recording"], true);
    }
}
