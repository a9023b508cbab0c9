use serde::Serialize;
use tokio::sync::broadcast;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::state::state_machine::ConnectionState;

/// Recording command forwarded to the local recording subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RecordingSignal {
    Start,
    Stop,
}

/// Everything the node announces to local subscribers besides the watched state.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeEvent {
    /// The connection state machine moved.
    ConnectionChanged { state: ConnectionState },
    /// A newer live game snapshot was accepted (local mutation or peer update).
    GameUpdated { game_id: Uuid, version: u64 },
    /// The live game was closed.
    GameEnded { game_id: Uuid },
    /// A peer asked this device, the control holder, for the token.
    ControlRequested { requester: String },
    /// The control token changed hands.
    ControlChanged { holder: Option<String> },
    /// The holder refused our pending request.
    ControlDenied,
    /// The peer asked the local recording subsystem to start or stop.
    Recording { signal: RecordingSignal },
    /// The peer reported whether it is recording.
    PeerRecording { is_recording: bool },
    /// A durable store call failed. It is not retried.
    PersistFailed { operation: String, message: String },
}

impl NodeEvent {
    /// Short name used as the SSE event label.
    pub fn name(&self) -> &'static str {
        match self {
            NodeEvent::ConnectionChanged { .. } => "connection",
            NodeEvent::GameUpdated { .. } => "game_updated",
            NodeEvent::GameEnded { .. } => "game_ended",
            NodeEvent::ControlRequested { .. } => "control_requested",
            NodeEvent::ControlChanged { .. } => "control_changed",
            NodeEvent::ControlDenied => "control_denied",
            NodeEvent::Recording { .. } => "recording",
            NodeEvent::PeerRecording { .. } => "peer_recording",
            NodeEvent::PersistFailed { .. } => "persist_failed",
        }
    }
}

/// Broadcast hub fanning node events out to every subscriber.
#[derive(Debug, Clone)]
pub struct EventHub {
    sender: broadcast::Sender<NodeEvent>,
}

impl EventHub {
    /// Construct a new hub backed by a Tokio broadcast channel with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Register a new subscriber that will receive subsequent events.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.sender.subscribe()
    }

    /// Send an event to all current subscribers, ignoring delivery errors.
    pub fn broadcast(&self, event: NodeEvent) {
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_only_see_events_sent_after_subscribing() {
        let hub = EventHub::new(4);
        hub.broadcast(NodeEvent::ControlDenied);

        let mut receiver = hub.subscribe();
        hub.broadcast(NodeEvent::PeerRecording { is_recording: true });

        assert_eq!(
            receiver.recv().await.unwrap(),
            NodeEvent::PeerRecording { is_recording: true }
        );
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn events_serialize_with_a_type_tag() {
        let value = serde_json::to_value(NodeEvent::ControlRequested {
            requester: "b".into(),
        })
        .unwrap();
        assert_eq!(value["type"], "control_requested");
        assert_eq!(value["requester"], "b");

        let value = serde_json::to_value(NodeEvent::ConnectionChanged {
            state: ConnectionState::Connecting("Bench iPad".into()),
        })
        .unwrap();
        assert_eq!(value["state"]["state"], "connecting");
        assert_eq!(value["state"]["detail"], "Bench iPad");
    }
}
