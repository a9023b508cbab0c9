//! Wire envelope exchanged between peers over an established session.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::time_source::{from_millis, to_millis};

/// String-keyed payload carried by every message.
pub type Payload = IndexMap<String, String>;

/// Kind of a [`GameMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub enum MessageType {
    /// Ask the peer's recording subsystem to start.
    StartRecording,
    /// Ask the peer's recording subsystem to stop.
    StopRecording,
    /// Sender reports whether it is recording.
    RecordingStateUpdate,
    /// Full snapshot of a freshly started game.
    GameStarting,
    /// The named game was finalized by its holder.
    GameEnded,
    /// Full snapshot after a change.
    GameStateUpdate,
    /// Keep-alive request, answered with [`MessageType::Pong`].
    Ping,
    /// Keep-alive answer.
    Pong,
    /// Sender asks the holder for the control token.
    ControlRequest,
    /// Snapshot after the token moved, naming the grantee.
    ControlGrant,
    /// Snapshot after the holder gave the token up.
    ControlRelease,
}

impl MessageType {
    /// Keep-alive traffic handled by the bus itself.
    pub fn is_keepalive(&self) -> bool {
        matches!(self, MessageType::Ping | MessageType::Pong)
    }
}

/// Failure to turn bytes or payload fields back into a message.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The frame is not a JSON envelope.
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    /// A required payload key is absent.
    #[error("payload is missing `{0}`")]
    MissingField(&'static str),
    /// A payload value does not parse or is out of range.
    #[error("payload field `{field}` has invalid value `{value}`")]
    InvalidField {
        /// Offending key.
        field: &'static str,
        /// Raw value as received.
        value: String,
    },
}

/// Immutable message envelope: `{id, type, payload, timestamp, senderId}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameMessage {
    id: Uuid,
    #[serde(rename = "type")]
    kind: MessageType,
    #[serde(default)]
    payload: Payload,
    /// Unix milliseconds at the sender.
    timestamp: i64,
    sender_id: String,
}

impl GameMessage {
    /// Build a message with a fresh id.
    pub fn new(kind: MessageType, payload: Payload, sender_id: &str, now: OffsetDateTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            payload,
            timestamp: to_millis(now),
            sender_id: sender_id.to_string(),
        }
    }

    /// Message without payload.
    pub fn signal(kind: MessageType, sender_id: &str, now: OffsetDateTime) -> Self {
        Self::new(kind, Payload::new(), sender_id, now)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> MessageType {
        self.kind
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    /// Sender-side timestamp.
    pub fn sent_at(&self) -> OffsetDateTime {
        from_millis(self.timestamp)
    }

    /// Required payload field.
    pub fn field(&self, name: &'static str) -> Result<&str, DecodeError> {
        self.payload
            .get(name)
            .map(String::as_str)
            .ok_or(DecodeError::MissingField(name))
    }

    /// Serialize for the transport.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse bytes received from the transport.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
