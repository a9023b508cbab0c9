//! DTOs of the device endpoints: status, connectivity, pairing and recording.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

use crate::{
    dto::{
        format_timestamp,
        game::GameView,
        validation::{validate_device_id, validate_pairing_role},
    },
    services::{message_bus::Diagnostics, node::RecordingStatus},
    state::{
        identity::{DeviceIdentity, Role},
        registry::TrustedPeerEntry,
        state_machine::ConnectionState,
    },
};

/// Pair a device exchanged out of band (QR code, manual entry).
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct PairRequest {
    #[validate(custom(function = "validate_device_id"))]
    pub id: String,
    #[validate(length(min = 1, max = 64))]
    pub display_name: String,
    /// Role the paired device will play for us.
    #[validate(custom(function = "validate_pairing_role"))]
    pub role: Role,
}

/// Change the local role.
#[derive(Debug, Deserialize, ToSchema)]
pub struct RoleRequest {
    pub role: Role,
}

/// Report of the local recording subsystem.
#[derive(Debug, Deserialize, ToSchema)]
pub struct RecordingReportRequest {
    pub is_recording: bool,
}

/// Generic action acknowledgement.
#[derive(Debug, Serialize, ToSchema)]
pub struct ActionResponse {
    pub message: String,
}

impl ActionResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Trusted device as listed by the bridge.
#[derive(Debug, Serialize, ToSchema)]
pub struct TrustedDeviceView {
    pub identity: DeviceIdentity,
    pub expected_role: Role,
    pub last_connected_at: Option<String>,
}

impl From<TrustedPeerEntry> for TrustedDeviceView {
    fn from(entry: TrustedPeerEntry) -> Self {
        Self {
            identity: entry.identity,
            expected_role: entry.expected_role,
            last_connected_at: entry.last_connected_at.map(format_timestamp),
        }
    }
}

/// Everything the presentation layer needs to render the device screen.
#[derive(Debug, Serialize, ToSchema)]
pub struct StatusResponse {
    pub device: DeviceIdentity,
    pub role: Role,
    pub connection: ConnectionState,
    pub peer: Option<DeviceIdentity>,
    pub game: Option<GameView>,
    pub recording: RecordingStatus,
    pub diagnostics: Diagnostics,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairing_needs_a_usable_id_and_role() {
        let valid = PairRequest {
            id: "4f9c2a1e".into(),
            display_name: "Bench iPad".into(),
            role: Role::Recorder,
        };
        assert!(valid.validate().is_ok());

        let viewer = PairRequest {
            role: Role::Viewer,
            ..valid
        };
        assert!(viewer.validate().is_err());
    }
}
