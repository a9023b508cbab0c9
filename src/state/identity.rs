use std::fmt;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Stable identity of a physical device (one per install).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    /// Opaque identifier, generated once per install.
    pub id: String,
    /// Human readable device name shown to the other side.
    pub display_name: String,
}

impl DeviceIdentity {
    /// Build an identity from its parts.
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name, self.id)
    }
}

/// Role a device plays around a game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Authoritative scorekeeper.
    Controller,
    /// Device recording the video.
    Recorder,
    /// Passive observer.
    Viewer,
    /// No role chosen yet.
    #[default]
    None,
}

impl Role {
    /// Wire label for the role, used by discovery beacons.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Controller => "controller",
            Role::Recorder => "recorder",
            Role::Viewer => "viewer",
            Role::None => "none",
        }
    }

    /// Parse the wire label produced by [`Role::as_str`].
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "controller" => Some(Role::Controller),
            "recorder" => Some(Role::Recorder),
            "viewer" => Some(Role::Viewer),
            "none" => Some(Role::None),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
