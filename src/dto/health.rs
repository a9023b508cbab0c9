use serde::Serialize;
use utoipa::ToSchema;

/// Simple health response returned by the `/healthcheck` route.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Health status ("ok" or "degraded").
    pub status: String,
    /// Whether the sync node still answers.
    pub node_running: bool,
}

impl HealthResponse {
    /// Create a health response indicating the system is operational.
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
            node_running: true,
        }
    }

    /// Create a health response indicating a degraded dependency.
    pub fn degraded(node_running: bool) -> Self {
        Self {
            status: "degraded".to_string(),
            node_running,
        }
    }
}
