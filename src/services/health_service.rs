use tracing::warn;

use crate::{dto::health::HealthResponse, state::SharedState};

/// Report degraded when the durable store or the sync node does not answer.
pub async fn health_status(state: &SharedState) -> HealthResponse {
    let store_ok = match state.game_store().health_check().await {
        Ok(()) => true,
        Err(err) => {
            warn!(error = %err, "storage health check failed");
            false
        }
    };
    let node_running = match state.node().diagnostics().await {
        Ok(_) => true,
        Err(err) => {
            warn!(error = %err, "sync node did not answer the health check");
            false
        }
    };

    if store_ok && node_running {
        HealthResponse::ok()
    } else {
        HealthResponse::degraded(node_running)
    }
}
