use axum::Router;

use crate::state::SharedState;

pub mod device;
pub mod docs;
pub mod game;
pub mod health;
pub mod sse;

/// Compose the bridge: health, event stream, device and game endpoints, plus Swagger UI.
pub fn router(state: SharedState) -> Router<()> {
    Router::new()
        .merge(health::router())
        .merge(sse::router())
        .merge(device::router())
        .merge(game::router())
        .merge(docs::router())
        .with_state(state)
}
