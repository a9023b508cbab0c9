pub mod clock;
pub mod control;
pub mod game;
pub mod hub;
pub mod identity;
pub mod registry;
pub mod segments;
pub mod state_machine;

use std::sync::Arc;

use crate::{dao::game_store::GameStore, services::node::NodeHandle, time_source::WallClock};

pub type SharedState = Arc<AppState>;

/// State shared by the HTTP bridge handlers.
pub struct AppState {
    node: NodeHandle,
    game_store: Arc<dyn GameStore>,
    clock: Arc<dyn WallClock>,
}

impl AppState {
    /// Construct a new [`AppState`] wrapped in an [`Arc`] so it can be cloned cheaply.
    pub fn new(
        node: NodeHandle,
        game_store: Arc<dyn GameStore>,
        clock: Arc<dyn WallClock>,
    ) -> SharedState {
        Arc::new(Self {
            node,
            game_store,
            clock,
        })
    }

    /// Handle to the sync node.
    pub fn node(&self) -> &NodeHandle {
        &self.node
    }

    pub fn game_store(&self) -> Arc<dyn GameStore> {
        self.game_store.clone()
    }

    pub fn clock(&self) -> &dyn WallClock {
        self.clock.as_ref()
    }
}
