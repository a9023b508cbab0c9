/// Durable store collaborator for live and finished games.
pub mod game_store;
/// Persisted record shapes.
pub mod models;
/// Storage error types shared by every backend.
pub mod storage;
/// Local persistence of the trusted device list.
pub mod trust_store;
