use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use dashmap::DashMap;
use futures::future::BoxFuture;
use uuid::Uuid;

use crate::dao::{
    game_store::GameStore,
    models::{FinalizedGameRecord, LiveGameDocument, StoreId},
    storage::{StorageError, StorageResult},
};

#[derive(Debug, thiserror::Error)]
#[error("in-memory store switched offline")]
struct Offline;

/// Volatile store, handy for tests and for running without a data directory.
#[derive(Debug, Clone, Default)]
pub struct MemoryGameStore {
    live: Arc<DashMap<StoreId, LiveGameDocument>>,
    finalized: Arc<DashMap<StoreId, FinalizedGameRecord>>,
    offline: Arc<AtomicBool>,
}

impl MemoryGameStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail (or succeed again).
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Latest document for a live game.
    pub fn live_game(&self, id: &str) -> Option<LiveGameDocument> {
        self.live.get(id).map(|entry| entry.value().clone())
    }

    /// Number of live games currently stored.
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Every finalized record.
    pub fn finalized(&self) -> Vec<FinalizedGameRecord> {
        self.finalized
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    fn check(&self) -> StorageResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StorageError::unavailable("memory store".into(), Offline))
        } else {
            Ok(())
        }
    }
}

impl GameStore for MemoryGameStore {
    fn create_live_game(&self, state: LiveGameDocument) -> BoxFuture<'static, StorageResult<StoreId>> {
        let store = self.clone();
        Box::pin(async move {
            store.check()?;
            let id = Uuid::new_v4().simple().to_string();
            store.live.insert(id.clone(), state);
            Ok(id)
        })
    }

    fn update_live_game(
        &self,
        id: StoreId,
        state: LiveGameDocument,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            store.check()?;
            match store.live.get_mut(&id) {
                Some(mut entry) => {
                    *entry = state;
                    Ok(())
                }
                None => Err(StorageError::NotFound(id)),
            }
        })
    }

    fn finalize_game(
        &self,
        id: StoreId,
        record: FinalizedGameRecord,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            store.check()?;
            store.finalized.insert(id, record);
            Ok(())
        })
    }

    fn delete_live_game(&self, id: StoreId) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            store.check()?;
            store
                .live
                .remove(&id)
                .map(|_| ())
                .ok_or(StorageError::NotFound(id))
        })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.check() })
    }
}
