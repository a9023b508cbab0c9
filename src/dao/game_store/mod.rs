pub mod file;
pub mod memory;

use futures::future::BoxFuture;

use crate::dao::{
    models::{FinalizedGameRecord, LiveGameDocument, StoreId},
    storage::StorageResult,
};

/// Durable store that keeps live games while they run and finished games afterwards.
///
/// Calls are made off the node loop; failures are reported, never retried here.
pub trait GameStore: Send + Sync {
    fn create_live_game(&self, state: LiveGameDocument) -> BoxFuture<'static, StorageResult<StoreId>>;
    fn update_live_game(
        &self,
        id: StoreId,
        state: LiveGameDocument,
    ) -> BoxFuture<'static, StorageResult<()>>;
    fn finalize_game(
        &self,
        id: StoreId,
        record: FinalizedGameRecord,
    ) -> BoxFuture<'static, StorageResult<()>>;
    fn delete_live_game(&self, id: StoreId) -> BoxFuture<'static, StorageResult<()>>;
    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>>;
}
