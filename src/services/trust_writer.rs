//! Off-loop writes of the trusted device list.
//!
//! The registry pushes a full copy of its entries after every mutation. The
//! worker writes them in order on the blocking pool, skipping copies that a
//! newer one already replaced.

use std::sync::Arc;

use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, warn};

use crate::dao::trust_store::{TrustStore, TrustedPeerRecord};

/// Sending half handed to the registry.
pub type TrustSaves = mpsc::UnboundedSender<Vec<TrustedPeerRecord>>;

/// Spawn the worker. It stops once every sender is dropped and the last copy is written.
pub fn spawn(store: Arc<dyn TrustStore>) -> (TrustSaves, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(run(store, rx));
    (tx, handle)
}

async fn run(
    store: Arc<dyn TrustStore>,
    mut saves: mpsc::UnboundedReceiver<Vec<TrustedPeerRecord>>,
) {
    while let Some(mut records) = saves.recv().await {
        let mut skipped = 0usize;
        while let Ok(newer) = saves.try_recv() {
            records = newer;
            skipped += 1;
        }
        if skipped > 0 {
            debug!(skipped, "coalesced trusted device saves");
        }

        let store = store.clone();
        let count = records.len();
        match tokio::task::spawn_blocking(move || store.save(&records)).await {
            Ok(Ok(())) => debug!(count, "trusted devices saved"),
            Ok(Err(err)) => {
                warn!(error = %err, "failed to persist trusted devices; keeping in-memory copy");
            }
            Err(err) => warn!(error = %err, "trusted device write task failed"),
        }
    }
    debug!("trust writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dao::trust_store::MemoryTrustStore,
        state::identity::{DeviceIdentity, Role},
    };

    fn record(id: &str) -> TrustedPeerRecord {
        TrustedPeerRecord {
            identity: DeviceIdentity::new(id, format!("{id}-name")),
            expected_role: Role::Recorder,
            last_connected_at: None,
        }
    }

    #[tokio::test]
    async fn last_copy_wins_and_is_flushed_on_close() {
        let store = Arc::new(MemoryTrustStore::default());
        let (saves, task) = spawn(store.clone());

        saves.send(vec![record("a")]).unwrap();
        saves.send(vec![record("a"), record("b")]).unwrap();
        saves.send(vec![record("b")]).unwrap();
        drop(saves);
        task.await.unwrap();

        assert_eq!(store.saved(), vec![record("b")]);
    }
}
