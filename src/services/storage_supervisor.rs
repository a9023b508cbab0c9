//! Off-loop persistence of the live game to the durable store.
//!
//! The node hands over [`PersistCommand`]s and gets [`PersistOutcome`]s back on
//! its own channel. Updates for the same game are coalesced within the debounce
//! window; failed calls are reported, never retried here.

use std::{collections::HashMap, future::pending, sync::Arc, time::Duration};

use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, sleep_until},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dao::{
    game_store::GameStore,
    models::{FinalizedGameRecord, LiveGameDocument, StoreId},
    storage::StorageError,
};

/// Work requested by the node.
#[derive(Debug)]
pub enum PersistCommand {
    /// A new live game was started.
    Create {
        /// Game the document belongs to.
        game_id: Uuid,
        /// Snapshot to store.
        document: LiveGameDocument,
    },
    /// The live game changed; only the latest document per window is written.
    Update {
        /// Game the document belongs to.
        game_id: Uuid,
        /// Latest snapshot.
        document: LiveGameDocument,
    },
    /// The game ended: store the record and drop the live document.
    Finalize {
        /// Game that ended.
        game_id: Uuid,
        /// Immutable record of the whole game.
        record: FinalizedGameRecord,
    },
}

/// Store call that a [`PersistOutcome::Failed`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOperation {
    /// Storing a new live game.
    Create,
    /// Overwriting the live game document.
    Update,
    /// Storing the finalized record.
    Finalize,
    /// Removing the live document after finalization.
    Delete,
}

impl PersistOperation {
    /// Store call name reported to observers.
    pub fn as_str(&self) -> &'static str {
        match self {
            PersistOperation::Create => "createLiveGame",
            PersistOperation::Update => "updateLiveGame",
            PersistOperation::Finalize => "finalizeGame",
            PersistOperation::Delete => "deleteLiveGame",
        }
    }
}

/// Result of a store call, delivered back into the node loop.
#[derive(Debug)]
pub enum PersistOutcome {
    /// The live game now has an id in the store.
    Created {
        /// Game that was stored.
        game_id: Uuid,
        /// Id assigned by the store.
        store_id: StoreId,
    },
    /// The finalized record was stored.
    Finalized {
        /// Game that was finalized.
        game_id: Uuid,
    },
    /// A store call failed and was not retried.
    Failed {
        /// Game the call was about.
        game_id: Uuid,
        /// Call that failed.
        operation: PersistOperation,
        /// Store error.
        error: StorageError,
    },
}

/// Spawn the worker. It stops once every command sender is dropped and pending work is flushed.
pub fn spawn(
    store: Arc<dyn GameStore>,
    debounce: Duration,
    outcomes: mpsc::UnboundedSender<PersistOutcome>,
) -> (mpsc::UnboundedSender<PersistCommand>, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(run(store, debounce, rx, outcomes));
    (tx, handle)
}

struct PendingUpdate {
    game_id: Uuid,
    document: LiveGameDocument,
    due: Instant,
}

struct Worker {
    store: Arc<dyn GameStore>,
    outcomes: mpsc::UnboundedSender<PersistOutcome>,
    store_ids: HashMap<Uuid, StoreId>,
}

/// Drive the worker until the command channel closes.
pub async fn run(
    store: Arc<dyn GameStore>,
    debounce: Duration,
    mut commands: mpsc::UnboundedReceiver<PersistCommand>,
    outcomes: mpsc::UnboundedSender<PersistOutcome>,
) {
    let mut worker = Worker {
        store,
        outcomes,
        store_ids: HashMap::new(),
    };
    let mut pending: Option<PendingUpdate> = None;

    loop {
        let due = pending.as_ref().map(|update| update.due);
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    break;
                };
                match command {
                    PersistCommand::Create { game_id, document } => {
                        if let Some(update) = pending.take() {
                            worker.flush(update).await;
                        }
                        worker.create(game_id, document).await;
                    }
                    PersistCommand::Update { game_id, document } => {
                        match pending.as_mut() {
                            Some(update) if update.game_id == game_id => {
                                update.document = document;
                            }
                            _ => {
                                if let Some(update) = pending.take() {
                                    worker.flush(update).await;
                                }
                                pending = Some(PendingUpdate {
                                    game_id,
                                    document,
                                    due: Instant::now() + debounce,
                                });
                            }
                        }
                    }
                    PersistCommand::Finalize { game_id, record } => {
                        match pending.take() {
                            Some(update) if update.game_id != game_id => worker.flush(update).await,
                            _ => {}
                        }
                        worker.finalize(game_id, record).await;
                    }
                }
            }
            _ = sleep_until_due(due) => {
                if let Some(update) = pending.take() {
                    worker.flush(update).await;
                }
            }
        }
    }

    if let Some(update) = pending.take() {
        worker.flush(update).await;
    }
    debug!("persistence worker stopped");
}

async fn sleep_until_due(due: Option<Instant>) {
    match due {
        Some(due) => sleep_until(due).await,
        None => pending::<()>().await,
    }
}

impl Worker {
    async fn create(&mut self, game_id: Uuid, document: LiveGameDocument) -> Option<StoreId> {
        match self.store.create_live_game(document).await {
            Ok(store_id) => {
                info!(%game_id, %store_id, "live game stored");
                self.store_ids.insert(game_id, store_id.clone());
                self.report(PersistOutcome::Created {
                    game_id,
                    store_id: store_id.clone(),
                });
                Some(store_id)
            }
            Err(error) => {
                self.fail(game_id, PersistOperation::Create, error);
                None
            }
        }
    }

    /// Write the latest document, creating the live entry first when this
    /// device never stored the game (control arrived from a peer).
    async fn flush(&mut self, update: PendingUpdate) {
        let PendingUpdate {
            game_id, document, ..
        } = update;
        let Some(store_id) = self.store_ids.get(&game_id).cloned() else {
            self.create(game_id, document).await;
            return;
        };
        match self.store.update_live_game(store_id, document).await {
            Ok(()) => debug!(%game_id, "live game updated"),
            Err(error) => self.fail(game_id, PersistOperation::Update, error),
        }
    }

    async fn finalize(&mut self, game_id: Uuid, record: FinalizedGameRecord) {
        let store_id = match self.store_ids.remove(&game_id) {
            Some(store_id) => store_id,
            None => match self.create(game_id, LiveGameDocument::new()).await {
                Some(store_id) => {
                    self.store_ids.remove(&game_id);
                    store_id
                }
                None => return,
            },
        };

        if let Err(error) = self.store.finalize_game(store_id.clone(), record).await {
            self.fail(game_id, PersistOperation::Finalize, error);
            return;
        }
        if let Err(error) = self.store.delete_live_game(store_id).await {
            self.fail(game_id, PersistOperation::Delete, error);
            return;
        }
        info!(%game_id, "game finalized");
        self.report(PersistOutcome::Finalized { game_id });
    }

    fn fail(&self, game_id: Uuid, operation: PersistOperation, error: StorageError) {
        warn!(%game_id, operation = operation.as_str(), error = %error, "durable store call failed");
        self.report(PersistOutcome::Failed {
            game_id,
            operation,
            error,
        });
    }

    fn report(&self, outcome: PersistOutcome) {
        let _ = self.outcomes.send(outcome);
    }
}
