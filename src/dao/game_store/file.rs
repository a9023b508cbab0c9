//! Durable store writing one JSON document per game under the data directory.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::fs;
use uuid::Uuid;

use crate::dao::{
    game_store::GameStore,
    models::{FinalizedGameRecord, LiveGameDocument, StoreId},
    storage::{StorageError, StorageResult},
};

const LIVE_DIR: &str = "live";
const FINAL_DIR: &str = "final";

/// Stores live games in `<root>/live/<id>.json` and finished ones in `<root>/final/<id>.json`.
#[derive(Debug, Clone)]
pub struct JsonFileGameStore {
    root: Arc<Path>,
}

impl JsonFileGameStore {
    /// Use `root` (created lazily) as the store directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root: PathBuf = root.into();
        Self {
            root: Arc::from(root),
        }
    }

    fn live_path(&self, id: &str) -> PathBuf {
        self.root.join(LIVE_DIR).join(format!("{id}.json"))
    }

    fn final_path(&self, id: &str) -> PathBuf {
        self.root.join(FINAL_DIR).join(format!("{id}.json"))
    }
}

async fn write_json(path: PathBuf, value: &impl Serialize) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(|err| {
            StorageError::unavailable(format!("creating {}", parent.display()), err)
        })?;
    }
    let payload = serde_json::to_vec_pretty(value)
        .map_err(|err| StorageError::corrupt(format!("encoding {}", path.display()), err))?;

    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, payload)
        .await
        .map_err(|err| StorageError::unavailable(format!("writing {}", tmp.display()), err))?;
    fs::rename(&tmp, &path)
        .await
        .map_err(|err| StorageError::unavailable(format!("replacing {}", path.display()), err))
}

impl GameStore for JsonFileGameStore {
    fn create_live_game(&self, state: LiveGameDocument) -> BoxFuture<'static, StorageResult<StoreId>> {
        let id = Uuid::new_v4().simple().to_string();
        let path = self.live_path(&id);
        Box::pin(async move {
            write_json(path, &state).await?;
            Ok(id)
        })
    }

    fn update_live_game(
        &self,
        id: StoreId,
        state: LiveGameDocument,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let path = self.live_path(&id);
        Box::pin(async move {
            match fs::metadata(&path).await {
                Ok(_) => write_json(path, &state).await,
                Err(err) if err.kind() == ErrorKind::NotFound => Err(StorageError::NotFound(id)),
                Err(err) => Err(StorageError::unavailable(
                    format!("reading {}", path.display()),
                    err,
                )),
            }
        })
    }

    fn finalize_game(
        &self,
        id: StoreId,
        record: FinalizedGameRecord,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let path = self.final_path(&id);
        Box::pin(async move { write_json(path, &record).await })
    }

    fn delete_live_game(&self, id: StoreId) -> BoxFuture<'static, StorageResult<()>> {
        let path = self.live_path(&id);
        Box::pin(async move {
            match fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == ErrorKind::NotFound => Err(StorageError::NotFound(id)),
                Err(err) => Err(StorageError::unavailable(
                    format!("removing {}", path.display()),
                    err,
                )),
            }
        })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let root = self.root.clone();
        Box::pin(async move {
            fs::create_dir_all(&*root).await.map_err(|err| {
                StorageError::unavailable(format!("creating {}", root.display()), err)
            })
        })
    }
}
