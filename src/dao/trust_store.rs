//! Local persistence for the trusted device list.
//!
//! The registry keeps its own in-memory cache and only writes through this
//! layer; reads happen once, at startup.

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    dao::storage::{StorageError, StorageResult},
    state::identity::{DeviceIdentity, Role},
};

const TRUST_FILE_NAME: &str = "trusted_devices.json";
const TRUST_FILE_VERSION: u32 = 1;

/// Persisted form of a trusted peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustedPeerRecord {
    pub identity: DeviceIdentity,
    pub expected_role: Role,
    /// Unix milliseconds of the last established session, if any.
    pub last_connected_at: Option<i64>,
}

/// Backend able to load and replace the whole trusted device list.
pub trait TrustStore: Send + Sync {
    /// Load every persisted entry, in insertion order.
    fn load(&self) -> StorageResult<Vec<TrustedPeerRecord>>;
    /// Replace the persisted list with `records`.
    fn save(&self, records: &[TrustedPeerRecord]) -> StorageResult<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct TrustFile {
    version: u32,
    devices: Vec<TrustedPeerRecord>,
}

/// JSON file under the data directory, replaced atomically on each save.
#[derive(Debug, Clone)]
pub struct JsonTrustStore {
    path: PathBuf,
}

impl JsonTrustStore {
    /// Store the list in `<data_dir>/trusted_devices.json`.
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir.as_ref().join(TRUST_FILE_NAME),
        }
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TrustStore for JsonTrustStore {
    fn load(&self) -> StorageResult<Vec<TrustedPeerRecord>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no trusted device file; starting empty");
                return Ok(Vec::new());
            }
            Err(err) => {
                return Err(StorageError::unavailable(
                    format!("reading {}", self.path.display()),
                    err,
                ));
            }
        };

        let file: TrustFile = serde_json::from_str(&contents).map_err(|err| {
            StorageError::corrupt(format!("parsing {}", self.path.display()), err)
        })?;
        if file.version != TRUST_FILE_VERSION {
            warn!(
                path = %self.path.display(),
                version = file.version,
                "unexpected trusted device file version; reading anyway"
            );
        }
        Ok(file.devices)
    }

    fn save(&self, records: &[TrustedPeerRecord]) -> StorageResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                StorageError::unavailable(format!("creating {}", parent.display()), err)
            })?;
        }

        let file = TrustFile {
            version: TRUST_FILE_VERSION,
            devices: records.to_vec(),
        };
        let payload = serde_json::to_vec_pretty(&file)
            .map_err(|err| StorageError::corrupt("encoding trusted devices".into(), err))?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, payload)
            .map_err(|err| StorageError::unavailable(format!("writing {}", tmp.display()), err))?;
        fs::rename(&tmp, &self.path).map_err(|err| {
            StorageError::unavailable(format!("replacing {}", self.path.display()), err)
        })
    }
}

/// Volatile store, used when nothing must survive a restart.
#[derive(Debug, Default)]
pub struct MemoryTrustStore {
    records: std::sync::Mutex<Vec<TrustedPeerRecord>>,
}

impl MemoryTrustStore {
    /// Seed the store with existing records.
    pub fn with_records(records: Vec<TrustedPeerRecord>) -> Self {
        Self {
            records: std::sync::Mutex::new(records),
        }
    }

    /// Copy of what was last saved.
    pub fn saved(&self) -> Vec<TrustedPeerRecord> {
        self.records
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

impl TrustStore for MemoryTrustStore {
    fn load(&self) -> StorageResult<Vec<TrustedPeerRecord>> {
        Ok(self.saved())
    }

    fn save(&self, records: &[TrustedPeerRecord]) -> StorageResult<()> {
        if let Ok(mut guard) = self.records.lock() {
            *guard = records.to_vec();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("courtside-trust-{tag}-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn missing_file_loads_empty() {
        let store = JsonTrustStore::new(temp_dir("missing"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn saved_records_survive_reload() {
        let dir = temp_dir("reload");
        let store = JsonTrustStore::new(&dir);
        let record = TrustedPeerRecord {
            identity: DeviceIdentity::new("ipad-1", "Bench iPad"),
            expected_role: Role::Recorder,
            last_connected_at: Some(1_700_000_000_000),
        };
        store.save(std::slice::from_ref(&record)).unwrap();

        let reopened = JsonTrustStore::new(&dir);
        assert_eq!(reopened.load().unwrap(), vec![record]);
    }

    #[test]
    fn garbage_file_is_reported_as_corrupt() {
        let dir = temp_dir("corrupt");
        fs::write(dir.join(TRUST_FILE_NAME), "not json").unwrap();
        let err = JsonTrustStore::new(&dir).load().unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { .. }));
    }
}
