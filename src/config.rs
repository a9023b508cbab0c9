//! Application-level configuration loading, including connection timings and the local identity.

use std::{
    env, fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::state::identity::{DeviceIdentity, Role};

/// Default location on disk where the node looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/courtside.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "COURTSIDE_CONFIG_PATH";
/// File under the data directory holding this install's identity.
const IDENTITY_FILE: &str = "device.json";

/// Timers driving the connection lifecycle and persistence, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Timings {
    pub scan_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub error_retry_ms: u64,
    pub reconnect_delay_ms: u64,
    pub keepalive_interval_ms: u64,
    /// Silent keep-alive intervals tolerated before the session is considered lost.
    pub keepalive_miss_limit: u32,
    pub persist_debounce_ms: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            scan_timeout_ms: 10_000,
            connect_timeout_ms: 15_000,
            error_retry_ms: 3_000,
            reconnect_delay_ms: 2_000,
            keepalive_interval_ms: 5_000,
            keepalive_miss_limit: 3,
            persist_debounce_ms: 1_000,
        }
    }
}

impl Timings {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn error_retry(&self) -> Duration {
        Duration::from_millis(self.error_retry_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    /// Inbound silence after which a connected session is treated as lost.
    pub fn liveness_window(&self) -> Duration {
        self.keepalive_interval() * self.keepalive_miss_limit.max(1)
    }

    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }
}

/// Ports and timing of the LAN transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LanSettings {
    pub tcp_port: u16,
    pub beacon_port: u16,
    pub beacon_interval_ms: u64,
    /// Beacons older than this make the peer count as lost.
    pub peer_expiry_ms: u64,
}

impl Default for LanSettings {
    fn default() -> Self {
        Self {
            tcp_port: 47_810,
            beacon_port: 47_811,
            beacon_interval_ms: 1_000,
            peer_expiry_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
/// Immutable runtime configuration shared across the application.
pub struct AppConfig {
    pub device_name: String,
    pub local_role: Role,
    pub data_dir: PathBuf,
    pub http_port: u16,
    pub period_length_secs: u64,
    pub retry_queue_capacity: usize,
    pub timings: Timings,
    pub lan: LanSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            device_name: "courtside".into(),
            local_role: Role::None,
            data_dir: PathBuf::from("data"),
            http_port: 8080,
            period_length_secs: 600,
            retry_queue_capacity: 512,
            timings: Timings::default(),
            lan: LanSettings::default(),
        }
    }
}

impl AppConfig {
    /// Load the application configuration from disk, falling back to built-in defaults.
    ///
    /// `PORT` overrides the HTTP port in either case.
    pub fn load() -> Self {
        let path = resolve_config_path();
        let mut config = match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<Self>(&contents) {
                Ok(config) => {
                    info!(
                        path = %path.display(),
                        device = %config.device_name,
                        role = %config.local_role,
                        "loaded configuration"
                    );
                    config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        };

        if let Some(port) = env::var("PORT")
            .ok()
            .and_then(|value| value.parse::<u16>().ok())
        {
            config.http_port = port;
        }
        config
    }

    pub fn period_length(&self) -> Duration {
        Duration::from_secs(self.period_length_secs)
    }

    /// Directory of the JSON-file game store.
    pub fn games_dir(&self) -> PathBuf {
        self.data_dir.join("games")
    }

    /// Identity of this install, generated on first use and kept under the data directory.
    ///
    /// The display name always follows the configuration.
    pub fn load_identity(&self) -> std::io::Result<DeviceIdentity> {
        load_or_create_identity(&self.data_dir.join(IDENTITY_FILE), &self.device_name)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct IdentityFile {
    id: String,
}

fn load_or_create_identity(path: &Path, display_name: &str) -> std::io::Result<DeviceIdentity> {
    match fs::read(path) {
        Ok(bytes) => match serde_json::from_slice::<IdentityFile>(&bytes) {
            Ok(file) if !file.id.is_empty() => return Ok(DeviceIdentity::new(file.id, display_name)),
            Ok(_) => warn!(path = %path.display(), "identity file has an empty id; regenerating"),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "identity file is corrupt; regenerating")
            }
        },
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }

    let id = Uuid::new_v4().to_string();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let contents = serde_json::to_vec_pretty(&IdentityFile { id: id.clone() })?;
    fs::write(path, contents)?;
    info!(path = %path.display(), %id, "generated device identity");
    Ok(DeviceIdentity::new(id, display_name))
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}
