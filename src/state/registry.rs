use indexmap::IndexMap;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::{
    dao::trust_store::{TrustStore, TrustedPeerRecord},
    services::trust_writer::TrustSaves,
    state::identity::{DeviceIdentity, Role},
    time_source::{from_millis, to_millis},
};

/// A previously paired device and the role it is expected to play for us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustedPeerEntry {
    pub identity: DeviceIdentity,
    pub expected_role: Role,
    pub last_connected_at: Option<OffsetDateTime>,
}

/// Which discovery sub-roles this device should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryMode {
    /// Scan for advertising peers.
    pub browse: bool,
    /// Advertise ourselves with this role.
    pub advertise: Option<Role>,
}

/// In-memory cache of trusted devices. Every mutation hands a full copy to the
/// trust writer; reads never leave the cache.
pub struct TrustedDeviceRegistry {
    entries: IndexMap<String, TrustedPeerEntry>,
    saves: TrustSaves,
}

impl TrustedDeviceRegistry {
    /// Load the registry from `store` and write later changes through `saves`.
    /// A store that cannot be read yields an empty registry.
    pub fn load(store: &dyn TrustStore, saves: TrustSaves) -> Self {
        let entries = match store.load() {
            Ok(records) => records
                .into_iter()
                .map(|record| (record.identity.id.clone(), record.into()))
                .collect(),
            Err(err) => {
                warn!(error = %err, "failed to load trusted devices; starting empty");
                IndexMap::new()
            }
        };
        info!(count = entries.len(), "trusted device registry loaded");
        Self { entries, saves }
    }

    /// Whether `identity` was paired with this device.
    pub fn is_trusted(&self, identity: &DeviceIdentity) -> bool {
        self.entries.contains_key(&identity.id)
    }

    /// Role `identity` is expected to play, if it is trusted.
    pub fn role_expected(&self, identity: &DeviceIdentity) -> Option<Role> {
        self.entries
            .get(&identity.id)
            .map(|entry| entry.expected_role)
    }

    /// Every entry in pairing order.
    pub fn entries(&self) -> Vec<TrustedPeerEntry> {
        self.entries.values().cloned().collect()
    }

    /// Pair `identity`, replacing any previous entry for the same device.
    pub fn add(&mut self, identity: DeviceIdentity, role: Role) {
        let last_connected_at = self
            .entries
            .get(&identity.id)
            .and_then(|entry| entry.last_connected_at);
        info!(peer = %identity, role = %role, "trusting device");
        self.entries.insert(
            identity.id.clone(),
            TrustedPeerEntry {
                identity,
                expected_role: role,
                last_connected_at,
            },
        );
        self.persist();
    }

    /// Forget a device. Returns the removed entry, if it existed.
    pub fn remove(&mut self, id: &str) -> Option<TrustedPeerEntry> {
        let removed = self.entries.shift_remove(id)?;
        info!(peer = %removed.identity, "device no longer trusted");
        self.persist();
        Some(removed)
    }

    /// Forget every device expected to play `role`.
    pub fn remove_role(&mut self, role: Role) -> Vec<TrustedPeerEntry> {
        let (removed, kept): (Vec<_>, Vec<_>) = self
            .entries
            .drain(..)
            .partition(|(_, entry)| entry.expected_role == role);
        self.entries = kept.into_iter().collect();
        if !removed.is_empty() {
            self.persist();
        }
        removed.into_iter().map(|(_, entry)| entry).collect()
    }

    /// Stamp the last successful session with `identity`. Unknown devices are ignored.
    pub fn update_last_connected(&mut self, identity: &DeviceIdentity, at: OffsetDateTime) {
        let Some(entry) = self.entries.get_mut(&identity.id) else {
            return;
        };
        entry.last_connected_at = Some(at);
        self.persist();
    }

    /// Decide which discovery sub-roles to run from the roles we hold entries for.
    ///
    /// A trusted controller means we are looking for one; a trusted recorder means it
    /// will look for us, so we advertise as controller. With neither we browse.
    pub fn discovery_mode(&self) -> DiscoveryMode {
        let expects_controller = self
            .entries
            .values()
            .any(|entry| entry.expected_role == Role::Controller);
        let expects_recorder = self
            .entries
            .values()
            .any(|entry| entry.expected_role == Role::Recorder);

        DiscoveryMode {
            browse: expects_controller || !expects_recorder,
            advertise: expects_recorder.then_some(Role::Controller),
        }
    }

    fn persist(&self) {
        let records = self
            .entries
            .values()
            .cloned()
            .map(TrustedPeerRecord::from)
            .collect::<Vec<_>>();
        if self.saves.send(records).is_err() {
            warn!("trust writer is gone; keeping in-memory copy only");
        }
    }
}

impl From<TrustedPeerRecord> for TrustedPeerEntry {
    fn from(value: TrustedPeerRecord) -> Self {
        Self {
            identity: value.identity,
            expected_role: value.expected_role,
            last_connected_at: value.last_connected_at.map(from_millis),
        }
    }
}

impl From<TrustedPeerEntry> for TrustedPeerRecord {
    fn from(value: TrustedPeerEntry) -> Self {
        Self {
            identity: value.identity,
            expected_role: value.expected_role,
            last_connected_at: value.last_connected_at.map(to_millis),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::dao::trust_store::MemoryTrustStore;

    type Saved = mpsc::UnboundedReceiver<Vec<TrustedPeerRecord>>;

    fn registry() -> (TrustedDeviceRegistry, Saved) {
        let (saves, saved) = mpsc::unbounded_channel();
        (
            TrustedDeviceRegistry::load(&MemoryTrustStore::default(), saves),
            saved,
        )
    }

    fn last_saved(saved: &mut Saved) -> Option<Vec<TrustedPeerRecord>> {
        let mut last = None;
        while let Ok(records) = saved.try_recv() {
            last = Some(records);
        }
        last
    }

    fn device(id: &str) -> DeviceIdentity {
        DeviceIdentity::new(id, format!("{id}-name"))
    }

    #[test]
    fn unknown_device_is_absent() {
        let (registry, _) = registry();
        assert!(!registry.is_trusted(&device("x")));
        assert_eq!(registry.role_expected(&device("x")), None);
    }

    #[test]
    fn every_mutation_is_persisted() {
        let (mut registry, mut saved) = registry();
        registry.add(device("a"), Role::Recorder);
        assert_eq!(last_saved(&mut saved).map(|records| records.len()), Some(1));

        registry.update_last_connected(&device("a"), from_millis(42));
        let records = last_saved(&mut saved).unwrap();
        assert_eq!(records[0].last_connected_at, Some(42));

        registry.remove("a");
        assert_eq!(last_saved(&mut saved), Some(Vec::new()));

        // nothing to forget, nothing to write
        registry.remove("a");
        registry.update_last_connected(&device("a"), from_millis(43));
        assert_eq!(last_saved(&mut saved), None);
    }

    #[test]
    fn re_pairing_keeps_last_connection_stamp() {
        let (mut registry, _) = registry();
        registry.add(device("a"), Role::Recorder);
        registry.update_last_connected(&device("a"), from_millis(42));
        registry.add(device("a"), Role::Controller);

        let entries = registry.entries();
        let entry = &entries[0];
        assert_eq!(entry.expected_role, Role::Controller);
        assert_eq!(entry.last_connected_at, Some(from_millis(42)));
    }

    #[test]
    fn loads_existing_records_at_startup() {
        let store = MemoryTrustStore::with_records(vec![TrustedPeerRecord {
            identity: device("a"),
            expected_role: Role::Controller,
            last_connected_at: None,
        }]);
        let (saves, _saved) = mpsc::unbounded_channel();
        let registry = TrustedDeviceRegistry::load(&store, saves);
        assert_eq!(registry.role_expected(&device("a")), Some(Role::Controller));
    }

    #[test]
    fn discovery_mode_follows_trusted_roles() {
        let (mut registry, _) = registry();
        assert_eq!(
            registry.discovery_mode(),
            DiscoveryMode {
                browse: true,
                advertise: None
            }
        );

        registry.add(device("rec"), Role::Recorder);
        assert_eq!(
            registry.discovery_mode(),
            DiscoveryMode {
                browse: false,
                advertise: Some(Role::Controller)
            }
        );

        registry.add(device("ctl"), Role::Controller);
        assert_eq!(
            registry.discovery_mode(),
            DiscoveryMode {
                browse: true,
                advertise: Some(Role::Controller)
            }
        );
    }

    #[test]
    fn remove_role_only_drops_matching_entries() {
        let (mut registry, _) = registry();
        registry.add(device("rec"), Role::Recorder);
        registry.add(device("ctl"), Role::Controller);

        let removed = registry.remove_role(Role::Controller);
        assert_eq!(removed.len(), 1);
        assert!(registry.is_trusted(&device("rec")));
        assert!(!registry.is_trusted(&device("ctl")));
    }
}
