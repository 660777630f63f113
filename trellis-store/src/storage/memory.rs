// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use trellis_core::{MutationRecord, TenantId, Version};

use crate::snapshot::Snapshot;
use crate::storage::{ColdStore, SnapshotStore, StorageError};

/// Switch to simulate an unavailable backend.
#[derive(Clone, Debug, Default)]
struct FailureSwitch(Arc<AtomicBool>);

impl FailureSwitch {
    fn set(&self, failing: bool) {
        self.0.store(failing, Ordering::SeqCst);
    }

    fn check(&self, backend: &str) -> Result<(), StorageError> {
        if self.0.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(format!("{backend} is switched off")));
        }
        Ok(())
    }
}

/// In-memory snapshot store.
///
/// This does not persist data permanently, all snapshots are lost when the process ends. Use this
/// only in development or test contexts.
#[derive(Clone, Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: Arc<RwLock<HashMap<TenantId, Snapshot>>>,
    failing: FailureSwitch,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following call fail with `StorageError::Unavailable` until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.failing.set(failing);
    }

    fn read_store(&self) -> RwLockReadGuard<'_, HashMap<TenantId, Snapshot>> {
        self.snapshots
            .read()
            .expect("acquire shared read access on snapshot store")
    }

    fn write_store(&self) -> RwLockWriteGuard<'_, HashMap<TenantId, Snapshot>> {
        self.snapshots
            .write()
            .expect("acquire exclusive write access on snapshot store")
    }
}

impl SnapshotStore for MemorySnapshotStore {
    async fn put_snapshot(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        self.failing.check("snapshot store")?;
        let mut snapshots = self.write_store();
        // An older snapshot never replaces a newer one.
        let outdated = snapshots
            .get(&snapshot.tenant)
            .is_some_and(|existing| existing.version > snapshot.version);
        if !outdated {
            snapshots.insert(snapshot.tenant.clone(), snapshot.clone());
        }
        Ok(())
    }

    async fn latest_snapshot(&self, tenant: &TenantId) -> Result<Option<Snapshot>, StorageError> {
        self.failing.check("snapshot store")?;
        Ok(self.read_store().get(tenant).cloned())
    }
}

type Records = HashMap<TenantId, BTreeMap<Version, String>>;

/// In-memory mutation record store, keeping every record as a JSON document.
#[derive(Clone, Debug, Default)]
pub struct MemoryColdStore {
    records: Arc<RwLock<Records>>,
    failing: FailureSwitch,
}

impl MemoryColdStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following call fail with `StorageError::Unavailable` until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.failing.set(failing);
    }

    /// Number of stored records of a tenant.
    pub fn len(&self, tenant: &TenantId) -> usize {
        self.read_store().get(tenant).map_or(0, BTreeMap::len)
    }

    fn read_store(&self) -> RwLockReadGuard<'_, Records> {
        self.records
            .read()
            .expect("acquire shared read access on cold store")
    }

    fn write_store(&self) -> RwLockWriteGuard<'_, Records> {
        self.records
            .write()
            .expect("acquire exclusive write access on cold store")
    }
}

impl ColdStore for MemoryColdStore {
    async fn put_records(
        &self,
        tenant: &TenantId,
        records: &[MutationRecord],
    ) -> Result<(), StorageError> {
        self.failing.check("cold store")?;
        let encoded = records
            .iter()
            .map(|record| {
                serde_json::to_string(record)
                    .map(|json| (record.version, json))
                    .map_err(|err| StorageError::Corrupt(err.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.write_store()
            .entry(tenant.clone())
            .or_default()
            .extend(encoded);
        Ok(())
    }

    async fn get_records(
        &self,
        tenant: &TenantId,
        from_exclusive: Version,
    ) -> Result<Vec<MutationRecord>, StorageError> {
        self.failing.check("cold store")?;
        let store = self.read_store();
        let Some(records) = store.get(tenant) else {
            return Ok(Vec::new());
        };

        records
            .range(from_exclusive + 1..)
            .map(|(version, json)| {
                serde_json::from_str(json)
                    .map_err(|err| StorageError::Corrupt(format!("record {version}: {err}")))
            })
            .collect()
    }
}
