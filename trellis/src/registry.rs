// SPDX-License-Identifier: MIT OR Apache-2.0

//! Lifecycle of the tenants hosted by one process.
//!
//! Every tenant moves through `Unloaded → Loading → Active → Evicting → Unloaded`. Loading
//! imports the latest snapshot and replays backed up mutations on top of it, eviction writes
//! pending mutations to external storage first. While a tenant is loading or evicting further
//! lifecycle requests for it fail with [`RegistryError::TenantBusy`].
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;
use tracing::{debug, info, warn};
use trellis_core::{AuditSink, EdgeStore, MutationError, TenantId, TracingAuditSink};
use trellis_store::{ColdStore, LogError, MutationLog, SnapshotError, SnapshotStore, StorageError};
use trellis_sync::SyncCoordinator;

use crate::backup::{backup_log, backup_tenant};
use crate::config::EngineConfig;
use crate::tenant::{Tenant, TenantError};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("tenant {0} is loading or evicting")]
    TenantBusy(TenantId),

    #[error("tenant {0} is not loaded")]
    NotLoaded(TenantId),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("failed importing snapshot: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("failed restoring mutation log: {0}")]
    Log(#[from] LogError),

    #[error("failed replaying mutation: {0}")]
    Replay(#[from] MutationError),

    #[error(transparent)]
    Tenant(#[from] TenantError),
}

/// Lifecycle state of a tenant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TenantStatus {
    Unloaded,
    Loading,
    Active,
    Evicting,
}

#[derive(Clone, Debug)]
enum Slot {
    Loading,
    Active(Tenant),
    Evicting,
}

type Slots = HashMap<TenantId, Slot>;

struct Inner<S, C> {
    config: Arc<EngineConfig>,
    snapshots: S,
    cold: C,
    coordinator: SyncCoordinator,
    audit: Arc<dyn AuditSink>,
    slots: RwLock<Slots>,
}

/// Owns the tenants of a host, addressed by tenant id.
pub struct TenantRegistry<S, C> {
    inner: Arc<Inner<S, C>>,
}

impl<S, C> Clone for TenantRegistry<S, C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S, C> TenantRegistry<S, C>
where
    S: SnapshotStore + Send + Sync + 'static,
    C: ColdStore + Send + Sync + 'static,
{
    /// Create a registry which writes audit events to the `tracing` log.
    pub fn new(config: EngineConfig, snapshots: S, cold: C) -> Self {
        Self::with_audit(config, snapshots, cold, Arc::new(TracingAuditSink))
    }

    pub fn with_audit(
        config: EngineConfig,
        snapshots: S,
        cold: C,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let coordinator = SyncCoordinator::new(config.sync.clone(), config.broadcast_capacity);
        Self {
            inner: Arc::new(Inner {
                config: Arc::new(config),
                snapshots,
                cold,
                coordinator,
                audit,
                slots: RwLock::new(HashMap::new()),
            }),
        }
    }

    fn read_slots(&self) -> RwLockReadGuard<'_, Slots> {
        self.inner
            .slots
            .read()
            .expect("acquire shared read access on tenant slots")
    }

    fn write_slots(&self) -> RwLockWriteGuard<'_, Slots> {
        self.inner
            .slots
            .write()
            .expect("acquire exclusive write access on tenant slots")
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn coordinator(&self) -> &SyncCoordinator {
        &self.inner.coordinator
    }

    pub(crate) fn snapshots(&self) -> &S {
        &self.inner.snapshots
    }

    pub(crate) fn cold(&self) -> &C {
        &self.inner.cold
    }

    pub fn status(&self, id: &TenantId) -> TenantStatus {
        match self.read_slots().get(id) {
            None => TenantStatus::Unloaded,
            Some(Slot::Loading) => TenantStatus::Loading,
            Some(Slot::Active(_)) => TenantStatus::Active,
            Some(Slot::Evicting) => TenantStatus::Evicting,
        }
    }

    /// Returns the tenant if it is active.
    pub fn get(&self, id: &TenantId) -> Option<Tenant> {
        match self.read_slots().get(id) {
            Some(Slot::Active(tenant)) => Some(tenant.clone()),
            _ => None,
        }
    }

    /// All active tenants.
    pub fn active(&self) -> Vec<Tenant> {
        self.read_slots()
            .values()
            .filter_map(|slot| match slot {
                Slot::Active(tenant) => Some(tenant.clone()),
                _ => None,
            })
            .collect()
    }

    /// Returns the active tenant, loading it from external storage first if necessary.
    pub async fn load(&self, id: &TenantId) -> Result<Tenant, RegistryError> {
        {
            let mut slots = self.write_slots();
            match slots.get(id) {
                Some(Slot::Active(tenant)) => return Ok(tenant.clone()),
                Some(Slot::Loading | Slot::Evicting) => {
                    return Err(RegistryError::TenantBusy(id.clone()));
                }
                None => {
                    slots.insert(id.clone(), Slot::Loading);
                }
            }
        }

        // Leaves the tenant unloaded if restoring fails or this future is dropped.
        let guard = SlotGuard::new(self, id, None);
        let tenant = self.restore(id).await?;
        guard.commit(Slot::Active(tenant.clone()));

        info!(tenant = %id, version = tenant.version(), "tenant active");
        Ok(tenant)
    }

    async fn restore(&self, id: &TenantId) -> Result<Tenant, RegistryError> {
        let (mut store, base_version) = match self.inner.snapshots.latest_snapshot(id).await? {
            Some(snapshot) => (snapshot.to_store()?, snapshot.version),
            None => (EdgeStore::new(), 0),
        };

        let records = self.inner.cold.get_records(id, base_version).await?;
        debug!(
            tenant = %id,
            base_version,
            replay = records.len(),
            "restoring tenant"
        );

        let log = MutationLog::restore(self.inner.config.retention, base_version, records)?;
        for record in log.iter() {
            record.apply(&mut store)?;
        }

        let tenant = Tenant::restore(
            id.clone(),
            self.inner.config.clone(),
            self.inner.coordinator.clone(),
            self.inner.audit.clone(),
            store,
            log,
        )?;
        Ok(tenant)
    }

    /// Unload an active tenant, backing up pending mutations first.
    ///
    /// Handles to the tenant refuse mutations from the start of the eviction and refuse
    /// everything once it completed. If the backup fails the tenant stays active. Poisoned
    /// tenants only back up their log.
    pub async fn evict(&self, id: &TenantId) -> Result<(), RegistryError> {
        let tenant = {
            let mut slots = self.write_slots();
            match slots.get(id) {
                None => return Err(RegistryError::NotLoaded(id.clone())),
                Some(Slot::Loading | Slot::Evicting) => {
                    return Err(RegistryError::TenantBusy(id.clone()));
                }
                Some(Slot::Active(tenant)) => {
                    let tenant = tenant.clone();
                    slots.insert(id.clone(), Slot::Evicting);
                    tenant
                }
            }
        };

        let guard = SlotGuard::new(self, id, Some(Slot::Active(tenant.clone())));
        tenant.begin_eviction();
        if tenant.is_dirty() {
            let result = if tenant.is_poisoned() {
                warn!(tenant = %id, "evicting poisoned tenant, backing up its log only");
                backup_log(&tenant, self.cold()).await.map(|_| ())
            } else {
                backup_tenant(&tenant, self.snapshots(), self.cold())
                    .await
                    .map(|_| ())
            };
            if let Err(err) = result {
                warn!(tenant = %id, %err, "backup before eviction failed, keeping tenant");
                return Err(err.into());
            }
        }
        guard.remove();
        tenant.finish_eviction();

        self.inner.coordinator.close(id);
        info!(tenant = %id, "tenant evicted");
        Ok(())
    }
}

/// Resolves a transitional slot when a lifecycle operation ends, also when its future is
/// dropped halfway.
struct SlotGuard<'a> {
    slots: &'a RwLock<Slots>,
    id: &'a TenantId,

    /// Slot to fall back to if the operation does not complete, `None` to unload.
    fallback: Option<Option<Slot>>,
}

impl<'a> SlotGuard<'a> {
    fn new<S, C>(
        registry: &'a TenantRegistry<S, C>,
        id: &'a TenantId,
        fallback: Option<Slot>,
    ) -> Self {
        Self {
            slots: &registry.inner.slots,
            id,
            fallback: Some(fallback),
        }
    }

    fn set(&mut self, slot: Option<Slot>) {
        let mut slots = self
            .slots
            .write()
            .expect("acquire exclusive write access on tenant slots");
        match slot {
            Some(slot) => slots.insert(self.id.clone(), slot),
            None => slots.remove(self.id),
        };
    }

    fn commit(mut self, slot: Slot) {
        self.fallback = None;
        self.set(Some(slot));
    }

    fn remove(mut self) {
        self.fallback = None;
        self.set(None);
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if let Some(fallback) = self.fallback.take() {
            if let Some(Slot::Active(tenant)) = &fallback {
                tenant.abort_eviction();
            }
            self.set(fallback);
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use trellis_core::{Capability, EntityId, TenantId};
    use trellis_store::{ColdStore, SnapshotStore};

    use super::{RegistryError, TenantStatus};
    use crate::tenant::{Actor, MutationOutcome, TenantError};
    use crate::test_utils::TestHost;

    #[tokio::test]
    async fn lifecycle() {
        let TestHost { registry, cold, .. } = TestHost::default();
        let acme = TenantId::new("acme").unwrap();
        assert_eq!(registry.status(&acme), TenantStatus::Unloaded);
        assert_matches!(
            registry.evict(&acme).await,
            Err(RegistryError::NotLoaded(_))
        );

        let tenant = registry.load(&acme).await.unwrap();
        assert_eq!(registry.status(&acme), TenantStatus::Active);
        assert_eq!(tenant.version(), 0);

        tenant
            .grant(
                &Actor::System,
                EntityId::user("alice"),
                EntityId::resource("doc1"),
                Capability::Read,
            )
            .unwrap();

        // Loading an active tenant hands out the same state.
        let again = registry.load(&acme).await.unwrap();
        assert_eq!(again.version(), 1);
        assert_eq!(registry.active().len(), 1);

        registry.evict(&acme).await.unwrap();
        assert_eq!(registry.status(&acme), TenantStatus::Unloaded);
        assert!(registry.get(&acme).is_none());
        assert_eq!(cold.len(&acme), 1);

        let reloaded = registry.load(&acme).await.unwrap();
        assert_eq!(reloaded.version(), 1);
        assert!(
            reloaded
                .check(
                    &EntityId::user("alice"),
                    &EntityId::resource("doc1"),
                    &Capability::Read
                )
                .unwrap()
                .allowed
        );
    }

    #[tokio::test]
    async fn replays_cold_records_after_snapshot() {
        let TestHost {
            registry,
            snapshots,
            cold,
            ..
        } = TestHost::default();
        let acme = TenantId::new("acme").unwrap();

        let tenant = registry.load(&acme).await.unwrap();
        let grant = |name: &str| {
            tenant
                .grant(
                    &Actor::System,
                    EntityId::user(name),
                    EntityId::resource("doc1"),
                    Capability::Read,
                )
                .unwrap()
        };

        grant("alice");
        grant("bob");
        let pending = tenant.pending_backup();
        cold.put_records(&acme, &pending.records).await.unwrap();
        snapshots.put_snapshot(&pending.snapshot).await.unwrap();
        tenant.complete_backup(pending.version);

        // Only backed up to cold storage, the snapshot still is at version 2.
        grant("carol");
        let pending = tenant.pending_backup();
        cold.put_records(&acme, &pending.records).await.unwrap();
        tenant.complete_backup(pending.version);

        registry.evict(&acme).await.unwrap();
        let reloaded = registry.load(&acme).await.unwrap();
        assert_eq!(reloaded.version(), 3);
        assert!(
            reloaded
                .check(
                    &EntityId::user("carol"),
                    &EntityId::resource("doc1"),
                    &Capability::Read
                )
                .unwrap()
                .allowed
        );
    }

    #[tokio::test]
    async fn failed_eviction_keeps_tenant_active() {
        let TestHost {
            registry,
            snapshots,
            ..
        } = TestHost::default();
        let acme = TenantId::new("acme").unwrap();

        let tenant = registry.load(&acme).await.unwrap();
        tenant
            .grant(
                &Actor::System,
                EntityId::user("alice"),
                EntityId::resource("doc1"),
                Capability::Read,
            )
            .unwrap();

        snapshots.set_failing(true);
        assert_matches!(
            registry.evict(&acme).await,
            Err(RegistryError::Storage(_))
        );
        assert_eq!(registry.status(&acme), TenantStatus::Active);
        assert!(tenant.is_dirty());

        // The handle accepts writes again.
        assert_matches!(
            tenant.grant(
                &Actor::System,
                EntityId::user("bob"),
                EntityId::resource("doc1"),
                Capability::Read,
            ),
            Ok(MutationOutcome::Applied { version: 2, .. })
        );

        snapshots.set_failing(false);
        registry.evict(&acme).await.unwrap();
        assert_eq!(registry.status(&acme), TenantStatus::Unloaded);
    }

    #[tokio::test]
    async fn evicted_handles_refuse_writes() {
        let TestHost { registry, .. } = TestHost::default();
        let acme = TenantId::new("acme").unwrap();
        let alice = EntityId::user("alice");
        let bob = EntityId::user("bob");
        let doc = EntityId::resource("doc1");

        let stale = registry.load(&acme).await.unwrap();
        stale
            .grant(&Actor::System, alice.clone(), doc.clone(), Capability::Read)
            .unwrap();
        registry.evict(&acme).await.unwrap();

        assert_matches!(
            stale.grant(&Actor::System, bob.clone(), doc.clone(), Capability::Read),
            Err(TenantError::Evicted(_))
        );
        assert_matches!(
            stale.check(&alice, &doc, &Capability::Read),
            Err(TenantError::Evicted(_))
        );

        let tenant = registry.load(&acme).await.unwrap();
        assert_eq!(tenant.version(), 1);
        assert_matches!(
            tenant.grant(&Actor::System, bob.clone(), doc.clone(), Capability::Read),
            Ok(MutationOutcome::Applied { version: 2, .. })
        );
        assert_matches!(
            stale.grant(&Actor::System, bob, doc, Capability::Read),
            Err(TenantError::Evicted(_))
        );
        assert_eq!(stale.version(), 1);
    }

    #[tokio::test]
    async fn poisoned_tenants_keep_logged_mutations() {
        let TestHost {
            registry,
            snapshots,
            cold,
            ..
        } = TestHost::default();
        let acme = TenantId::new("acme").unwrap();
        let alice = EntityId::user("alice");
        let doc = EntityId::resource("doc1");

        let tenant = registry.load(&acme).await.unwrap();
        tenant
            .grant(&Actor::System, alice.clone(), doc.clone(), Capability::Read)
            .unwrap();
        tenant.poison("index mismatch");

        registry.evict(&acme).await.unwrap();
        assert_eq!(cold.len(&acme), 1);
        assert!(snapshots.latest_snapshot(&acme).await.unwrap().is_none());

        let reloaded = registry.load(&acme).await.unwrap();
        assert!(!reloaded.is_poisoned());
        assert_eq!(reloaded.version(), 1);
        assert!(reloaded.check(&alice, &doc, &Capability::Read).unwrap().allowed);
    }

    #[tokio::test]
    async fn failed_load_leaves_tenant_unloaded() {
        let TestHost {
            registry,
            snapshots,
            ..
        } = TestHost::default();
        let acme = TenantId::new("acme").unwrap();

        snapshots.set_failing(true);
        assert_matches!(
            registry.load(&acme).await,
            Err(RegistryError::Storage(_))
        );
        assert_eq!(registry.status(&acme), TenantStatus::Unloaded);

        snapshots.set_failing(false);
        assert!(registry.load(&acme).await.is_ok());
    }
}
