// SPDX-License-Identifier: MIT OR Apache-2.0

//! Background task writing tenant state to external storage.
//!
//! Failing backups only degrade durability. They are logged, reported through
//! [`StorageHealth`] and retried with backoff, authorization keeps working from memory.
use tokio::sync::watch;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};
use trellis_core::Version;
use trellis_store::{ColdStore, SnapshotStore, StorageError};

use crate::registry::TenantRegistry;
use crate::tenant::{Tenant, now};

/// Durability state as seen by operators.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum StorageHealth {
    #[default]
    Healthy,

    /// The last backup attempt of at least one tenant failed.
    Degraded { failing_tenants: usize, error: String },
}

/// Write everything pending of a tenant to external storage and confirm it.
///
/// Log records are written before the snapshot so cold storage never falls behind the latest
/// snapshot. Returns the version which is durable now.
pub async fn backup_tenant<S, C>(
    tenant: &Tenant,
    snapshots: &S,
    cold: &C,
) -> Result<Version, StorageError>
where
    S: SnapshotStore,
    C: ColdStore,
{
    let pending = tenant.pending_backup();
    trace!(
        tenant = %tenant.id(),
        version = pending.version,
        records = pending.records.len(),
        "backing up tenant"
    );

    if !pending.records.is_empty() {
        cold.put_records(tenant.id(), &pending.records).await?;
    }
    snapshots.put_snapshot(&pending.snapshot).await?;

    tenant.complete_backup(pending.version);
    Ok(pending.version)
}

/// Write the logged mutations of a tenant to cold storage without taking a snapshot.
///
/// Used for poisoned tenants, whose edge store may hold a change the log refused. Every
/// acknowledged mutation is in the log, so a reload from the last snapshot and these records
/// recovers exactly the acknowledged state.
pub async fn backup_log<C>(tenant: &Tenant, cold: &C) -> Result<usize, StorageError>
where
    C: ColdStore,
{
    let records = tenant.pending_records();
    if !records.is_empty() {
        cold.put_records(tenant.id(), &records).await?;
    }
    debug!(tenant = %tenant.id(), records = records.len(), "backed up mutation log");
    Ok(records.len())
}

/// Periodically backs up every active tenant which needs it.
pub struct BackupWorker<S, C> {
    registry: TenantRegistry<S, C>,
    health: watch::Sender<StorageHealth>,
}

impl<S, C> BackupWorker<S, C>
where
    S: SnapshotStore + Send + Sync + 'static,
    C: ColdStore + Send + Sync + 'static,
{
    pub fn new(registry: TenantRegistry<S, C>) -> Self {
        let (health, _) = watch::channel(StorageHealth::Healthy);
        Self { registry, health }
    }

    /// Subscribe to changes of the storage health.
    pub fn health(&self) -> watch::Receiver<StorageHealth> {
        self.health.subscribe()
    }

    /// Run until the token is cancelled. Pending mutations are backed up a last time on
    /// shutdown.
    pub async fn run(self, token: CancellationToken) {
        let mut ticks = interval(self.registry.config().backup_interval);

        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => {
                    debug!("backup worker received shutdown signal");
                    break;
                }
                _ = ticks.tick() => {
                    self.run_once().await;
                }
            }
        }

        for tenant in self.registry.active() {
            if tenant.is_dirty() && !tenant.is_poisoned() {
                if let Err(err) = self.backup(&tenant).await {
                    error!(tenant = %tenant.id(), %err, "final backup failed");
                }
            }
        }
    }

    /// Back up all tenants which are due. Returns the number of successful backups.
    pub async fn run_once(&self) -> usize {
        let at = now();
        let mut succeeded = 0;
        let mut failing_tenants = 0;
        let mut last_error = None;

        for tenant in self.registry.active() {
            if !tenant.needs_backup(at) {
                // Tenants waiting for a retry still count as failing.
                if tenant.consecutive_backup_failures() > 0 {
                    failing_tenants += 1;
                }
                continue;
            }

            match self.backup(&tenant).await {
                Ok(_) => succeeded += 1,
                Err(err) => {
                    let retry_in = tenant.fail_backup(now());
                    error!(
                        tenant = %tenant.id(),
                        %err,
                        ?retry_in,
                        "backup failed, durability degraded"
                    );
                    failing_tenants += 1;
                    last_error = Some(err.to_string());
                }
            }
        }

        let health = match (failing_tenants, last_error) {
            (0, _) => StorageHealth::Healthy,
            (failing_tenants, error) => StorageHealth::Degraded {
                failing_tenants,
                error: error.unwrap_or_else(|| "retry pending".into()),
            },
        };
        self.health.send_if_modified(|current| {
            if *current == health {
                return false;
            }
            *current = health;
            true
        });

        succeeded
    }

    async fn backup(&self, tenant: &Tenant) -> Result<Version, StorageError> {
        backup_tenant(tenant, self.registry.snapshots(), self.registry.cold()).await
    }
}
