// SPDX-License-Identifier: MIT OR Apache-2.0

use thiserror::Error;
use trellis_core::{MutationRecord, TenantId, Version};

use crate::snapshot::Snapshot;

/// Failure of an external store.
///
/// Storage failures only degrade durability, the in-memory state keeps serving reads and writes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),

    #[error("stored data is corrupt: {0}")]
    Corrupt(String),
}

/// Blob storage holding the canonical snapshot of every tenant.
pub trait SnapshotStore {
    /// Store a snapshot, replacing older snapshots of the same tenant.
    fn put_snapshot(
        &self,
        snapshot: &Snapshot,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Returns the most recent snapshot of a tenant, if there is one.
    fn latest_snapshot(
        &self,
        tenant: &TenantId,
    ) -> impl Future<Output = Result<Option<Snapshot>, StorageError>> + Send;
}

/// Key-value store backing up mutation records, one record per key.
pub trait ColdStore {
    /// Write records. Writing a version which is already stored overwrites it with the same
    /// content.
    fn put_records(
        &self,
        tenant: &TenantId,
        records: &[MutationRecord],
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// All stored records with a version greater than `from_exclusive`, in version order.
    fn get_records(
        &self,
        tenant: &TenantId,
        from_exclusive: Version,
    ) -> impl Future<Output = Result<Vec<MutationRecord>, StorageError>> + Send;
}
