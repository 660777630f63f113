// SPDX-License-Identifier: MIT OR Apache-2.0

//! Durability layer of the trellis authorization engine.
//!
//! The [`MutationLog`] is the source of truth for replay and incremental catch-up, snapshots
//! give a point-in-time copy of an edge store in a canonical tabular format. Both can be written
//! to external stores, the [`BackupScheduler`] decides when.
pub mod backup;
pub mod log;
pub mod snapshot;
pub mod storage;

pub use backup::{BackupPolicy, BackupScheduler};
pub use log::{DEFAULT_RETENTION, LogError, MutationLog};
pub use snapshot::{Snapshot, SnapshotError, SnapshotFiles};
#[cfg(feature = "memory")]
pub use storage::{MemoryColdStore, MemorySnapshotStore};
pub use storage::{ColdStore, SnapshotStore, StorageError};
