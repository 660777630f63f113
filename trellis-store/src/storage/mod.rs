// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interfaces to the external stores keeping snapshots and backed up mutation records.
#[cfg(feature = "memory")]
mod memory;
mod traits;

#[cfg(feature = "memory")]
pub use memory::{MemoryColdStore, MemorySnapshotStore};
pub use traits::{ColdStore, SnapshotStore, StorageError};
