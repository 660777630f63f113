// SPDX-License-Identifier: MIT OR Apache-2.0

//! Multi-tenant relationship-based authorization engine.
//!
//! Each tenant keeps a graph of users, groups and resources in memory. Permissions are granted
//! by edges between them and can be checked directly or through group membership and
//! inheritance, callers can also prove a permission by presenting the chain of edges it rests
//! on. Every change is recorded in an ordered mutation log, which readers use to keep local
//! copies in sync and which is backed up to external storage together with periodic snapshots.
//!
//! ## Example
//!
//! ```
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use trellis::{Actor, EngineConfig, TenantRegistry};
//! use trellis_core::{Capability, EntityId, TenantId};
//! use trellis_store::{MemoryColdStore, MemorySnapshotStore};
//!
//! let registry = TenantRegistry::new(
//!     EngineConfig::default(),
//!     MemorySnapshotStore::new(),
//!     MemoryColdStore::new(),
//! );
//! let tenant = registry.load(&TenantId::new("acme")?).await?;
//!
//! let alice = EntityId::user("alice");
//! let doc = EntityId::resource("doc1");
//! tenant.grant(&Actor::System, alice.clone(), doc.clone(), Capability::Read)?;
//! assert!(tenant.check(&alice, &doc, &Capability::Read)?.allowed);
//! # Ok(())
//! # }
//! ```
pub mod backup;
mod config;
pub mod registry;
pub mod tenant;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;
#[cfg(test)]
mod tests;

pub use backup::{BackupWorker, StorageHealth, backup_log, backup_tenant};
pub use config::EngineConfig;
pub use registry::{RegistryError, TenantRegistry, TenantStatus};
pub use tenant::{Actor, MutationOutcome, PendingBackup, Tenant, TenantError};
