// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::Arc;

use trellis_core::{EdgeType, EntityId, MemoryAuditLog};
use trellis_store::{MemoryColdStore, MemorySnapshotStore};

pub use trellis_core::test_utils::setup_logging;

use crate::config::EngineConfig;
use crate::registry::TenantRegistry;
use crate::tenant::{Actor, MutationOutcome, Tenant};

pub type MemoryRegistry = TenantRegistry<MemorySnapshotStore, MemoryColdStore>;

/// Registry backed by in-memory stores, recording audit events in memory.
pub struct TestHost {
    pub registry: MemoryRegistry,
    pub snapshots: MemorySnapshotStore,
    pub cold: MemoryColdStore,
    pub audit: MemoryAuditLog,
}

impl TestHost {
    pub fn new(config: EngineConfig) -> Self {
        setup_logging();
        let snapshots = MemorySnapshotStore::new();
        let cold = MemoryColdStore::new();
        let audit = MemoryAuditLog::new();
        let registry = TenantRegistry::with_audit(
            config,
            snapshots.clone(),
            cold.clone(),
            Arc::new(audit.clone()),
        );

        Self {
            registry,
            snapshots,
            cold,
            audit,
        }
    }
}

impl Default for TestHost {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

/// Create a structural edge on behalf of the system.
pub fn link(
    tenant: &Tenant,
    edge_type: EdgeType,
    source: EntityId,
    target: EntityId,
) -> MutationOutcome {
    tenant
        .create_edge(&Actor::System, edge_type, source, target, None)
        .expect("create edge")
}
