// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core data types and decision functions of the trellis authorization engine.
//!
//! The permission graph consists of users, groups and resources connected by typed edges. An
//! [`EdgeStore`] holds the graph of one tenant, the [`PermissionResolver`] answers direct and
//! transitive permission questions against it and the [`ChainValidator`] verifies paths proposed
//! by untrusted callers. Every change to the graph is described by a [`MutationRecord`].
pub mod audit;
pub mod chain;
pub mod edge;
pub mod edge_store;
pub mod identity;
pub mod mutation;
pub mod resolver;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;

pub use audit::{AuditEvent, AuditKind, AuditSink, MemoryAuditLog, TracingAuditSink};
pub use chain::{ChainValidator, ValidationFailure, ValidationRequest, ValidationResponse};
pub use edge::{Capability, Edge, EdgeShapeError, EdgeType, InvalidCapability};
pub use edge_store::{EdgeStore, EdgeStoreError, RevokeOutcome};
pub use identity::{
    EDGE_ID_LEN, EdgeId, EntityId, EntityKind, IdentityError, TenantId, Timestamp, Version,
};
pub use mutation::{MutationError, MutationKind, MutationPayload, MutationRecord};
pub use resolver::{Decision, PermissionResolver, ResolverConfig};
