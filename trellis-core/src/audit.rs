// SPDX-License-Identifier: MIT OR Apache-2.0

//! Audit trail of authorization decisions.
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::edge::Capability;
use crate::identity::{EntityId, Timestamp};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Allowed,

    /// Ordinary denial, no permission was found.
    Denied,

    /// A proof relied on a revoked edge.
    Revoked,

    /// A proof referenced unknown edges or did not connect, possibly a forged proof.
    Attack,
}

impl fmt::Display for AuditKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuditKind::Allowed => "allowed",
            AuditKind::Denied => "denied",
            AuditKind::Revoked => "revoked",
            AuditKind::Attack => "attack",
        };

        write!(f, "{}", s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub kind: AuditKind,
    pub subject: EntityId,
    pub resource: EntityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<Capability>,

    /// Edge ids as submitted by the caller, which are not necessarily known edges.
    pub edge_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub timestamp: Timestamp,
}

/// Receiver of audit events.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

impl<T: AuditSink + ?Sized> AuditSink for Arc<T> {
    fn record(&self, event: AuditEvent) {
        self.as_ref().record(event)
    }
}

/// Writes audit events to the `tracing` log. Attacks are logged at `warn` level.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        let edges = event.edge_ids.join(",");
        let reason = event.reason.as_deref().unwrap_or_default();
        match event.kind {
            AuditKind::Attack => warn!(
                target: "trellis::audit",
                kind = %event.kind,
                subject = %event.subject,
                resource = %event.resource,
                edges,
                reason,
                "rejected chain proof"
            ),
            _ => info!(
                target: "trellis::audit",
                kind = %event.kind,
                subject = %event.subject,
                resource = %event.resource,
                edges,
                reason,
                "authorization decision"
            ),
        }
    }
}

/// Keeps all audit events in memory.
#[derive(Clone, Debug, Default)]
pub struct MemoryAuditLog {
    events: Arc<RwLock<Vec<AuditEvent>>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_events(&self) -> RwLockReadGuard<'_, Vec<AuditEvent>> {
        self.events.read().expect("acquire audit log read lock")
    }

    fn write_events(&self) -> RwLockWriteGuard<'_, Vec<AuditEvent>> {
        self.events.write().expect("acquire audit log write lock")
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.read_events().clone()
    }

    pub fn events_of_kind(&self, kind: AuditKind) -> Vec<AuditEvent> {
        self.read_events()
            .iter()
            .filter(|event| event.kind == kind)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read_events().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_events().is_empty()
    }
}

impl AuditSink for MemoryAuditLog {
    fn record(&self, event: AuditEvent) {
        self.write_events().push(event);
    }
}
