// SPDX-License-Identifier: MIT OR Apache-2.0

//! Verification of caller-proposed permission paths.
//!
//! A caller may discover a path from a subject to a resource by whatever means and submit the
//! edge ids of it as a proof. Verifying such a proof is linear in its length, an authoritative
//! search is not needed.
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::audit::{AuditEvent, AuditKind, AuditSink};
use crate::edge::{Capability, Edge, EdgeType};
use crate::edge_store::EdgeStore;
use crate::identity::{EdgeId, EntityId, Timestamp};

/// Reason a chain proof was rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValidationFailure {
    NoEdgesProvided,
    EdgeNotFound,
    EdgeRevoked,
    ChainDoesNotStartAtSubject,
    BrokenChain,
    ChainDoesNotEndAtResource,
    CapabilityMismatch,
}

impl ValidationFailure {
    /// Audit classification of this failure.
    pub fn audit_kind(&self) -> AuditKind {
        match self {
            ValidationFailure::EdgeNotFound
            | ValidationFailure::BrokenChain
            | ValidationFailure::ChainDoesNotStartAtSubject
            | ValidationFailure::ChainDoesNotEndAtResource => AuditKind::Attack,
            ValidationFailure::EdgeRevoked => AuditKind::Revoked,
            ValidationFailure::NoEdgesProvided | ValidationFailure::CapabilityMismatch => {
                AuditKind::Denied
            }
        }
    }
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationRequest {
    pub subject_id: EntityId,
    pub resource_id: EntityId,
    pub edge_ids: Vec<String>,

    /// When set the final edge of the chain has to grant this capability.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<Capability>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResponse {
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<ValidationFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_edge_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broken_at: Option<usize>,
}

impl ValidationResponse {
    pub fn valid() -> Self {
        Self {
            valid: true,
            ..Default::default()
        }
    }

    fn invalid(reason: ValidationFailure) -> Self {
        Self {
            valid: false,
            reason: Some(reason),
            ..Default::default()
        }
    }

    fn invalid_edge(reason: ValidationFailure, edge_id: &str) -> Self {
        Self {
            invalid_edge_id: Some(edge_id.to_string()),
            ..Self::invalid(reason)
        }
    }

    fn broken_at(index: usize) -> Self {
        Self {
            broken_at: Some(index),
            ..Self::invalid(ValidationFailure::BrokenChain)
        }
    }
}

/// Validates chain proofs against an `EdgeStore` and reports every outcome to an audit sink.
pub struct ChainValidator<'a> {
    store: &'a EdgeStore,
    audit: &'a dyn AuditSink,
}

impl<'a> ChainValidator<'a> {
    pub fn new(store: &'a EdgeStore, audit: &'a dyn AuditSink) -> Self {
        Self { store, audit }
    }

    /// Check that the edges form a connected, unrevoked path from `subject` to `resource`.
    pub fn validate(
        &self,
        edge_ids: &[String],
        subject: &EntityId,
        resource: &EntityId,
    ) -> ValidationResponse {
        self.validate_and_audit(edge_ids, subject, resource, None)
    }

    /// Like `validate`, additionally requiring the final edge to grant `capability`.
    pub fn validate_for(
        &self,
        edge_ids: &[String],
        subject: &EntityId,
        resource: &EntityId,
        capability: &Capability,
    ) -> ValidationResponse {
        self.validate_and_audit(edge_ids, subject, resource, Some(capability))
    }

    pub fn handle(&self, request: &ValidationRequest) -> ValidationResponse {
        self.validate_and_audit(
            &request.edge_ids,
            &request.subject_id,
            &request.resource_id,
            request.capability.as_ref(),
        )
    }

    fn validate_and_audit(
        &self,
        edge_ids: &[String],
        subject: &EntityId,
        resource: &EntityId,
        capability: Option<&Capability>,
    ) -> ValidationResponse {
        let response = match self.verify(edge_ids, subject, resource, capability) {
            Ok(()) => ValidationResponse::valid(),
            Err(response) => response,
        };

        let kind = response
            .reason
            .map(|reason| reason.audit_kind())
            .unwrap_or(AuditKind::Allowed);
        trace!(%subject, %resource, %kind, edges = edge_ids.len(), "validated chain proof");

        self.audit.record(AuditEvent {
            kind,
            subject: subject.clone(),
            resource: resource.clone(),
            capability: capability.cloned(),
            edge_ids: edge_ids.to_vec(),
            reason: response.reason.map(|reason| reason.to_string()),
            timestamp: Timestamp::now(),
        });

        response
    }

    fn verify(
        &self,
        edge_ids: &[String],
        subject: &EntityId,
        resource: &EntityId,
        capability: Option<&Capability>,
    ) -> Result<(), ValidationResponse> {
        if edge_ids.is_empty() {
            return Err(ValidationResponse::invalid(
                ValidationFailure::NoEdgesProvided,
            ));
        }

        let mut edges: Vec<&Edge> = Vec::with_capacity(edge_ids.len());
        for raw in edge_ids {
            // Ids which do not even parse can not be in the store either.
            let edge = raw
                .parse::<EdgeId>()
                .ok()
                .and_then(|id| self.store.get(&id))
                .ok_or_else(|| {
                    ValidationResponse::invalid_edge(ValidationFailure::EdgeNotFound, raw)
                })?;
            if edge.is_revoked() {
                return Err(ValidationResponse::invalid_edge(
                    ValidationFailure::EdgeRevoked,
                    raw,
                ));
            }
            edges.push(edge);
        }

        if &edges[0].source_id != subject {
            return Err(ValidationResponse::invalid(
                ValidationFailure::ChainDoesNotStartAtSubject,
            ));
        }

        if let Some(index) = edges
            .windows(2)
            .position(|pair| pair[0].target_id != pair[1].source_id)
        {
            return Err(ValidationResponse::broken_at(index));
        }

        let last = edges[edges.len() - 1];
        if &last.target_id != resource {
            return Err(ValidationResponse::invalid(
                ValidationFailure::ChainDoesNotEndAtResource,
            ));
        }

        if let Some(capability) = capability {
            if last.edge_type != EdgeType::HasPermission || !last.grants(capability) {
                return Err(ValidationResponse::invalid(
                    ValidationFailure::CapabilityMismatch,
                ));
            }
        }

        Ok(())
    }
}
