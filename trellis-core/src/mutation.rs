// SPDX-License-Identifier: MIT OR Apache-2.0

//! Immutable records of authorized changes to the permission graph.
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::edge::{Capability, Edge, EdgeType};
use crate::edge_store::{EdgeStore, EdgeStoreError};
use crate::identity::{EdgeId, EntityId, Timestamp, Version};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MutationError {
    #[error("{kind} mutation requires a HAS_PERMISSION edge, got {edge_type}")]
    NotAPermission {
        kind: MutationKind,
        edge_type: EdgeType,
    },

    #[error("revocation of edge {0} does not match the stored edge")]
    PayloadMismatch(EdgeId),

    #[error(transparent)]
    Store(#[from] EdgeStoreError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    /// A capability was granted to a user or group.
    Grant,

    /// A granted capability was withdrawn.
    Revoke,

    /// A structural or permission edge was created.
    CreateEdge,

    /// An edge was revoked by its id.
    RevokeEdge,
}

impl MutationKind {
    pub fn is_revocation(&self) -> bool {
        matches!(self, MutationKind::Revoke | MutationKind::RevokeEdge)
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MutationKind::Grant => "grant",
            MutationKind::Revoke => "revoke",
            MutationKind::CreateEdge => "create_edge",
            MutationKind::RevokeEdge => "revoke_edge",
        };

        write!(f, "{}", s)
    }
}

/// The edge a mutation creates or revokes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationPayload {
    pub edge_id: EdgeId,
    pub edge_type: EdgeType,
    pub source_id: EntityId,
    pub target_id: EntityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<Capability>,
}

impl From<&Edge> for MutationPayload {
    fn from(edge: &Edge) -> Self {
        Self {
            edge_id: edge.id,
            edge_type: edge.edge_type,
            source_id: edge.source_id.clone(),
            target_id: edge.target_id.clone(),
            capability: edge.capability.clone(),
        }
    }
}

impl MutationPayload {
    fn matches(&self, edge: &Edge) -> bool {
        self.edge_type == edge.edge_type
            && self.source_id == edge.source_id
            && self.target_id == edge.target_id
            && self.capability == edge.capability
    }
}

/// One entry of the mutation log.
///
/// Records are validated when they are constructed or deserialized: `grant` and `revoke` always
/// describe a `HAS_PERMISSION` edge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawMutationRecord")]
pub struct MutationRecord {
    pub version: Version,
    pub timestamp: Timestamp,
    pub kind: MutationKind,
    pub payload: MutationPayload,
}

#[derive(Deserialize)]
struct RawMutationRecord {
    version: Version,
    timestamp: Timestamp,
    kind: MutationKind,
    payload: MutationPayload,
}

impl TryFrom<RawMutationRecord> for MutationRecord {
    type Error = MutationError;

    fn try_from(raw: RawMutationRecord) -> Result<Self, Self::Error> {
        MutationRecord::new(raw.version, raw.timestamp, raw.kind, raw.payload)
    }
}

impl MutationRecord {
    pub fn new(
        version: Version,
        timestamp: Timestamp,
        kind: MutationKind,
        payload: MutationPayload,
    ) -> Result<Self, MutationError> {
        if matches!(kind, MutationKind::Grant | MutationKind::Revoke)
            && payload.edge_type != EdgeType::HasPermission
        {
            return Err(MutationError::NotAPermission {
                kind,
                edge_type: payload.edge_type,
            });
        }

        Ok(Self {
            version,
            timestamp,
            kind,
            payload,
        })
    }

    /// The edge this record creates. For revocations the edge as it was before.
    pub fn edge(&self) -> Edge {
        Edge {
            id: self.payload.edge_id,
            edge_type: self.payload.edge_type,
            source_id: self.payload.source_id.clone(),
            target_id: self.payload.target_id.clone(),
            capability: self.payload.capability.clone(),
            created_at: self.timestamp,
            revoked_at: None,
        }
    }

    /// Apply this record to an edge store.
    ///
    /// Creations insert the edge with the record timestamp as creation time, revocations revoke
    /// the referenced edge at the record timestamp. On error the store is left unchanged.
    pub fn apply(&self, store: &mut EdgeStore) -> Result<(), MutationError> {
        match self.kind {
            MutationKind::Grant | MutationKind::CreateEdge => {
                store.insert(self.edge())?;
            }
            MutationKind::Revoke | MutationKind::RevokeEdge => {
                let id = self.payload.edge_id;
                let edge = store.get(&id).ok_or(EdgeStoreError::NotFound(id))?;
                if !self.payload.matches(edge) {
                    return Err(MutationError::PayloadMismatch(id));
                }
                store.revoke(&id, self.timestamp)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::{MutationError, MutationKind, MutationPayload, MutationRecord};
    use crate::edge::{Capability, EdgeType};
    use crate::edge_store::EdgeStore;
    use crate::identity::{EntityId, Timestamp};
    use crate::test_utils::{grant_edge, member_edge};

    #[test]
    fn apply_grant_and_revoke() {
        let mut store = EdgeStore::new();
        let edge = grant_edge(&store, EntityId::user("alice"), "doc1", Capability::Read);
        let payload = MutationPayload::from(&edge);

        let grant =
            MutationRecord::new(1, Timestamp::new(10), MutationKind::Grant, payload.clone())
                .unwrap();
        grant.apply(&mut store).unwrap();
        assert_eq!(store.get(&edge.id).unwrap().created_at, Timestamp::new(10));

        let revoke =
            MutationRecord::new(2, Timestamp::new(20), MutationKind::Revoke, payload).unwrap();
        revoke.apply(&mut store).unwrap();
        assert_eq!(
            store.get(&edge.id).unwrap().revoked_at,
            Some(Timestamp::new(20))
        );

        // Replaying a revocation is harmless.
        revoke.apply(&mut store).unwrap();
        assert_eq!(
            store.get(&edge.id).unwrap().revoked_at,
            Some(Timestamp::new(20))
        );
    }

    #[test]
    fn grant_requires_permission_edge() {
        let store = EdgeStore::new();
        let edge = member_edge(&store, "bob", "eng");
        assert_matches!(
            MutationRecord::new(
                1,
                Timestamp::new(1),
                MutationKind::Grant,
                MutationPayload::from(&edge)
            ),
            Err(MutationError::NotAPermission {
                edge_type: EdgeType::MemberOf,
                ..
            })
        );

        let json = format!(
            r#"{{"version":1,"timestamp":5,"kind":"grant","payload":{{"edgeId":"{}","edgeType":"MEMBER_OF","sourceId":"user:bob","targetId":"group:eng"}}}}"#,
            edge.id
        );
        assert!(serde_json::from_str::<MutationRecord>(&json).is_err());

        let json = json.replace("\"grant\"", "\"create_edge\"");
        let record: MutationRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(record.kind, MutationKind::CreateEdge);
        assert_eq!(record.payload.edge_id, edge.id);

        let json = json.replace("\"create_edge\"", "\"delete_everything\"");
        assert!(serde_json::from_str::<MutationRecord>(&json).is_err());
    }

    #[test]
    fn revocation_must_match_stored_edge() {
        let mut store = EdgeStore::new();
        let edge = grant_edge(&store, EntityId::user("alice"), "doc1", Capability::Read);
        store.insert(edge.clone()).unwrap();

        let mut payload = MutationPayload::from(&edge);
        payload.capability = Some(Capability::Delete);
        let record =
            MutationRecord::new(2, Timestamp::new(3), MutationKind::Revoke, payload).unwrap();
        assert_eq!(
            record.apply(&mut store),
            Err(MutationError::PayloadMismatch(edge.id))
        );
        assert!(store.get(&edge.id).unwrap().is_active());
    }
}
