// SPDX-License-Identifier: MIT OR Apache-2.0

//! Authoritative in-memory permission graph.
use std::collections::{HashMap, HashSet};

use thiserror::Error;
use tracing::trace;

use crate::edge::{Capability, Edge, EdgeShapeError, EdgeType};
use crate::identity::{EdgeId, EntityId, Timestamp};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EdgeStoreError {
    #[error("edge {0} already exists")]
    DuplicateEdge(EdgeId),

    #[error("edge {0} not found")]
    NotFound(EdgeId),

    #[error(transparent)]
    InvalidShape(#[from] EdgeShapeError),

    #[error("index out of sync with edge map: {0}")]
    IndexCorruption(String),
}

/// Result of revoking an edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RevokeOutcome {
    /// The edge was active and is now revoked.
    Revoked,

    /// The edge was revoked before, its revocation timestamp is unchanged.
    AlreadyRevoked,
}

/// Edges keyed by id with secondary indexes by source, target, type and endpoint pair.
///
/// Revoked edges stay in the primary map and in every index, consumers filter on
/// `Edge::is_active`. All mutators update the primary map and every index before returning and
/// validate their input before touching any of them.
#[derive(Clone, Debug, Default)]
pub struct EdgeStore {
    edges: HashMap<EdgeId, Edge>,
    by_source: HashMap<EntityId, HashSet<EdgeId>>,
    by_target: HashMap<EntityId, HashSet<EdgeId>>,
    by_type: HashMap<EdgeType, HashSet<EdgeId>>,
    by_endpoints: HashMap<(EntityId, EntityId), HashSet<EdgeId>>,
    entities: HashSet<EntityId>,
}

impl EdgeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a fresh edge id which is not used by any edge in this store.
    pub fn mint_edge_id(&self) -> EdgeId {
        loop {
            let id = EdgeId::random();
            if !self.edges.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn get(&self, id: &EdgeId) -> Option<&Edge> {
        self.edges.get(id)
    }

    pub fn contains(&self, id: &EdgeId) -> bool {
        self.edges.contains_key(id)
    }

    /// Total number of edges, revoked ones included.
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Number of unrevoked edges.
    pub fn active_len(&self) -> usize {
        self.edges.values().filter(|edge| edge.is_active()).count()
    }

    /// Iterate over all edges in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = &Edge> {
        self.edges.values()
    }

    /// All known entities, including ones only referenced by revoked edges.
    pub fn entities(&self) -> impl Iterator<Item = &EntityId> {
        self.entities.iter()
    }

    pub fn has_entity(&self, entity: &EntityId) -> bool {
        self.entities.contains(entity)
    }

    /// Register an entity without creating an edge for it.
    ///
    /// Returns `true` if the entity was not known before.
    pub fn ensure_entity(&mut self, entity: EntityId) -> bool {
        self.entities.insert(entity)
    }

    /// Insert a new edge.
    ///
    /// The edge id must not exist yet and the edge shape must be valid for its type. Endpoint
    /// entities are registered implicitly.
    pub fn insert(&mut self, edge: Edge) -> Result<(), EdgeStoreError> {
        if self.edges.contains_key(&edge.id) {
            return Err(EdgeStoreError::DuplicateEdge(edge.id));
        }
        edge.validate_shape()?;

        trace!(
            id = %edge.id.fmt_short(),
            edge_type = %edge.edge_type,
            source = %edge.source_id,
            target = %edge.target_id,
            "insert edge"
        );

        self.by_source
            .entry(edge.source_id.clone())
            .or_default()
            .insert(edge.id);
        self.by_target
            .entry(edge.target_id.clone())
            .or_default()
            .insert(edge.id);
        self.by_type.entry(edge.edge_type).or_default().insert(edge.id);
        self.by_endpoints
            .entry((edge.source_id.clone(), edge.target_id.clone()))
            .or_default()
            .insert(edge.id);
        self.entities.insert(edge.source_id.clone());
        self.entities.insert(edge.target_id.clone());
        self.edges.insert(edge.id, edge);

        Ok(())
    }

    /// Mark an edge as revoked.
    ///
    /// Revoking an already revoked edge succeeds without changing its revocation timestamp.
    pub fn revoke(&mut self, id: &EdgeId, at: Timestamp) -> Result<RevokeOutcome, EdgeStoreError> {
        let Some(edge) = self.edges.get_mut(id) else {
            return Err(EdgeStoreError::NotFound(*id));
        };

        if edge.is_revoked() {
            return Ok(RevokeOutcome::AlreadyRevoked);
        }

        trace!(id = %id.fmt_short(), "revoke edge");
        edge.revoked_at = Some(at);
        Ok(RevokeOutcome::Revoked)
    }

    /// Edges leaving the given entity, optionally filtered by type. Revoked edges are included.
    pub fn edges_from<'a>(
        &'a self,
        entity: &EntityId,
        edge_type: Option<EdgeType>,
    ) -> impl Iterator<Item = &'a Edge> + use<'a> {
        self.indexed(self.by_source.get(entity), edge_type)
    }

    /// Edges pointing at the given entity, optionally filtered by type. Revoked edges are
    /// included.
    pub fn edges_to<'a>(
        &'a self,
        entity: &EntityId,
        edge_type: Option<EdgeType>,
    ) -> impl Iterator<Item = &'a Edge> + use<'a> {
        self.indexed(self.by_target.get(entity), edge_type)
    }

    /// All edges of one type. Revoked edges are included.
    pub fn edges_of_type(&self, edge_type: EdgeType) -> impl Iterator<Item = &Edge> {
        self.indexed(self.by_type.get(&edge_type), None)
    }

    /// Edges connecting `source` to `target` directly. Revoked edges are included.
    pub fn edges_between<'a>(
        &'a self,
        source: &EntityId,
        target: &EntityId,
    ) -> impl Iterator<Item = &'a Edge> + use<'a> {
        self.indexed(
            self.by_endpoints.get(&(source.clone(), target.clone())),
            None,
        )
    }

    /// Find the unrevoked edge describing the given relationship, if any.
    pub fn find_active(
        &self,
        edge_type: EdgeType,
        source: &EntityId,
        target: &EntityId,
        capability: Option<&Capability>,
    ) -> Option<&Edge> {
        self.edges_between(source, target).find(|edge| {
            edge.is_active() && edge.edge_type == edge_type && edge.capability.as_ref() == capability
        })
    }

    fn indexed<'a>(
        &'a self,
        ids: Option<&'a HashSet<EdgeId>>,
        edge_type: Option<EdgeType>,
    ) -> impl Iterator<Item = &'a Edge> + 'a {
        ids.into_iter()
            .flatten()
            .filter_map(move |id| self.edges.get(id))
            .filter(move |edge| edge_type.is_none_or(|edge_type| edge.edge_type == edge_type))
    }

    /// Check that every index agrees with the primary edge map.
    ///
    /// A failure here means authorization answers can no longer be trusted.
    pub fn verify_indexes(&self) -> Result<(), EdgeStoreError> {
        let mut indexed_total = [0usize; 4];

        for (name, slot, index) in [
            ("source", 0, &self.by_source),
            ("target", 1, &self.by_target),
        ] {
            for (entity, ids) in index {
                for id in ids {
                    let Some(edge) = self.edges.get(id) else {
                        return Err(EdgeStoreError::IndexCorruption(format!(
                            "{name} index references unknown edge {id}"
                        )));
                    };
                    let endpoint = if slot == 0 {
                        &edge.source_id
                    } else {
                        &edge.target_id
                    };
                    if endpoint != entity {
                        return Err(EdgeStoreError::IndexCorruption(format!(
                            "{name} index lists edge {id} under {entity}"
                        )));
                    }
                }
                indexed_total[slot] += ids.len();
            }
        }

        for (edge_type, ids) in &self.by_type {
            for id in ids {
                match self.edges.get(id) {
                    Some(edge) if edge.edge_type == *edge_type => (),
                    _ => {
                        return Err(EdgeStoreError::IndexCorruption(format!(
                            "type index lists edge {id} under {edge_type}"
                        )));
                    }
                }
            }
            indexed_total[2] += ids.len();
        }

        for ((source, target), ids) in &self.by_endpoints {
            for id in ids {
                match self.edges.get(id) {
                    Some(edge) if edge.source_id == *source && edge.target_id == *target => (),
                    _ => {
                        return Err(EdgeStoreError::IndexCorruption(format!(
                            "endpoint index lists edge {id} under ({source}, {target})"
                        )));
                    }
                }
            }
            indexed_total[3] += ids.len();
        }

        // Every edge has to be present exactly once in each index.
        if indexed_total.iter().any(|total| *total != self.edges.len()) {
            return Err(EdgeStoreError::IndexCorruption(format!(
                "indexes cover {indexed_total:?} edges, primary map holds {}",
                self.edges.len()
            )));
        }

        for edge in self.edges.values() {
            if !self.entities.contains(&edge.source_id) || !self.entities.contains(&edge.target_id)
            {
                return Err(EdgeStoreError::IndexCorruption(format!(
                    "edge {} references unregistered entity",
                    edge.id
                )));
            }
        }

        Ok(())
    }
}

/// Two stores are equal when they hold the same entities and the same edges, including
/// revocation state.
impl PartialEq for EdgeStore {
    fn eq(&self, other: &Self) -> bool {
        self.edges == other.edges && self.entities == other.entities
    }
}

impl Eq for EdgeStore {}
