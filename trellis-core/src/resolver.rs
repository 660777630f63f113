// SPDX-License-Identifier: MIT OR Apache-2.0

//! Direct and transitive permission checks.
//!
//! The resolver is read-only and total: unknown entities, missing edges and cyclic group
//! hierarchies all yield a "denied" answer or an empty set, never an error.
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::edge::{Capability, Edge, EdgeType};
use crate::edge_store::EdgeStore;
use crate::identity::{EdgeId, EntityId};

/// Configuration of group traversal.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Maximum number of membership and inheritance hops followed from the subject. `None`
    /// means unbounded.
    pub max_depth: Option<usize>,
}

impl ResolverConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }
}

/// Outcome of a permission check.
///
/// When access is allowed `path` holds the edges of the first matching chain, from the subject
/// to the resource.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub path: Vec<EdgeId>,
}

impl Decision {
    pub fn denied() -> Self {
        Self::default()
    }

    pub fn allowed(path: Vec<EdgeId>) -> Self {
        Self {
            allowed: true,
            path,
        }
    }
}

/// Answers permission questions against an `EdgeStore`.
#[derive(Clone, Debug)]
pub struct PermissionResolver<'a> {
    store: &'a EdgeStore,
    config: ResolverConfig,
}

impl<'a> PermissionResolver<'a> {
    pub fn new(store: &'a EdgeStore) -> Self {
        Self::with_config(store, ResolverConfig::default())
    }

    pub fn with_config(store: &'a EdgeStore, config: ResolverConfig) -> Self {
        Self { store, config }
    }

    /// Look for an unrevoked `HAS_PERMISSION` edge from `subject` to `resource` with the
    /// requested capability.
    pub fn check_direct(
        &self,
        subject: &EntityId,
        resource: &EntityId,
        capability: &Capability,
    ) -> Decision {
        match self.direct_edge(subject, resource, capability) {
            Some(edge) => Decision::allowed(vec![edge.id]),
            None => Decision::denied(),
        }
    }

    /// Check for a direct permission and otherwise for one inherited through group membership
    /// and group inheritance.
    ///
    /// Groups are visited breadth-first and the search stops at the first match, the returned
    /// path is therefore a shortest one.
    pub fn check(
        &self,
        subject: &EntityId,
        resource: &EntityId,
        capability: &Capability,
    ) -> Decision {
        if let Some(edge) = self.direct_edge(subject, resource, capability) {
            return Decision::allowed(vec![edge.id]);
        }

        let mut found = None;
        let parents = self.walk_closure(subject, |group| {
            found = self.direct_edge(group, resource, capability).map(|edge| edge.id);
            found.is_some()
        });

        match found {
            Some(permission_edge) => {
                let mut path = trace_back(&parents, subject, permission_edge, self.store);
                path.push(permission_edge);
                trace!(%subject, %resource, %capability, hops = path.len(), "permission inherited");
                Decision::allowed(path)
            }
            None => Decision::denied(),
        }
    }

    /// All groups the subject belongs to, directly or through inheritance.
    pub fn groups_of(&self, subject: &EntityId) -> BTreeSet<EntityId> {
        let parents = self.walk_closure(subject, |_| false);
        parents.into_keys().collect()
    }

    /// Every capability the subject holds on the resource, directly or through groups.
    pub fn capabilities(&self, subject: &EntityId, resource: &EntityId) -> BTreeSet<Capability> {
        let mut holders = vec![subject.clone()];
        holders.extend(self.groups_of(subject));

        holders
            .iter()
            .flat_map(|holder| self.store.edges_between(holder, resource))
            .filter(|edge| edge.is_active() && edge.edge_type == EdgeType::HasPermission)
            .filter_map(|edge| edge.capability.clone())
            .collect()
    }

    /// Resources on which the subject holds the capability, directly or through groups.
    pub fn accessible_resources(
        &self,
        subject: &EntityId,
        capability: &Capability,
    ) -> BTreeSet<EntityId> {
        let mut holders = vec![subject.clone()];
        holders.extend(self.groups_of(subject));

        holders
            .iter()
            .flat_map(|holder| {
                self.store
                    .edges_from(holder, Some(EdgeType::HasPermission))
            })
            .filter(|edge| edge.grants(capability))
            .map(|edge| edge.target_id.clone())
            .collect()
    }

    /// Users and groups holding the capability on the resource, directly or through groups.
    pub fn subjects_with_access(
        &self,
        resource: &EntityId,
        capability: &Capability,
    ) -> BTreeSet<EntityId> {
        let mut subjects = BTreeSet::new();
        let mut queue: VecDeque<(EntityId, usize)> = VecDeque::new();

        for edge in self
            .store
            .edges_to(resource, Some(EdgeType::HasPermission))
            .filter(|edge| edge.grants(capability))
        {
            if subjects.insert(edge.source_id.clone()) && edge.source_id.is_group() {
                queue.push_back((edge.source_id.clone(), 0));
            }
        }

        // Walk the hierarchy downwards: child groups inheriting from a holder and users who are
        // members of it.
        while let Some((group, depth)) = queue.pop_front() {
            if self.depth_exhausted(depth) {
                continue;
            }

            for edge in self
                .store
                .edges_to(&group, None)
                .filter(|edge| edge.is_active() && edge.edge_type.is_structural())
            {
                if subjects.insert(edge.source_id.clone()) && edge.source_id.is_group() {
                    queue.push_back((edge.source_id.clone(), depth + 1));
                }
            }
        }

        subjects
    }

    fn direct_edge(
        &self,
        subject: &EntityId,
        resource: &EntityId,
        capability: &Capability,
    ) -> Option<&'a Edge> {
        self.store
            .edges_between(subject, resource)
            .find(|edge| edge.grants(capability))
    }

    fn depth_exhausted(&self, depth: usize) -> bool {
        self.config.max_depth.is_some_and(|max| depth >= max)
    }

    /// Breadth-first walk over active `MEMBER_OF` and `INHERITS_FROM` edges starting at the
    /// subject.
    ///
    /// For every reached group the edge it was first reached through is recorded. `visit` is
    /// called once per group, returning `true` stops the walk.
    fn walk_closure(
        &self,
        subject: &EntityId,
        mut visit: impl FnMut(&EntityId) -> bool,
    ) -> HashMap<EntityId, EdgeId> {
        let mut parents: HashMap<EntityId, EdgeId> = HashMap::new();
        let mut visited: HashSet<EntityId> = HashSet::from([subject.clone()]);
        let mut queue: VecDeque<(EntityId, usize)> = VecDeque::from([(subject.clone(), 0)]);

        while let Some((node, depth)) = queue.pop_front() {
            if self.depth_exhausted(depth) {
                continue;
            }

            for edge in self
                .store
                .edges_from(&node, None)
                .filter(|edge| edge.is_active() && edge.edge_type.is_structural())
            {
                let group = &edge.target_id;
                if !visited.insert(group.clone()) {
                    continue;
                }
                parents.insert(group.clone(), edge.id);

                if visit(group) {
                    return parents;
                }
                queue.push_back((group.clone(), depth + 1));
            }
        }

        parents
    }
}

/// Reconstruct the membership chain from the subject to the source of `permission_edge`.
fn trace_back(
    parents: &HashMap<EntityId, EdgeId>,
    subject: &EntityId,
    permission_edge: EdgeId,
    store: &EdgeStore,
) -> Vec<EdgeId> {
    let mut path = Vec::new();
    let Some(mut current) = store.get(&permission_edge).map(|edge| edge.source_id.clone()) else {
        return path;
    };

    while &current != subject {
        let Some(edge) = parents.get(&current).and_then(|id| store.get(id)) else {
            break;
        };
        path.push(edge.id);
        current = edge.source_id.clone();
    }

    path.reverse();
    path
}
