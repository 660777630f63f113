// SPDX-License-Identifier: MIT OR Apache-2.0

//! Helpers for building permission graphs in tests.
use crate::edge::{Capability, Edge, EdgeType};
use crate::edge_store::EdgeStore;
use crate::identity::{EntityId, Timestamp};

pub fn setup_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }
}

fn edge(
    store: &EdgeStore,
    edge_type: EdgeType,
    source: EntityId,
    target: EntityId,
    capability: Option<Capability>,
) -> Edge {
    Edge {
        id: store.mint_edge_id(),
        edge_type,
        source_id: source,
        target_id: target,
        capability,
        created_at: Timestamp::new(1),
        revoked_at: None,
    }
}

/// `user:<user>` is a member of `group:<group>`.
pub fn member_edge(store: &EdgeStore, user: &str, group: &str) -> Edge {
    edge(
        store,
        EdgeType::MemberOf,
        EntityId::user(user),
        EntityId::group(group),
        None,
    )
}

/// `group:<child>` inherits from `group:<parent>`.
pub fn inherit_edge(store: &EdgeStore, child: &str, parent: &str) -> Edge {
    edge(
        store,
        EdgeType::InheritsFrom,
        EntityId::group(child),
        EntityId::group(parent),
        None,
    )
}

/// `subject` holds `capability` on `resource:<resource>`.
pub fn grant_edge(
    store: &EdgeStore,
    subject: EntityId,
    resource: &str,
    capability: Capability,
) -> Edge {
    edge(
        store,
        EdgeType::HasPermission,
        subject,
        EntityId::resource(resource),
        Some(capability),
    )
}
