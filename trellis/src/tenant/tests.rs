// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::Arc;

use assert_matches::assert_matches;
use futures::StreamExt;
use trellis_core::test_utils::setup_logging;
use trellis_core::{
    AuditKind, Capability, EdgeType, EntityId, MemoryAuditLog, MutationKind, TenantId,
};
use trellis_sync::{BroadcastEvent, SyncCoordinator};

use super::{Actor, MutationOutcome, Tenant, TenantError};
use crate::config::EngineConfig;

fn tenant() -> (Tenant, MemoryAuditLog) {
    setup_logging();
    let audit = MemoryAuditLog::new();
    let tenant = Tenant::new(
        TenantId::new("acme").unwrap(),
        Arc::new(EngineConfig::default()),
        SyncCoordinator::default(),
        Arc::new(audit.clone()),
    );
    (tenant, audit)
}

#[test]
fn grants_are_idempotent() {
    let (tenant, _) = tenant();
    let alice = EntityId::user("alice");
    let doc = EntityId::resource("doc1");

    let first = tenant
        .grant(&Actor::System, alice.clone(), doc.clone(), Capability::Read)
        .unwrap();
    assert_matches!(first, MutationOutcome::Applied { version: 1, .. });

    let second = tenant
        .grant(&Actor::System, alice.clone(), doc.clone(), Capability::Read)
        .unwrap();
    assert_eq!(
        second,
        MutationOutcome::Unchanged {
            edge_id: first.edge_id()
        }
    );
    assert_eq!(tenant.version(), 1);

    // A different capability is a different relationship.
    let third = tenant
        .grant(&Actor::System, alice, doc, Capability::Update)
        .unwrap();
    assert_matches!(third, MutationOutcome::Applied { version: 2, .. });
}

#[test]
fn revoke_by_relationship() {
    let (tenant, _) = tenant();
    let alice = EntityId::user("alice");
    let doc = EntityId::resource("doc1");

    let granted = tenant
        .grant(&Actor::System, alice.clone(), doc.clone(), Capability::Read)
        .unwrap();
    assert!(tenant.check(&alice, &doc, &Capability::Read).unwrap().allowed);

    let revoked = tenant
        .revoke(&Actor::System, &alice, &doc, &Capability::Read)
        .unwrap();
    assert_eq!(
        revoked,
        MutationOutcome::Applied {
            version: 2,
            edge_id: granted.edge_id()
        }
    );
    assert!(!tenant.check(&alice, &doc, &Capability::Read).unwrap().allowed);

    // Revoking again changes nothing and logs nothing.
    let again = tenant
        .revoke(&Actor::System, &alice, &doc, &Capability::Read)
        .unwrap();
    assert_eq!(
        again,
        MutationOutcome::Unchanged {
            edge_id: granted.edge_id()
        }
    );
    assert_eq!(tenant.version(), 2);

    assert_matches!(
        tenant.revoke(&Actor::System, &alice, &doc, &Capability::Delete),
        Err(TenantError::RelationshipNotFound { .. })
    );
}

#[test]
fn revoke_edge_by_id() {
    let (tenant, _) = tenant();
    let created = tenant
        .create_edge(
            &Actor::System,
            EdgeType::MemberOf,
            EntityId::user("bob"),
            EntityId::group("eng"),
            None,
        )
        .unwrap();
    let id = created.edge_id();

    assert_matches!(
        tenant.revoke_edge(&Actor::System, &id).unwrap(),
        MutationOutcome::Applied { version: 2, .. }
    );
    assert_eq!(
        tenant.revoke_edge(&Actor::System, &id).unwrap(),
        MutationOutcome::Unchanged { edge_id: id }
    );

    let unknown = "00112233445566778899aabbccddeeff".parse().unwrap();
    assert_matches!(
        tenant.revoke_edge(&Actor::System, &unknown),
        Err(TenantError::EdgeNotFound(_))
    );
}

#[test]
fn rejects_malformed_edges() {
    let (tenant, _) = tenant();
    assert_matches!(
        tenant.create_edge(
            &Actor::System,
            EdgeType::MemberOf,
            EntityId::resource("doc1"),
            EntityId::group("eng"),
            None,
        ),
        Err(TenantError::InvalidShape(_))
    );
    assert_matches!(
        tenant.create_edge(
            &Actor::System,
            EdgeType::HasPermission,
            EntityId::user("alice"),
            EntityId::resource("doc1"),
            None,
        ),
        Err(TenantError::InvalidShape(_))
    );
    assert_eq!(tenant.version(), 0);
}

#[test]
fn subjects_need_admin_capability() {
    let (tenant, audit) = tenant();
    let alice = EntityId::user("alice");
    let bob = EntityId::user("bob");
    let doc = EntityId::resource("doc1");

    let result = tenant.grant(
        &Actor::subject(alice.clone()),
        bob.clone(),
        doc.clone(),
        Capability::Read,
    );
    assert_matches!(result, Err(TenantError::Unauthorized { .. }));
    assert_eq!(audit.events_of_kind(AuditKind::Denied).len(), 1);

    tenant
        .grant(&Actor::System, alice.clone(), doc.clone(), Capability::Update)
        .unwrap();
    let result = tenant.grant(
        &Actor::subject(alice.clone()),
        bob.clone(),
        doc.clone(),
        Capability::Read,
    );
    assert_matches!(result, Ok(MutationOutcome::Applied { version: 2, .. }));
    assert_eq!(audit.events_of_kind(AuditKind::Allowed).len(), 1);

    // Holding a capability on a resource does not allow changing group structure.
    assert_matches!(
        tenant.create_edge(
            &Actor::subject(alice),
            EdgeType::MemberOf,
            bob,
            EntityId::group("eng"),
            None,
        ),
        Err(TenantError::Unauthorized { .. })
    );
}

#[test]
fn subjects_can_prove_their_capability() {
    let (tenant, audit) = tenant();
    let alice = EntityId::user("alice");
    let doc = EntityId::resource("doc1");

    let admin = tenant
        .grant(&Actor::System, alice.clone(), doc.clone(), Capability::Update)
        .unwrap();

    let actor = Actor::with_proof(alice.clone(), vec![admin.edge_id().to_hex()]);
    assert_matches!(
        tenant.grant(&actor, EntityId::user("carol"), doc.clone(), Capability::Read),
        Ok(MutationOutcome::Applied { .. })
    );

    let forged = Actor::with_proof(alice, vec!["ff".repeat(16)]);
    assert_matches!(
        tenant.grant(&forged, EntityId::user("dave"), doc, Capability::Read),
        Err(TenantError::Unauthorized { .. })
    );
    assert_eq!(audit.events_of_kind(AuditKind::Attack).len(), 1);
    assert_eq!(tenant.version(), 2);
}

#[tokio::test]
async fn mutations_are_published() {
    let (tenant, _) = tenant();
    let mut stream = tenant.subscribe();

    tenant
        .grant(
            &Actor::System,
            EntityId::group("eng"),
            EntityId::resource("doc1"),
            Capability::Read,
        )
        .unwrap();

    let Some(BroadcastEvent::Mutation(record)) = stream.next().await else {
        panic!("expected mutation broadcast");
    };
    assert_eq!(record.version, 1);
    assert_eq!(record.kind, MutationKind::Grant);
}

#[test]
fn backup_bookkeeping() {
    let (tenant, _) = tenant();
    assert!(!tenant.is_dirty());

    for name in ["alice", "bob", "carol"] {
        tenant
            .grant(
                &Actor::System,
                EntityId::user(name),
                EntityId::resource("doc1"),
                Capability::Read,
            )
            .unwrap();
    }
    assert!(tenant.is_dirty());

    let pending = tenant.pending_backup();
    assert_eq!(pending.version, 3);
    assert_eq!(pending.records.len(), 3);
    assert_eq!(pending.snapshot.version, 3);

    tenant.complete_backup(pending.version);
    assert!(!tenant.is_dirty());
    tenant.verify().unwrap();
    assert!(tenant.pending_backup().records.is_empty());
}

#[test]
fn poisoned_tenants_refuse_everything() {
    let (tenant, _) = tenant();
    let alice = EntityId::user("alice");
    let doc = EntityId::resource("doc1");

    tenant.poison("index mismatch");
    assert!(tenant.is_poisoned());
    assert_matches!(
        tenant.grant(&Actor::System, alice.clone(), doc.clone(), Capability::Read),
        Err(TenantError::Poisoned(..))
    );
    assert_matches!(
        tenant.check(&alice, &doc, &Capability::Read),
        Err(TenantError::Poisoned(..))
    );
}

#[test]
fn evicting_tenants_refuse_mutations() {
    let (tenant, _) = tenant();
    let alice = EntityId::user("alice");
    let doc = EntityId::resource("doc1");
    tenant
        .grant(&Actor::System, alice.clone(), doc.clone(), Capability::Read)
        .unwrap();

    tenant.begin_eviction();
    assert_matches!(
        tenant.grant(&Actor::System, EntityId::user("bob"), doc.clone(), Capability::Read),
        Err(TenantError::Evicted(_))
    );
    assert_matches!(
        tenant.revoke(&Actor::System, &alice, &doc, &Capability::Read),
        Err(TenantError::Evicted(_))
    );
    assert!(!tenant.needs_backup(super::now()));
    assert!(tenant.check(&alice, &doc, &Capability::Read).unwrap().allowed);

    // A failed eviction hands the tenant back.
    tenant.abort_eviction();
    assert_matches!(
        tenant.grant(&Actor::System, EntityId::user("bob"), doc.clone(), Capability::Read),
        Ok(MutationOutcome::Applied { version: 2, .. })
    );

    tenant.begin_eviction();
    tenant.finish_eviction();
    tenant.abort_eviction();
    assert_matches!(
        tenant.check(&alice, &doc, &Capability::Read),
        Err(TenantError::Evicted(_))
    );
    assert_matches!(
        tenant.grant(&Actor::System, EntityId::user("carol"), doc, Capability::Read),
        Err(TenantError::Evicted(_))
    );
    assert_eq!(tenant.version(), 2);
}
