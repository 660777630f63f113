// SPDX-License-Identifier: MIT OR Apache-2.0

use assert_matches::assert_matches;
use futures::{SinkExt, StreamExt};
use tokio_util::codec::{FramedRead, FramedWrite};
use trellis_core::{
    AuditKind, Capability, EdgeType, EntityId, TenantId, ValidationFailure, ValidationRequest,
};
use trellis_sync::{CatchUp, JsonLinesCodec, Replica, SyncMessage, SyncPlan, SyncSource};

use crate::config::EngineConfig;
use crate::tenant::{Actor, MutationOutcome};
use crate::test_utils::{TestHost, link};

fn acme() -> TenantId {
    TenantId::new("acme").unwrap()
}

#[tokio::test]
async fn direct_grant_and_revoke() {
    let host = TestHost::default();
    let tenant = host.registry.load(&acme()).await.unwrap();
    let alice = EntityId::user("alice");
    let doc = EntityId::resource("doc1");

    tenant
        .grant(&Actor::System, alice.clone(), doc.clone(), Capability::Read)
        .unwrap();
    let decision = tenant.check_direct(&alice, &doc, &Capability::Read).unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.path.len(), 1);

    tenant
        .revoke(&Actor::System, &alice, &doc, &Capability::Read)
        .unwrap();
    assert!(!tenant.check_direct(&alice, &doc, &Capability::Read).unwrap().allowed);
    assert!(!tenant.check(&alice, &doc, &Capability::Read).unwrap().allowed);
}

#[tokio::test]
async fn inherited_permission_ends_with_revoked_inheritance() {
    let host = TestHost::default();
    let tenant = host.registry.load(&acme()).await.unwrap();
    let bob = EntityId::user("bob");
    let eng = EntityId::group("eng");
    let staff = EntityId::group("staff");
    let doc = EntityId::resource("doc2");

    link(&tenant, EdgeType::MemberOf, bob.clone(), eng.clone());
    let inherits = link(&tenant, EdgeType::InheritsFrom, eng.clone(), staff.clone());
    tenant
        .grant(&Actor::System, staff.clone(), doc.clone(), Capability::Read)
        .unwrap();

    let decision = tenant.check(&bob, &doc, &Capability::Read).unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.path.len(), 3);
    assert_eq!(decision.path[1], inherits.edge_id());
    assert_eq!(
        tenant.groups_of(&bob).unwrap().into_iter().collect::<Vec<_>>(),
        vec![eng.clone(), staff.clone()]
    );
    assert!(
        tenant
            .accessible_resources(&bob, &Capability::Read)
            .unwrap()
            .contains(&doc)
    );

    tenant
        .revoke_edge(&Actor::System, &inherits.edge_id())
        .unwrap();
    assert!(!tenant.check(&bob, &doc, &Capability::Read).unwrap().allowed);
    assert!(tenant.capabilities(&bob, &doc).unwrap().is_empty());
    assert!(!tenant.subjects_with_access(&doc, &Capability::Read).unwrap().contains(&bob));
}

#[tokio::test]
async fn permission_checks_are_audited() {
    let host = TestHost::default();
    let tenant = host.registry.load(&acme()).await.unwrap();
    let bob = EntityId::user("bob");
    let eng = EntityId::group("eng");
    let staff = EntityId::group("staff");
    let doc = EntityId::resource("doc2");

    link(&tenant, EdgeType::MemberOf, bob.clone(), eng.clone());
    link(&tenant, EdgeType::InheritsFrom, eng, staff.clone());
    tenant
        .grant(&Actor::System, staff, doc.clone(), Capability::Read)
        .unwrap();

    let decision = tenant.check(&bob, &doc, &Capability::Read).unwrap();
    let allowed = host.audit.events_of_kind(AuditKind::Allowed);
    assert_eq!(allowed.len(), 1);
    assert_eq!(allowed[0].subject, bob);
    assert_eq!(allowed[0].resource, doc);
    assert_eq!(allowed[0].capability, Some(Capability::Read));
    assert_eq!(allowed[0].edge_ids.len(), 3);
    assert_eq!(
        allowed[0].edge_ids,
        decision.path.iter().map(|id| id.to_hex()).collect::<Vec<_>>()
    );

    // Inherited permissions are not held directly.
    assert!(!tenant.check_direct(&bob, &doc, &Capability::Read).unwrap().allowed);
    let denied = host.audit.events_of_kind(AuditKind::Denied);
    assert_eq!(denied.len(), 1);
    assert!(denied[0].edge_ids.is_empty());
}

#[tokio::test]
async fn disconnected_proof_is_recorded_as_attack() {
    let host = TestHost::default();
    let tenant = host.registry.load(&acme()).await.unwrap();
    let alice = EntityId::user("alice");
    let doc = EntityId::resource("doc3");

    let e1 = link(
        &tenant,
        EdgeType::MemberOf,
        alice.clone(),
        EntityId::group("eng"),
    );
    let e2 = tenant
        .grant(
            &Actor::System,
            EntityId::group("sales"),
            doc.clone(),
            Capability::Read,
        )
        .unwrap();

    let request = ValidationRequest {
        subject_id: alice,
        resource_id: doc,
        edge_ids: vec![e1.edge_id().to_hex(), e2.edge_id().to_hex()],
        capability: None,
    };
    let response = tenant.validate(&request).unwrap();
    assert!(!response.valid);
    assert_eq!(response.reason, Some(ValidationFailure::BrokenChain));
    assert_eq!(response.broken_at, Some(0));

    let attacks = host.audit.events_of_kind(AuditKind::Attack);
    assert_eq!(attacks.len(), 1);
    assert_eq!(attacks[0].edge_ids, request.edge_ids);

    let json = serde_json::to_value(&response).unwrap();
    assert_eq!(
        json,
        serde_json::json!({ "valid": false, "reason": "BrokenChain", "brokenAt": 0 })
    );
}

#[tokio::test]
async fn stale_readers_catch_up_or_reload() {
    let config = EngineConfig::default().retention(100);
    let host = TestHost::new(config);
    let tenant = host.registry.load(&acme()).await.unwrap();

    let grant = |i: usize| {
        tenant
            .grant(
                &Actor::System,
                EntityId::user(&format!("user{i}")),
                EntityId::resource("doc"),
                Capability::Read,
            )
            .unwrap()
    };

    for i in 0..115 {
        grant(i);
    }
    let SyncPlan::Incremental(records) = tenant.plan_sync(10) else {
        panic!("expected incremental catch-up");
    };
    assert_eq!(records.len(), 105);
    assert_eq!(records.first().map(|record| record.version), Some(11));

    for i in 115..10_115 {
        grant(i);
    }
    assert_eq!(tenant.version(), 10_115);
    assert_eq!(tenant.plan_sync(10), SyncPlan::FullSyncRequired);
}

#[tokio::test]
async fn pruned_log_forces_snapshot() {
    let host = TestHost::new(EngineConfig::default().retention(10));
    let tenant = host.registry.load(&acme()).await.unwrap();

    for i in 0..30 {
        tenant
            .grant(
                &Actor::System,
                EntityId::user(&format!("user{i}")),
                EntityId::resource("doc"),
                Capability::Read,
            )
            .unwrap();
    }
    crate::backup_tenant(&tenant, &host.snapshots, &host.cold)
        .await
        .unwrap();

    let mut replica = Replica::new();
    assert_eq!(
        replica.apply_plan(&tenant.plan_sync(replica.version())).unwrap(),
        CatchUp::SnapshotRequired
    );

    replica.load_snapshot(&tenant.snapshot()).unwrap();
    assert_eq!(replica.version(), 30);
    assert_eq!(tenant.plan_sync(replica.version()), SyncPlan::UpToDate);
    assert_eq!(
        replica.apply_plan(&tenant.plan_sync(25)).unwrap_err().to_string(),
        "expected mutation with version 31, got 26"
    );
}

#[tokio::test]
async fn reader_follows_tenant_over_transport() {
    let host = TestHost::default();
    let tenant = host.registry.load(&acme()).await.unwrap();
    let alice = EntityId::user("alice");
    let doc = EntityId::resource("doc1");

    tenant
        .grant(&Actor::System, alice.clone(), doc.clone(), Capability::Update)
        .unwrap();

    let (server_io, client_io) = tokio::io::duplex(64 * 1024);
    let (server_read, server_write) = tokio::io::split(server_io);
    let (client_read, client_write) = tokio::io::split(client_io);

    let session = tenant.sync_session();
    let server = tokio::spawn(async move {
        let mut sink = FramedWrite::new(server_write, JsonLinesCodec::<SyncMessage>::new());
        let mut stream = FramedRead::new(server_read, JsonLinesCodec::<SyncMessage>::new());
        session.run(&mut sink, &mut stream).await
    });

    let mut client_sink = FramedWrite::new(client_write, JsonLinesCodec::<SyncMessage>::new());
    let mut client_stream = FramedRead::new(client_read, JsonLinesCodec::<SyncMessage>::new());

    let mut replica = Replica::new();
    client_sink.send(replica.version_message()).await.unwrap();
    let message = client_stream.next().await.unwrap().unwrap();
    assert_eq!(replica.handle_message(&message).unwrap(), CatchUp::Applied(1));

    // Alice delegates read access herself, the reader receives it as broadcast.
    let outcome = tenant
        .grant(
            &Actor::subject(alice),
            EntityId::user("bob"),
            doc.clone(),
            Capability::Read,
        )
        .unwrap();
    assert_matches!(outcome, MutationOutcome::Applied { version: 2, .. });

    let message = client_stream.next().await.unwrap().unwrap();
    assert_matches!(message, SyncMessage::Mutation { version: 2, .. });
    replica.handle_message(&message).unwrap();
    assert_eq!(replica.version(), tenant.version());
    assert_eq!(replica.store(), &tenant.snapshot().to_store().unwrap());

    client_sink.close().await.unwrap();
    let metrics = server.await.unwrap().unwrap();
    assert_eq!(metrics.mutations_forwarded, 1);
}

#[tokio::test]
async fn state_survives_eviction() {
    let host = TestHost::default();
    let tenant = host.registry.load(&acme()).await.unwrap();
    let bob = EntityId::user("bob");
    let eng = EntityId::group("eng");
    let doc = EntityId::resource("doc1");

    link(&tenant, EdgeType::MemberOf, bob.clone(), eng.clone());
    let grant = tenant
        .grant(&Actor::System, eng.clone(), doc.clone(), Capability::Delete)
        .unwrap();
    tenant
        .revoke_edge(&Actor::System, &grant.edge_id())
        .unwrap();
    tenant
        .grant(&Actor::System, eng, doc.clone(), Capability::Read)
        .unwrap();
    let before = tenant.snapshot();

    host.registry.evict(&acme()).await.unwrap();
    let reloaded = host.registry.load(&acme()).await.unwrap();

    assert_eq!(reloaded.version(), 4);
    assert_eq!(
        reloaded.snapshot().to_store().unwrap(),
        before.to_store().unwrap()
    );
    assert!(reloaded.check(&bob, &doc, &Capability::Read).unwrap().allowed);
    assert!(!reloaded.check(&bob, &doc, &Capability::Delete).unwrap().allowed);

    // Revoked edges stay revoked after a reload.
    let revoked = reloaded
        .validate(&ValidationRequest {
            subject_id: EntityId::group("eng"),
            resource_id: doc,
            edge_ids: vec![grant.edge_id().to_hex()],
            capability: None,
        })
        .unwrap();
    assert_eq!(revoked.reason, Some(ValidationFailure::EdgeRevoked));
}
