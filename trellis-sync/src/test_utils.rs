// SPDX-License-Identifier: MIT OR Apache-2.0

use trellis_core::test_utils::{grant_edge, member_edge};
use trellis_core::{
    Capability, EdgeId, EdgeStore, EntityId, MutationKind, MutationPayload, MutationRecord,
    Timestamp, Version,
};
use trellis_store::MutationLog;

/// Edge store and mutation log of a single tenant, mutated in lockstep.
pub struct Authority {
    pub store: EdgeStore,
    pub log: MutationLog,
}

impl Authority {
    pub fn with_retention(retention: usize) -> Self {
        Self {
            store: EdgeStore::new(),
            log: MutationLog::with_retention(retention),
        }
    }

    fn apply(&mut self, kind: MutationKind, payload: MutationPayload) -> MutationRecord {
        let version = self.log.next_version();
        let record =
            MutationRecord::new(version, Timestamp::new(version), kind, payload).unwrap();
        record.apply(&mut self.store).unwrap();
        self.log.push(record.clone()).unwrap();
        record
    }

    pub fn grant(&mut self, subject: EntityId, resource: &str) -> MutationRecord {
        let edge = grant_edge(&self.store, subject, resource, Capability::Read);
        self.apply(MutationKind::Grant, MutationPayload::from(&edge))
    }

    pub fn add_member(&mut self, user: &str, group: &str) -> MutationRecord {
        let edge = member_edge(&self.store, user, group);
        self.apply(MutationKind::CreateEdge, MutationPayload::from(&edge))
    }

    pub fn revoke(&mut self, id: EdgeId) -> MutationRecord {
        let edge = self.store.get(&id).unwrap().clone();
        let kind = if edge.capability.is_some() {
            MutationKind::Revoke
        } else {
            MutationKind::RevokeEdge
        };
        self.apply(kind, MutationPayload::from(&edge))
    }

    pub fn grant_many(&mut self, count: usize) {
        for i in 0..count {
            self.grant(EntityId::user(&format!("user{i}")), "doc");
        }
    }

    pub fn version(&self) -> Version {
        self.log.current_version()
    }
}
