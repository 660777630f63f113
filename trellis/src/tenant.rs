// SPDX-License-Identifier: MIT OR Apache-2.0

//! Authoritative state of a single tenant.
//!
//! A [`Tenant`] is the only writer of its edge store and mutation log. Every mutation is
//! authorized, applied, appended to the log and published to sync subscribers while holding one
//! write lock, so readers never observe a store which is ahead of or behind the log. Permission
//! checks and chain validation take a read lock and run concurrently with each other.
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use futures::Stream;
use thiserror::Error;
use tracing::{debug, error, info, trace};
use trellis_core::{
    AuditEvent, AuditKind, AuditSink, Capability, ChainValidator, Decision, Edge, EdgeId,
    EdgeShapeError, EdgeStore, EdgeStoreError, EdgeType, EntityId, MutationError, MutationKind,
    MutationPayload, MutationRecord, PermissionResolver, TenantId, Timestamp, ValidationRequest,
    ValidationResponse, Version,
};
use trellis_store::{BackupScheduler, LogError, MutationLog, Snapshot};
use trellis_sync::{BroadcastEvent, SyncCoordinator, SyncPlan, SyncSession, SyncSource};

use crate::config::EngineConfig;

#[derive(Debug, Error)]
pub enum TenantError {
    /// The tenant hit an unrecoverable invariant violation and refuses all further operations.
    #[error("tenant {0} is poisoned: {1}")]
    Poisoned(TenantId, String),

    #[error("{actor} is not allowed to change {target}: {reason}")]
    Unauthorized {
        actor: String,
        target: EntityId,
        reason: String,
    },

    #[error("no {edge_type} relationship from {source_id} to {target_id}")]
    RelationshipNotFound {
        edge_type: EdgeType,
        source_id: EntityId,
        target_id: EntityId,
    },

    #[error("edge {0} not found")]
    EdgeNotFound(EdgeId),

    #[error(transparent)]
    InvalidShape(#[from] EdgeShapeError),

    #[error("failed applying mutation: {0}")]
    Mutation(#[from] MutationError),

    #[error(transparent)]
    IndexCorruption(EdgeStoreError),

    /// The handle belongs to a tenant which is evicted or being evicted. Load it again.
    #[error("tenant {0} is evicted")]
    Evicted(TenantId),
}

/// Who requests a mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Actor {
    /// The host itself, for example an administrative API. Always authorized.
    System,

    /// An end user or group acting on its own behalf.
    ///
    /// Without a proof the actor's permissions are resolved from the graph, with a proof the
    /// supplied chain of edge ids is validated instead.
    Subject {
        id: EntityId,
        proof: Option<Vec<String>>,
    },
}

impl Actor {
    pub fn subject(id: EntityId) -> Self {
        Actor::Subject { id, proof: None }
    }

    pub fn with_proof(id: EntityId, proof: Vec<String>) -> Self {
        Actor::Subject {
            id,
            proof: Some(proof),
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::System => write!(f, "system"),
            Actor::Subject { id, .. } => write!(f, "{id}"),
        }
    }
}

/// Result of a mutation request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutationOutcome {
    /// A new record was appended to the log.
    Applied { version: Version, edge_id: EdgeId },

    /// The graph already was in the requested state, nothing was logged.
    Unchanged { edge_id: EdgeId },
}

impl MutationOutcome {
    pub fn edge_id(&self) -> EdgeId {
        match self {
            MutationOutcome::Applied { edge_id, .. } | MutationOutcome::Unchanged { edge_id } => {
                *edge_id
            }
        }
    }
}

/// Mutations waiting to be written to external storage together with a snapshot of the state
/// they lead to.
#[derive(Clone, Debug)]
pub struct PendingBackup {
    pub version: Version,
    pub records: Vec<MutationRecord>,
    pub snapshot: Snapshot,
}

/// Where a tenant handle is in the eviction process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Open,

    /// Writes are refused while pending mutations are backed up. Reads still work.
    Evicting,

    /// Another handle may own the tenant now, everything is refused.
    Evicted,
}

#[derive(Debug)]
struct TenantState {
    store: EdgeStore,
    log: MutationLog,
    scheduler: BackupScheduler,
    poisoned: Option<String>,
    phase: Phase,
}

/// Handle to the authoritative state of one tenant. Cloning is cheap, all clones share state.
#[derive(Clone)]
pub struct Tenant {
    id: TenantId,
    config: Arc<EngineConfig>,
    state: Arc<RwLock<TenantState>>,
    coordinator: SyncCoordinator,
    audit: Arc<dyn AuditSink>,
}

impl fmt::Debug for Tenant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tenant").field("id", &self.id).finish()
    }
}

impl Tenant {
    /// Create an empty tenant.
    pub fn new(
        id: TenantId,
        config: Arc<EngineConfig>,
        coordinator: SyncCoordinator,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let log = MutationLog::with_retention(config.retention);
        Self::from_parts(id, config, coordinator, audit, EdgeStore::new(), log)
    }

    /// Resume a tenant from a rebuilt edge store and the log it was replayed from.
    ///
    /// Fails if the indexes of the rebuilt store disagree with its edges.
    pub fn restore(
        id: TenantId,
        config: Arc<EngineConfig>,
        coordinator: SyncCoordinator,
        audit: Arc<dyn AuditSink>,
        store: EdgeStore,
        log: MutationLog,
    ) -> Result<Self, TenantError> {
        if let Err(err) = store.verify_indexes() {
            error!(tenant = %id, %err, "rebuilt edge store is inconsistent");
            return Err(TenantError::IndexCorruption(err));
        }

        debug!(
            tenant = %id,
            version = log.current_version(),
            edges = store.len(),
            "restored tenant"
        );
        Ok(Self::from_parts(id, config, coordinator, audit, store, log))
    }

    fn from_parts(
        id: TenantId,
        config: Arc<EngineConfig>,
        coordinator: SyncCoordinator,
        audit: Arc<dyn AuditSink>,
        store: EdgeStore,
        log: MutationLog,
    ) -> Self {
        let scheduler = BackupScheduler::new(config.backup.clone());
        Self {
            id,
            config,
            state: Arc::new(RwLock::new(TenantState {
                store,
                log,
                scheduler,
                poisoned: None,
                phase: Phase::Open,
            })),
            coordinator,
            audit,
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, TenantState> {
        self.state
            .read()
            .expect("acquire shared read access on tenant state")
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, TenantState> {
        self.state
            .write()
            .expect("acquire exclusive write access on tenant state")
    }

    /// Read access to a healthy state.
    fn healthy_state(&self) -> Result<RwLockReadGuard<'_, TenantState>, TenantError> {
        let state = self.read_state();
        if let Some(reason) = &state.poisoned {
            return Err(TenantError::Poisoned(self.id.clone(), reason.clone()));
        }
        if state.phase == Phase::Evicted {
            return Err(TenantError::Evicted(self.id.clone()));
        }
        Ok(state)
    }

    pub fn id(&self) -> &TenantId {
        &self.id
    }

    pub fn version(&self) -> Version {
        self.read_state().log.current_version()
    }

    pub fn is_poisoned(&self) -> bool {
        self.read_state().poisoned.is_some()
    }

    /// Refuse all further operations.
    pub fn poison(&self, reason: impl Into<String>) {
        let reason = reason.into();
        error!(tenant = %self.id, %reason, "poisoning tenant");
        self.write_state().poisoned = Some(reason);
    }

    /// Stop accepting mutations so the pending ones can be backed up for eviction.
    pub(crate) fn begin_eviction(&self) {
        self.write_state().phase = Phase::Evicting;
    }

    /// Accept mutations again after an eviction was given up.
    pub(crate) fn abort_eviction(&self) {
        let mut state = self.write_state();
        if state.phase == Phase::Evicting {
            state.phase = Phase::Open;
        }
    }

    /// Refuse everything from now on, the registry dropped this handle.
    pub(crate) fn finish_eviction(&self) {
        self.write_state().phase = Phase::Evicted;
    }

    /// Check the edge store indexes, poisoning the tenant if they are inconsistent.
    pub fn verify(&self) -> Result<(), TenantError> {
        let result = self.healthy_state()?.store.verify_indexes();
        if let Err(err) = result {
            self.poison(err.to_string());
            return Err(TenantError::IndexCorruption(err));
        }
        Ok(())
    }

    /// Grant `capability` on `resource` to a user or group.
    pub fn grant(
        &self,
        actor: &Actor,
        subject: EntityId,
        resource: EntityId,
        capability: Capability,
    ) -> Result<MutationOutcome, TenantError> {
        self.create(
            actor,
            MutationKind::Grant,
            EdgeType::HasPermission,
            subject,
            resource,
            Some(capability),
        )
    }

    /// Revoke the active grant of `capability` on `resource` to `subject`.
    ///
    /// Revoking a grant which is already revoked changes nothing.
    pub fn revoke(
        &self,
        actor: &Actor,
        subject: &EntityId,
        resource: &EntityId,
        capability: &Capability,
    ) -> Result<MutationOutcome, TenantError> {
        let mut state = self.write_state();
        self.ensure_healthy(&state)?;
        self.authorize(&state, actor, EdgeType::HasPermission, resource)?;

        let store = &state.store;
        let Some(edge) = store.find_active(
            EdgeType::HasPermission,
            subject,
            resource,
            Some(capability),
        ) else {
            let revoked = store
                .edges_between(subject, resource)
                .filter(|edge| {
                    edge.is_revoked()
                        && edge.edge_type == EdgeType::HasPermission
                        && edge.capability.as_ref() == Some(capability)
                })
                .max_by_key(|edge| edge.revoked_at);
            return match revoked {
                Some(edge) => Ok(MutationOutcome::Unchanged { edge_id: edge.id }),
                None => Err(TenantError::RelationshipNotFound {
                    edge_type: EdgeType::HasPermission,
                    source_id: subject.clone(),
                    target_id: resource.clone(),
                }),
            };
        };

        let payload = MutationPayload::from(edge);
        self.commit(&mut state, MutationKind::Revoke, payload)
    }

    /// Create an edge of any type. Structural edges can only be created by the system.
    pub fn create_edge(
        &self,
        actor: &Actor,
        edge_type: EdgeType,
        source: EntityId,
        target: EntityId,
        capability: Option<Capability>,
    ) -> Result<MutationOutcome, TenantError> {
        self.create(
            actor,
            MutationKind::CreateEdge,
            edge_type,
            source,
            target,
            capability,
        )
    }

    /// Revoke an edge by id. Revoking an already revoked edge changes nothing.
    pub fn revoke_edge(&self, actor: &Actor, id: &EdgeId) -> Result<MutationOutcome, TenantError> {
        let mut state = self.write_state();
        self.ensure_healthy(&state)?;

        let edge = state
            .store
            .get(id)
            .ok_or(TenantError::EdgeNotFound(*id))?;
        self.authorize(&state, actor, edge.edge_type, &edge.target_id)?;

        if edge.is_revoked() {
            return Ok(MutationOutcome::Unchanged { edge_id: *id });
        }

        let payload = MutationPayload::from(edge);
        self.commit(&mut state, MutationKind::RevokeEdge, payload)
    }

    fn create(
        &self,
        actor: &Actor,
        kind: MutationKind,
        edge_type: EdgeType,
        source: EntityId,
        target: EntityId,
        capability: Option<Capability>,
    ) -> Result<MutationOutcome, TenantError> {
        let mut state = self.write_state();
        self.ensure_healthy(&state)?;
        self.authorize(&state, actor, edge_type, &target)?;

        if let Some(edge) = state
            .store
            .find_active(edge_type, &source, &target, capability.as_ref())
        {
            trace!(tenant = %self.id, edge = %edge.id, "relationship exists already");
            return Ok(MutationOutcome::Unchanged { edge_id: edge.id });
        }

        let edge = Edge {
            id: state.store.mint_edge_id(),
            edge_type,
            source_id: source,
            target_id: target,
            capability,
            created_at: Timestamp::now(),
            revoked_at: None,
        };
        edge.validate_shape()?;

        let payload = MutationPayload::from(&edge);
        self.commit(&mut state, kind, payload)
    }

    /// Mutations need a healthy tenant which is not on its way out.
    fn ensure_healthy(&self, state: &TenantState) -> Result<(), TenantError> {
        if let Some(reason) = &state.poisoned {
            return Err(TenantError::Poisoned(self.id.clone(), reason.clone()));
        }
        match state.phase {
            Phase::Open => Ok(()),
            Phase::Evicting | Phase::Evicted => Err(TenantError::Evicted(self.id.clone())),
        }
    }

    /// Check whether the actor may create or revoke an edge of the given type pointing at
    /// `target`.
    fn authorize(
        &self,
        state: &TenantState,
        actor: &Actor,
        edge_type: EdgeType,
        target: &EntityId,
    ) -> Result<(), TenantError> {
        let (subject, proof) = match actor {
            Actor::System => return Ok(()),
            Actor::Subject { id, proof } => (id, proof),
        };

        let unauthorized = |reason: String| TenantError::Unauthorized {
            actor: actor.to_string(),
            target: target.clone(),
            reason,
        };

        if edge_type.is_structural() {
            return Err(unauthorized(format!(
                "{edge_type} edges can only be changed by the system"
            )));
        }

        let capability = &self.config.admin_capability;
        match proof {
            Some(edge_ids) => {
                let response = ChainValidator::new(&state.store, self.audit.as_ref())
                    .validate_for(edge_ids, subject, target, capability);
                match response.reason {
                    None => Ok(()),
                    Some(reason) => Err(unauthorized(format!("invalid proof: {reason}"))),
                }
            }
            None => {
                let decision = self
                    .resolver(&state.store)
                    .check(subject, target, capability);
                self.audit_decision(subject, target, capability, &decision);
                if decision.allowed {
                    Ok(())
                } else {
                    Err(unauthorized(format!("missing {capability} capability")))
                }
            }
        }
    }

    fn audit_decision(
        &self,
        subject: &EntityId,
        resource: &EntityId,
        capability: &Capability,
        decision: &Decision,
    ) {
        self.audit.record(AuditEvent {
            kind: if decision.allowed {
                AuditKind::Allowed
            } else {
                AuditKind::Denied
            },
            subject: subject.clone(),
            resource: resource.clone(),
            capability: Some(capability.clone()),
            edge_ids: decision.path.iter().map(EdgeId::to_hex).collect(),
            reason: None,
            timestamp: Timestamp::now(),
        });
    }

    /// Apply, log and publish a mutation. Either all of it happens or, on error, nothing.
    fn commit(
        &self,
        state: &mut TenantState,
        kind: MutationKind,
        payload: MutationPayload,
    ) -> Result<MutationOutcome, TenantError> {
        let edge_id = payload.edge_id;
        let record = MutationRecord::new(state.log.next_version(), Timestamp::now(), kind, payload)?;
        record.apply(&mut state.store)?;

        // The store already changed, a log which refuses the record can not be reconciled.
        if let Err(err) = state.log.push(record.clone()) {
            return Err(self.poison_locked(state, err));
        }

        let version = record.version;
        state.scheduler.record_mutation(version, now());
        self.coordinator.publish(&self.id, record);

        info!(tenant = %self.id, version, %kind, edge = %edge_id, "applied mutation");
        Ok(MutationOutcome::Applied { version, edge_id })
    }

    fn poison_locked(&self, state: &mut TenantState, err: LogError) -> TenantError {
        let reason = err.to_string();
        error!(tenant = %self.id, %reason, "mutation log rejected applied mutation");
        state.poisoned = Some(reason.clone());
        TenantError::Poisoned(self.id.clone(), reason)
    }

    /// Check for a direct or inherited permission.
    pub fn check(
        &self,
        subject: &EntityId,
        resource: &EntityId,
        capability: &Capability,
    ) -> Result<Decision, TenantError> {
        let state = self.healthy_state()?;
        let decision = self.resolver(&state.store).check(subject, resource, capability);
        self.audit_decision(subject, resource, capability, &decision);
        Ok(decision)
    }

    /// Check for a permission held by `subject` itself.
    pub fn check_direct(
        &self,
        subject: &EntityId,
        resource: &EntityId,
        capability: &Capability,
    ) -> Result<Decision, TenantError> {
        let state = self.healthy_state()?;
        let decision = self
            .resolver(&state.store)
            .check_direct(subject, resource, capability);
        self.audit_decision(subject, resource, capability, &decision);
        Ok(decision)
    }

    pub fn capabilities(
        &self,
        subject: &EntityId,
        resource: &EntityId,
    ) -> Result<BTreeSet<Capability>, TenantError> {
        let state = self.healthy_state()?;
        Ok(self.resolver(&state.store).capabilities(subject, resource))
    }

    pub fn groups_of(&self, subject: &EntityId) -> Result<BTreeSet<EntityId>, TenantError> {
        let state = self.healthy_state()?;
        Ok(self.resolver(&state.store).groups_of(subject))
    }

    pub fn accessible_resources(
        &self,
        subject: &EntityId,
        capability: &Capability,
    ) -> Result<BTreeSet<EntityId>, TenantError> {
        let state = self.healthy_state()?;
        Ok(self
            .resolver(&state.store)
            .accessible_resources(subject, capability))
    }

    pub fn subjects_with_access(
        &self,
        resource: &EntityId,
        capability: &Capability,
    ) -> Result<BTreeSet<EntityId>, TenantError> {
        let state = self.healthy_state()?;
        Ok(self
            .resolver(&state.store)
            .subjects_with_access(resource, capability))
    }

    fn resolver<'a>(&self, store: &'a EdgeStore) -> PermissionResolver<'a> {
        PermissionResolver::with_config(store, self.config.resolver.clone())
    }

    /// Validate a chain proof submitted by a caller.
    pub fn validate(&self, request: &ValidationRequest) -> Result<ValidationResponse, TenantError> {
        let state = self.healthy_state()?;
        Ok(ChainValidator::new(&state.store, self.audit.as_ref()).handle(request))
    }

    /// Point-in-time copy of the tenant's edges.
    pub fn snapshot(&self) -> Snapshot {
        let state = self.read_state();
        Snapshot::new(self.id.clone(), state.log.current_version(), &state.store)
    }

    /// Subscribe to mutations committed from now on.
    pub fn subscribe(&self) -> impl Stream<Item = BroadcastEvent> + Send + Unpin + use<> {
        self.coordinator.subscribe(&self.id)
    }

    /// Prepare a sync session with a reader.
    ///
    /// The subscription is taken before the reader's first catch-up is planned.
    pub fn sync_session(
        &self,
    ) -> SyncSession<Tenant, impl Stream<Item = BroadcastEvent> + Send + Unpin + use<>> {
        SyncSession::new(self.clone(), self.subscribe())
    }

    pub fn is_dirty(&self) -> bool {
        self.read_state().scheduler.is_dirty()
    }

    pub fn needs_backup(&self, now: Instant) -> bool {
        let state = self.read_state();
        state.poisoned.is_none()
            && state.phase == Phase::Open
            && state.scheduler.needs_backup(now)
    }

    /// Collect everything not yet written to external storage.
    pub fn pending_backup(&self) -> PendingBackup {
        let state = self.read_state();
        let version = state.log.current_version();
        PendingBackup {
            version,
            records: state.log.records_since_durable(),
            snapshot: Snapshot::new(self.id.clone(), version, &state.store),
        }
    }

    /// Logged mutations not yet written to external storage.
    pub fn pending_records(&self) -> Vec<MutationRecord> {
        self.read_state().log.records_since_durable()
    }

    /// Confirm a backup up to `version`, allowing older log records to be pruned.
    pub fn complete_backup(&self, version: Version) {
        let mut state = self.write_state();
        state.log.mark_durable(version);
        state.scheduler.mark_backed_up(version);
        let pruned = state.log.prune();
        debug!(tenant = %self.id, version, pruned, "backup completed");
    }

    /// Register a failed backup. Returns the delay before the next attempt.
    pub fn fail_backup(&self, now: Instant) -> Duration {
        self.write_state().scheduler.record_failure(now)
    }

    pub fn consecutive_backup_failures(&self) -> u32 {
        self.read_state().scheduler.consecutive_failures()
    }
}

impl SyncSource for Tenant {
    fn plan_sync(&self, client_version: Version) -> SyncPlan {
        let state = self.read_state();
        self.coordinator.plan_sync(&state.log, client_version)
    }
}

/// Current time in a way that follows the tokio clock, which can be paused in tests.
pub(crate) fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

#[cfg(test)]
mod tests;
