// SPDX-License-Identifier: MIT OR Apache-2.0

//! Reader-side copy of a tenant's permission graph.
use tracing::{debug, trace};
use trellis_core::{EdgeStore, MutationRecord, Version};
use trellis_store::Snapshot;

use crate::SyncError;
use crate::message::SyncMessage;
use crate::plan::SyncPlan;

/// Result of applying a broadcast mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,

    /// The mutation is already part of the local state.
    Stale,

    /// Mutations are missing in between, the reader has to run a catch-up sync.
    ResyncRequired,
}

/// Result of processing a sync response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CatchUp {
    UpToDate,

    /// This many mutations were applied.
    Applied(usize),

    /// Local state has to be replaced by a full snapshot.
    SnapshotRequired,
}

/// Local edge store of a reader together with the log version it reflects.
#[derive(Clone, Debug, Default)]
pub struct Replica {
    store: EdgeStore,
    version: Version,
}

impl Replica {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: &Snapshot) -> Result<Self, SyncError> {
        let mut replica = Self::new();
        replica.load_snapshot(snapshot)?;
        Ok(replica)
    }

    pub fn store(&self) -> &EdgeStore {
        &self.store
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Message announcing the local version to the authority.
    pub fn version_message(&self) -> SyncMessage {
        SyncMessage::Version {
            version: self.version,
        }
    }

    /// Replace local state with a snapshot.
    pub fn load_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), SyncError> {
        self.store = snapshot.to_store()?;
        self.version = snapshot.version;
        debug!(version = self.version, "loaded snapshot");
        Ok(())
    }

    /// Apply a broadcast mutation if it directly follows the local version.
    pub fn apply_broadcast(&mut self, record: &MutationRecord) -> Result<ApplyOutcome, SyncError> {
        if record.version <= self.version {
            return Ok(ApplyOutcome::Stale);
        }

        if record.version != self.version + 1 {
            debug!(
                local = self.version,
                received = record.version,
                "missed mutations, resync required"
            );
            return Ok(ApplyOutcome::ResyncRequired);
        }

        record.apply(&mut self.store)?;
        self.version = record.version;
        trace!(version = self.version, "applied broadcast mutation");
        Ok(ApplyOutcome::Applied)
    }

    /// Apply the mutations of an incremental catch-up.
    ///
    /// The records have to continue the local version without gaps. They are applied to a copy
    /// first, on any error the local state stays untouched.
    pub fn apply_incremental(&mut self, records: &[MutationRecord]) -> Result<usize, SyncError> {
        let mut store = self.store.clone();
        let mut version = self.version;

        for record in records {
            if record.version != version + 1 {
                return Err(SyncError::OutOfOrder {
                    expected: version + 1,
                    got: record.version,
                });
            }
            record.apply(&mut store)?;
            version = record.version;
        }

        self.store = store;
        self.version = version;
        Ok(records.len())
    }

    /// Apply a sync plan computed for the local version.
    pub fn apply_plan(&mut self, plan: &SyncPlan) -> Result<CatchUp, SyncError> {
        match plan {
            SyncPlan::UpToDate => Ok(CatchUp::UpToDate),
            SyncPlan::Incremental(records) => self.apply_incremental(records).map(CatchUp::Applied),
            SyncPlan::ClientAhead { .. } | SyncPlan::FullSyncRequired => {
                Ok(CatchUp::SnapshotRequired)
            }
        }
    }

    /// Process a response of the authority.
    pub fn handle_message(&mut self, message: &SyncMessage) -> Result<CatchUp, SyncError> {
        match message {
            SyncMessage::UpToDate => Ok(CatchUp::UpToDate),
            SyncMessage::Incremental { mutations } => {
                self.apply_incremental(mutations).map(CatchUp::Applied)
            }
            SyncMessage::FullSyncRequired => Ok(CatchUp::SnapshotRequired),
            SyncMessage::Mutation { mutation, .. } => match self.apply_broadcast(mutation)? {
                ApplyOutcome::Applied => Ok(CatchUp::Applied(1)),
                ApplyOutcome::Stale => Ok(CatchUp::UpToDate),
                ApplyOutcome::ResyncRequired => Err(SyncError::OutOfOrder {
                    expected: self.version + 1,
                    got: mutation.version,
                }),
            },
            SyncMessage::Version { .. } => Err(SyncError::UnexpectedMessage(message.to_string())),
        }
    }
}
