// SPDX-License-Identifier: MIT OR Apache-2.0

//! Messages of the catch-up sync protocol.
use std::fmt;

use serde::{Deserialize, Serialize};
use trellis_core::{MutationRecord, Version};

use crate::plan::SyncPlan;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncMessage {
    /// Reader announces the version of its local state.
    Version { version: Version },

    UpToDate,

    Incremental { mutations: Vec<MutationRecord> },

    FullSyncRequired,

    /// Unsolicited broadcast of a single new mutation.
    Mutation {
        version: Version,
        mutation: MutationRecord,
    },
}

impl SyncMessage {
    pub fn broadcast(record: MutationRecord) -> Self {
        SyncMessage::Mutation {
            version: record.version,
            mutation: record,
        }
    }
}

impl From<SyncPlan> for SyncMessage {
    fn from(plan: SyncPlan) -> Self {
        match plan {
            SyncPlan::UpToDate => SyncMessage::UpToDate,
            SyncPlan::Incremental(mutations) => SyncMessage::Incremental { mutations },
            SyncPlan::ClientAhead { .. } | SyncPlan::FullSyncRequired => {
                SyncMessage::FullSyncRequired
            }
        }
    }
}

impl fmt::Display for SyncMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            SyncMessage::Version { .. } => "version",
            SyncMessage::UpToDate => "up_to_date",
            SyncMessage::Incremental { .. } => "incremental",
            SyncMessage::FullSyncRequired => "full_sync_required",
            SyncMessage::Mutation { .. } => "mutation",
        };
        write!(f, "{value}")
    }
}
