// SPDX-License-Identifier: MIT OR Apache-2.0

//! Decide how a stale reader catches up with the authority.
use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use trellis_core::{MutationRecord, Version};
use trellis_store::{LogError, MutationLog};

/// Default maximum number of mutations served incrementally.
pub const DEFAULT_MAX_INCREMENTAL: u64 = 1000;

/// Configuration of catch-up sync.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Readers lagging behind by more mutations than this receive a full snapshot instead.
    pub max_incremental: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_incremental: DEFAULT_MAX_INCREMENTAL,
        }
    }
}

impl SyncConfig {
    pub fn max_incremental(mut self, count: u64) -> Self {
        self.max_incremental = count;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncPlan {
    UpToDate,

    /// The reader claims a version the authority never reached. Its state is corrupt and has to
    /// be discarded.
    ClientAhead {
        client_version: Version,
        current_version: Version,
    },

    /// All mutations after the reader's version, in order.
    Incremental(Vec<MutationRecord>),

    FullSyncRequired,
}

impl SyncPlan {
    /// Returns `true` if the reader has to load a full snapshot.
    pub fn requires_snapshot(&self) -> bool {
        matches!(
            self,
            SyncPlan::ClientAhead { .. } | SyncPlan::FullSyncRequired
        )
    }
}

/// Plan how a reader at `client_version` catches up with the log.
///
/// A window which is not fully retained is never partially served, the reader gets
/// `FullSyncRequired` instead.
pub fn plan_sync(log: &MutationLog, client_version: Version, config: &SyncConfig) -> SyncPlan {
    let current_version = log.current_version();

    match client_version.cmp(&current_version) {
        Ordering::Equal => SyncPlan::UpToDate,
        Ordering::Greater => {
            warn!(
                client_version,
                current_version, "reader is ahead of the authority"
            );
            SyncPlan::ClientAhead {
                client_version,
                current_version,
            }
        }
        Ordering::Less => {
            let behind = current_version - client_version;
            if behind > config.max_incremental {
                debug!(client_version, behind, "reader too far behind for catch-up");
                return SyncPlan::FullSyncRequired;
            }

            match log.range(client_version, current_version) {
                Ok(records) => SyncPlan::Incremental(records),
                Err(LogError::Gap { oldest, .. }) => {
                    debug!(client_version, ?oldest, "requested mutations already pruned");
                    SyncPlan::FullSyncRequired
                }
                Err(err) => {
                    warn!(client_version, %err, "failed reading mutation log");
                    SyncPlan::FullSyncRequired
                }
            }
        }
    }
}
