// SPDX-License-Identifier: MIT OR Apache-2.0

//! Append-only, version-ordered mutation log of one tenant.
use std::collections::VecDeque;

use thiserror::Error;
use tracing::{debug, trace};
use trellis_core::{
    MutationError, MutationKind, MutationPayload, MutationRecord, Timestamp, Version,
};

/// Default minimum number of records kept in memory for incremental catch-up.
pub const DEFAULT_RETENTION: usize = 500;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LogError {
    #[error("invalid range ({from}, {to}] with current version {current}")]
    InvalidRange {
        from: Version,
        to: Version,
        current: Version,
    },

    #[error("versions after {from} are not retained, oldest retained version is {oldest:?}")]
    Gap {
        from: Version,
        oldest: Option<Version>,
    },

    #[error("expected record with version {expected}, got {got}")]
    OutOfOrder { expected: Version, got: Version },

    #[error(transparent)]
    Mutation(#[from] MutationError),
}

/// Mutation log holding a retained window of the most recent records.
///
/// Versions start at 1 and increase by exactly one per record. Records older than the retention
/// window are only dropped by `prune` and only once `mark_durable` confirmed that they were
/// written to external storage.
#[derive(Clone, Debug)]
pub struct MutationLog {
    records: VecDeque<MutationRecord>,

    /// Version of the record right before the first retained one.
    base_version: Version,
    current_version: Version,
    durable_version: Version,
    retention: usize,
}

impl Default for MutationLog {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }
}

impl MutationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: usize) -> Self {
        Self {
            records: VecDeque::new(),
            base_version: 0,
            current_version: 0,
            durable_version: 0,
            retention,
        }
    }

    /// Rebuild a log from records following `base_version`, for example after a cold start from
    /// a snapshot taken at `base_version`.
    ///
    /// Restored records are considered durable.
    pub fn restore(
        retention: usize,
        base_version: Version,
        records: impl IntoIterator<Item = MutationRecord>,
    ) -> Result<Self, LogError> {
        let mut log = Self::with_retention(retention);
        log.base_version = base_version;
        log.current_version = base_version;

        for record in records {
            log.push(record)?;
        }

        log.durable_version = log.current_version;
        debug!(
            base_version,
            current_version = log.current_version,
            "restored mutation log"
        );
        Ok(log)
    }

    pub fn current_version(&self) -> Version {
        self.current_version
    }

    /// Version the next appended record will carry.
    pub fn next_version(&self) -> Version {
        self.current_version + 1
    }

    /// Version of the oldest record still held in memory.
    pub fn oldest_retained(&self) -> Option<Version> {
        self.records.front().map(|record| record.version)
    }

    /// Highest version known to be written to external storage.
    pub fn durable_version(&self) -> Version {
        self.durable_version
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    /// Number of retained records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Create the next record and append it, returning its version.
    pub fn append(
        &mut self,
        kind: MutationKind,
        payload: MutationPayload,
        timestamp: Timestamp,
    ) -> Result<Version, LogError> {
        let record = MutationRecord::new(self.next_version(), timestamp, kind, payload)?;
        self.push(record)
    }

    /// Append a record which already carries the next version.
    pub fn push(&mut self, record: MutationRecord) -> Result<Version, LogError> {
        let expected = self.next_version();
        if record.version != expected {
            return Err(LogError::OutOfOrder {
                expected,
                got: record.version,
            });
        }

        trace!(version = record.version, kind = %record.kind, "append mutation");
        self.current_version = record.version;
        self.records.push_back(record);
        Ok(self.current_version)
    }

    /// Records with versions in `(from_exclusive, to_inclusive]`, in version order.
    ///
    /// Either every requested record is returned or an error, a range reaching beyond the
    /// retained window fails with `LogError::Gap`.
    pub fn range(
        &self,
        from_exclusive: Version,
        to_inclusive: Version,
    ) -> Result<Vec<MutationRecord>, LogError> {
        if from_exclusive > to_inclusive || to_inclusive > self.current_version {
            return Err(LogError::InvalidRange {
                from: from_exclusive,
                to: to_inclusive,
                current: self.current_version,
            });
        }

        if from_exclusive == to_inclusive {
            return Ok(Vec::new());
        }

        if from_exclusive < self.base_version {
            return Err(LogError::Gap {
                from: from_exclusive,
                oldest: self.oldest_retained(),
            });
        }

        let start = (from_exclusive - self.base_version) as usize;
        let end = (to_inclusive - self.base_version) as usize;
        Ok(self.records.range(start..end).cloned().collect())
    }

    /// Records appended after the last confirmed backup.
    pub fn records_since_durable(&self) -> Vec<MutationRecord> {
        self.records
            .iter()
            .filter(|record| record.version > self.durable_version)
            .cloned()
            .collect()
    }

    /// Confirm that all records up to `version` were written to external storage.
    pub fn mark_durable(&mut self, version: Version) {
        let version = version.min(self.current_version);
        if version > self.durable_version {
            trace!(version, "mark mutations durable");
            self.durable_version = version;
        }
    }

    /// Drop durable records outside of the retention window. Returns the number of dropped
    /// records.
    pub fn prune(&mut self) -> usize {
        let mut pruned = 0;
        while self.records.len() > self.retention {
            match self.records.front() {
                Some(record) if record.version <= self.durable_version => {
                    self.base_version = record.version;
                    self.records.pop_front();
                    pruned += 1;
                }
                _ => break,
            }
        }

        if pruned > 0 {
            debug!(
                pruned,
                oldest_retained = ?self.oldest_retained(),
                "pruned mutation log"
            );
        }
        pruned
    }

    pub fn iter(&self) -> impl Iterator<Item = &MutationRecord> {
        self.records.iter()
    }
}
