// SPDX-License-Identifier: MIT OR Apache-2.0

//! Debounced backup scheduling.
//!
//! The scheduler does not own a timer. A host task asks `needs_backup` periodically and reports
//! the outcome of every backup attempt back.
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use trellis_core::Version;

/// When to write pending mutations to external storage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupPolicy {
    /// Back up as soon as this many mutations are pending.
    pub max_pending_mutations: u64,

    /// Back up once no mutation arrived for this long.
    pub max_idle: Duration,

    /// Delay before retrying after the first failed attempt, doubled on every further failure.
    pub initial_backoff: Duration,

    /// Upper bound of the retry delay.
    pub max_backoff: Duration,
}

impl Default for BackupPolicy {
    fn default() -> Self {
        Self {
            max_pending_mutations: 100,
            max_idle: Duration::from_secs(5),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl BackupPolicy {
    pub fn max_pending_mutations(mut self, count: u64) -> Self {
        self.max_pending_mutations = count;
        self
    }

    pub fn max_idle(mut self, duration: Duration) -> Self {
        self.max_idle = duration;
        self
    }

    pub fn backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }
}

/// Tracks which mutations still need to be backed up.
#[derive(Clone, Debug)]
pub struct BackupScheduler {
    policy: BackupPolicy,

    /// First version which is not backed up yet, `None` when everything is durable.
    dirty_since: Option<Version>,
    latest_version: Version,
    last_mutation_at: Option<Instant>,
    backoff: Option<Duration>,
    failed_at: Option<Instant>,
    failures: u32,
}

impl BackupScheduler {
    pub fn new(policy: BackupPolicy) -> Self {
        Self {
            policy,
            dirty_since: None,
            latest_version: 0,
            last_mutation_at: None,
            backoff: None,
            failed_at: None,
            failures: 0,
        }
    }

    pub fn policy(&self) -> &BackupPolicy {
        &self.policy
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty_since.is_some()
    }

    pub fn dirty_since(&self) -> Option<Version> {
        self.dirty_since
    }

    /// Number of mutations not backed up yet.
    pub fn pending(&self) -> u64 {
        self.dirty_since
            .map_or(0, |since| self.latest_version + 1 - since)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }

    pub fn record_mutation(&mut self, version: Version, now: Instant) {
        if self.dirty_since.is_none() {
            self.dirty_since = Some(version);
        }
        self.latest_version = self.latest_version.max(version);
        self.last_mutation_at = Some(now);
    }

    /// Returns `true` if a backup should be attempted now.
    pub fn needs_backup(&self, now: Instant) -> bool {
        if !self.is_dirty() {
            return false;
        }

        if let (Some(failed_at), Some(backoff)) = (self.failed_at, self.backoff) {
            return now.saturating_duration_since(failed_at) >= backoff;
        }

        if self.pending() >= self.policy.max_pending_mutations {
            return true;
        }

        self.last_mutation_at
            .is_some_and(|at| now.saturating_duration_since(at) >= self.policy.max_idle)
    }

    /// Confirm that all mutations up to `version` are backed up.
    pub fn mark_backed_up(&mut self, version: Version) {
        if version >= self.latest_version {
            self.dirty_since = None;
        } else if self.dirty_since.is_some_and(|since| since <= version) {
            self.dirty_since = Some(version + 1);
        }

        if self.failures > 0 {
            debug!(failures = self.failures, "backup recovered");
        }
        self.failures = 0;
        self.backoff = None;
        self.failed_at = None;
    }

    /// Register a failed backup attempt and delay the next one.
    pub fn record_failure(&mut self, now: Instant) -> Duration {
        let backoff = match self.backoff {
            None => self.policy.initial_backoff,
            Some(previous) => previous.saturating_mul(2).min(self.policy.max_backoff),
        };
        self.failures += 1;
        self.backoff = Some(backoff);
        self.failed_at = Some(now);

        warn!(
            failures = self.failures,
            retry_in = ?backoff,
            "backup failed"
        );
        backoff
    }
}
