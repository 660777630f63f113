// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::Duration;

use serde::{Deserialize, Serialize};
use trellis_core::{Capability, ResolverConfig};
use trellis_store::{BackupPolicy, DEFAULT_RETENTION};
use trellis_sync::SyncConfig;
use trellis_sync::broadcast::DEFAULT_BROADCAST_CAPACITY;

const BACKUP_INTERVAL: Duration = Duration::from_secs(1);

/// Configuration parameters of the authorization engine, shared by all tenants of a host.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of most recent mutations kept in memory per tenant for incremental catch-up.
    ///
    /// Default: 500.
    pub retention: usize,

    /// Group traversal limits of permission checks.
    pub resolver: ResolverConfig,

    /// When mutations are written to external storage.
    pub backup: BackupPolicy,

    /// How often the backup worker polls tenants for pending backups.
    ///
    /// Default: 1 second.
    pub backup_interval: Duration,

    /// Limits of incremental catch-up.
    pub sync: SyncConfig,

    /// Number of mutations buffered for broadcast subscribers of a tenant.
    ///
    /// Default: 256.
    pub broadcast_capacity: usize,

    /// Capability a subject needs on a resource to grant or revoke permissions on it.
    ///
    /// Default: `update`.
    pub admin_capability: Capability,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retention: DEFAULT_RETENTION,
            resolver: ResolverConfig::default(),
            backup: BackupPolicy::default(),
            backup_interval: BACKUP_INTERVAL,
            sync: SyncConfig::default(),
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
            admin_capability: Capability::Update,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retention(mut self, retention: usize) -> Self {
        self.retention = retention;
        self
    }

    pub fn resolver(mut self, resolver: ResolverConfig) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn backup(mut self, policy: BackupPolicy) -> Self {
        self.backup = policy;
        self
    }

    pub fn backup_interval(mut self, interval: Duration) -> Self {
        self.backup_interval = interval;
        self
    }

    pub fn sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    pub fn broadcast_capacity(mut self, capacity: usize) -> Self {
        self.broadcast_capacity = capacity;
        self
    }

    pub fn admin_capability(mut self, capability: Capability) -> Self {
        self.admin_capability = capability;
        self
    }
}
