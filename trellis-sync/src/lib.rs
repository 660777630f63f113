// SPDX-License-Identifier: MIT OR Apache-2.0

//! Keeps readers of a tenant's permission graph in sync with its authority.
//!
//! A reader announces the version of its local state and receives either nothing, the missing
//! mutations or the request to load a full snapshot. Afterwards every new mutation is pushed to
//! it as a broadcast. Messages are exchanged as newline-delimited JSON over any duplex transport.
pub mod broadcast;
pub mod codec;
pub mod message;
pub mod plan;
pub mod replica;
pub mod session;
#[cfg(test)]
mod test_utils;

use futures::Stream;
use thiserror::Error;
use trellis_core::{MutationError, MutationRecord, TenantId, Version};
use trellis_store::{MutationLog, SnapshotError};

pub use broadcast::{BroadcastEvent, Broadcaster};
pub use codec::JsonLinesCodec;
pub use message::SyncMessage;
pub use plan::{SyncConfig, SyncPlan, plan_sync};
pub use replica::{ApplyOutcome, CatchUp, Replica};
pub use session::{SessionMetrics, SyncSession, SyncSource};

#[derive(Debug, Error)]
pub enum SyncError {
    /// Error which occurs when encoding or decoding protocol messages.
    #[error("codec error: {0}")]
    Codec(String),

    #[error("input/output error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected sync message: {0}")]
    UnexpectedMessage(String),

    #[error("failed sending sync message: {0}")]
    MessageSink(String),

    #[error("failed receiving sync message: {0}")]
    MessageStream(String),

    #[error("expected mutation with version {expected}, got {got}")]
    OutOfOrder { expected: Version, got: Version },

    #[error("failed applying mutation: {0}")]
    Apply(#[from] MutationError),

    #[error("failed loading snapshot: {0}")]
    Snapshot(#[from] SnapshotError),
}

/// Plans catch-ups and fans out new mutations for all tenants of a host.
#[derive(Clone, Debug, Default)]
pub struct SyncCoordinator {
    config: SyncConfig,
    broadcaster: Broadcaster,
}

impl SyncCoordinator {
    pub fn new(config: SyncConfig, broadcast_capacity: usize) -> Self {
        Self {
            config,
            broadcaster: Broadcaster::new(broadcast_capacity),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn plan_sync(&self, log: &MutationLog, client_version: Version) -> SyncPlan {
        plan::plan_sync(log, client_version, &self.config)
    }

    pub fn subscribe(
        &self,
        tenant: &TenantId,
    ) -> impl Stream<Item = BroadcastEvent> + Send + Unpin + use<> {
        self.broadcaster.subscribe(tenant)
    }

    pub fn publish(&self, tenant: &TenantId, record: MutationRecord) -> usize {
        self.broadcaster.publish(tenant, record)
    }

    pub fn subscriber_count(&self, tenant: &TenantId) -> usize {
        self.broadcaster.subscriber_count(tenant)
    }

    /// End all subscriptions of a tenant, for example when it is evicted.
    pub fn close(&self, tenant: &TenantId) {
        self.broadcaster.close(tenant)
    }
}
