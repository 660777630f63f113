// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fan-out of new mutations to the readers of a tenant.
//!
//! Delivery is best effort. Readers which fall behind the channel capacity are told so and have
//! to catch up through the sync protocol, durability is guaranteed by the mutation log only.
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use futures::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{trace, warn};
use trellis_core::{MutationRecord, TenantId};

/// Default number of mutations buffered per tenant channel.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Item of a subscription stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BroadcastEvent {
    Mutation(MutationRecord),

    /// The subscriber missed this many mutations and needs to resync.
    Lagged(u64),
}

type Channels = HashMap<TenantId, broadcast::Sender<MutationRecord>>;

/// Per-tenant publish/subscribe channels of mutation records.
#[derive(Clone, Debug)]
pub struct Broadcaster {
    channels: Arc<RwLock<Channels>>,
    capacity: usize,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_BROADCAST_CAPACITY)
    }
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    fn read_channels(&self) -> RwLockReadGuard<'_, Channels> {
        self.channels
            .read()
            .expect("acquire shared read access on broadcast channels")
    }

    fn write_channels(&self) -> RwLockWriteGuard<'_, Channels> {
        self.channels
            .write()
            .expect("acquire exclusive write access on broadcast channels")
    }

    /// Subscribe to all mutations of a tenant published from now on.
    pub fn subscribe(
        &self,
        tenant: &TenantId,
    ) -> impl Stream<Item = BroadcastEvent> + Send + Unpin + use<> {
        let rx = self
            .write_channels()
            .entry(tenant.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        let tenant = tenant.clone();
        BroadcastStream::new(rx).map(move |item| match item {
            Ok(record) => BroadcastEvent::Mutation(record),
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                warn!(%tenant, missed, "subscriber lagged behind broadcast");
                BroadcastEvent::Lagged(missed)
            }
        })
    }

    /// Publish a mutation to every current subscriber of the tenant. Returns the number of
    /// subscribers it was handed to.
    pub fn publish(&self, tenant: &TenantId, record: MutationRecord) -> usize {
        let channels = self.read_channels();
        let Some(tx) = channels.get(tenant) else {
            return 0;
        };

        let version = record.version;
        // Sending only fails when nobody is subscribed.
        let receivers = tx.send(record).unwrap_or(0);
        trace!(%tenant, version, receivers, "published mutation");
        receivers
    }

    pub fn subscriber_count(&self, tenant: &TenantId) -> usize {
        self.read_channels()
            .get(tenant)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    /// Drop the channel of a tenant, ending all of its subscription streams.
    pub fn close(&self, tenant: &TenantId) {
        self.write_channels().remove(tenant);
    }
}
