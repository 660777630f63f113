// SPDX-License-Identifier: MIT OR Apache-2.0

//! Authority side of a sync connection with one reader.
use std::fmt::Debug;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::select;
use tracing::{debug, trace, warn};
use trellis_core::Version;

use crate::SyncError;
use crate::broadcast::BroadcastEvent;
use crate::message::SyncMessage;
use crate::plan::SyncPlan;

/// Anything able to plan a catch-up for a reader, usually the authority of a tenant.
pub trait SyncSource {
    fn plan_sync(&self, client_version: Version) -> SyncPlan;
}

/// Counters of a finished session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionMetrics {
    pub plans_served: usize,
    pub mutations_forwarded: usize,
    pub full_syncs_requested: usize,
}

/// Answers `version` messages of a reader with a sync plan and forwards broadcast mutations.
///
/// The session tracks the version the reader has reached as far as the authority knows. Broadcast
/// mutations the reader already received as part of a catch-up are skipped, after a lagged
/// broadcast the reader is resynced from that version.
pub struct SyncSession<S, B> {
    source: S,
    broadcasts: B,

    /// Version the reader has reached, `None` until it announced its version.
    client_version: Option<Version>,
    metrics: SessionMetrics,
}

impl<S, B> SyncSession<S, B>
where
    S: SyncSource,
    B: Stream<Item = BroadcastEvent> + Unpin,
{
    /// Create a session. The broadcast subscription has to be taken before the first plan is
    /// computed so no mutation falls between both.
    pub fn new(source: S, broadcasts: B) -> Self {
        Self {
            source,
            broadcasts,
            client_version: None,
            metrics: SessionMetrics::default(),
        }
    }

    /// Run the session until the reader disconnects or the broadcast channel closes.
    pub async fn run(
        mut self,
        sink: &mut (impl Sink<SyncMessage, Error = impl Debug> + Unpin),
        stream: &mut (impl Stream<Item = Result<SyncMessage, impl Debug>> + Unpin),
    ) -> Result<SessionMetrics, SyncError> {
        loop {
            select! {
                message = stream.next() => {
                    let Some(message) = message else {
                        debug!("reader closed sync session");
                        break;
                    };
                    let message =
                        message.map_err(|err| SyncError::MessageStream(format!("{err:?}")))?;
                    let SyncMessage::Version { version } = message else {
                        return Err(SyncError::UnexpectedMessage(message.to_string()));
                    };
                    self.serve_plan(version, sink).await?;
                }
                event = self.broadcasts.next() => {
                    let Some(event) = event else {
                        debug!("broadcast channel closed, ending sync session");
                        break;
                    };
                    self.forward(event, sink).await?;
                }
            }
        }

        Ok(self.metrics)
    }

    async fn serve_plan(
        &mut self,
        client_version: Version,
        sink: &mut (impl Sink<SyncMessage, Error = impl Debug> + Unpin),
    ) -> Result<(), SyncError> {
        let plan = self.source.plan_sync(client_version);
        self.metrics.plans_served += 1;

        self.client_version = match &plan {
            SyncPlan::UpToDate => Some(client_version),
            SyncPlan::Incremental(records) => records.last().map(|record| record.version),
            SyncPlan::ClientAhead { .. } | SyncPlan::FullSyncRequired => {
                // The reader announces its version again after loading a snapshot.
                self.metrics.full_syncs_requested += 1;
                None
            }
        };
        trace!(client_version, reached = ?self.client_version, "serving sync plan");

        send(sink, plan.into()).await
    }

    async fn forward(
        &mut self,
        event: BroadcastEvent,
        sink: &mut (impl Sink<SyncMessage, Error = impl Debug> + Unpin),
    ) -> Result<(), SyncError> {
        match event {
            BroadcastEvent::Mutation(record) => {
                let Some(client_version) = self.client_version else {
                    return Ok(());
                };
                if record.version <= client_version {
                    return Ok(());
                }

                self.client_version = Some(record.version);
                self.metrics.mutations_forwarded += 1;
                send(sink, SyncMessage::broadcast(record)).await
            }
            BroadcastEvent::Lagged(missed) => {
                let Some(client_version) = self.client_version else {
                    return Ok(());
                };
                warn!(client_version, missed, "resyncing lagged reader");
                self.serve_plan(client_version, sink).await
            }
        }
    }
}

async fn send(
    sink: &mut (impl Sink<SyncMessage, Error = impl Debug> + Unpin),
    message: SyncMessage,
) -> Result<(), SyncError> {
    sink.send(message)
        .await
        .map_err(|err| SyncError::MessageSink(format!("{err:?}")))
}
