// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::batch::Batch;
use crate::dispatcher::{DispatchResult, Dispatcher};
use crate::errors::HarvestError;
use crate::payload::FunctionIdentity;

/// Owns the batch and hands harvested invocations to the dispatcher.
#[derive(Debug, Clone)]
pub struct Harvester {
    batch: Arc<Batch>,
    dispatcher: Dispatcher,
    collect_agent_data: bool,
}

impl Harvester {
    #[must_use]
    pub fn new(batch: Batch, dispatcher: Dispatcher) -> Self {
        Self {
            batch: Arc::new(batch),
            dispatcher,
            collect_agent_data: true,
        }
    }

    /// When `collect` is false the collector still drains the queue, so the listener never
    /// blocks, but drops every chunk instead of batching it.
    #[must_use]
    pub fn collect_agent_data(mut self, collect: bool) -> Self {
        self.collect_agent_data = collect;
        self
    }

    pub fn add_invocation(&self, request_id: &str, start: DateTime<Utc>) {
        self.batch.add_invocation(request_id, start);
    }

    pub fn add_telemetry(&self, request_id: &str, bytes: Vec<u8>) {
        self.batch.add_telemetry(request_id, bytes);
    }

    #[must_use]
    pub fn ready_to_harvest(&self) -> bool {
        self.batch.ready_to_harvest()
    }

    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        self.batch.total_bytes()
    }

    /// Moves raw chunks from the listener queue into the batch under the latest invocation
    /// until every sender is dropped.
    pub fn spawn_collector(&self, mut rx: mpsc::Receiver<Vec<u8>>) -> JoinHandle<()> {
        let batch = Arc::clone(&self.batch);
        let collect = self.collect_agent_data;
        tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                if !collect {
                    trace!("Agent data collection disabled, dropping {} bytes", chunk.len());
                    continue;
                }
                batch.add_telemetry_to_latest(chunk);
            }
            debug!("Telemetry queue closed, collector exiting");
        })
    }

    /// Harvests the batch (unconditionally when `force` is set) and dispatches the result.
    pub async fn dispatch(
        &self,
        cancel: &CancellationToken,
        identity: &FunctionIdentity,
        force: bool,
    ) -> Result<DispatchResult, HarvestError> {
        let harvested = self.batch.harvest(force);
        if harvested.is_empty() {
            return Ok(DispatchResult::default());
        }
        debug!(
            "Dispatching {} harvested invocations (forced: {force})",
            harvested.len()
        );
        self.dispatcher.dispatch(cancel, harvested, identity).await
    }
}
