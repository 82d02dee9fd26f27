// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Drives the harvester from host lifecycle events.
//!
//! Telemetry for one invocation may arrive while the next one is running, and telemetry for
//! the last invocation may only arrive during shutdown, so every event first gives the
//! batch a chance to ship what it holds.

use std::io;
use std::time::Duration;

use chrono::Utc;
use telemetry_harvest::dispatcher::DispatchResult;
use telemetry_harvest::errors::HarvestError;
use telemetry_harvest::harvester::Harvester;
use telemetry_harvest::payload::FunctionIdentity;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::ApiError;
use crate::extension_api::{ExtensionApiClient, NextEvent};

/// Kept back from the shutdown deadline so the process can exit in time.
pub const SHUTDOWN_MARGIN: Duration = Duration::from_millis(200);

/// Background tasks feeding the batch: the local listener and the queue collector.
#[derive(Debug)]
pub struct TelemetryPipeline {
    pub cancel: CancellationToken,
    pub listener: JoinHandle<io::Result<()>>,
    pub collector: JoinHandle<()>,
}

impl TelemetryPipeline {
    /// Stops accepting pushes and waits until everything already queued is in the batch.
    pub async fn drain(self) {
        self.cancel.cancel();
        match self.listener.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Telemetry listener failed: {e}"),
            Err(e) => error!("Telemetry listener task did not complete: {e}"),
        }
        if let Err(e) = self.collector.await {
            error!("Telemetry collector task did not complete: {e}");
        }
    }
}

pub struct Lifecycle {
    extension_api: ExtensionApiClient,
    extension_id: String,
    harvester: Harvester,
    identity: FunctionIdentity,
    pipeline: TelemetryPipeline,
}

impl Lifecycle {
    #[must_use]
    pub fn new(
        extension_api: ExtensionApiClient,
        extension_id: String,
        harvester: Harvester,
        function_name: String,
        pipeline: TelemetryPipeline,
    ) -> Self {
        Self {
            extension_api,
            extension_id,
            harvester,
            identity: FunctionIdentity::new(function_name, String::new()),
            pipeline,
        }
    }

    /// Polls for events until SHUTDOWN, a poll failure or `cancel` firing.
    pub async fn run(mut self, cancel: &CancellationToken) -> Result<(), ApiError> {
        loop {
            debug!("Waiting for next event");
            let event = tokio::select! {
                () = cancel.cancelled() => {
                    info!("Cancelled, exiting");
                    self.pipeline.drain().await;
                    return Ok(());
                }
                event = self.extension_api.next_event(&self.extension_id) => event?,
            };
            debug!("Received event {event:?}");

            match event {
                NextEvent::Invoke {
                    request_id,
                    invoked_function_arn,
                    ..
                } => {
                    self.identity.arn = invoked_function_arn;
                    self.harvester.add_invocation(&request_id, Utc::now());
                    report(self.harvester.dispatch(cancel, &self.identity, false).await);
                }
                NextEvent::Shutdown {
                    shutdown_reason,
                    deadline_ms,
                } => {
                    info!("Shutting down ({shutdown_reason})");
                    self.shutdown(cancel, deadline_ms).await;
                    return Ok(());
                }
            }
        }
    }

    async fn shutdown(self, cancel: &CancellationToken, deadline_ms: i64) {
        let budget = shutdown_budget(deadline_ms, Utc::now().timestamp_millis());
        let forced = cancel.child_token();
        let timer = {
            let forced = forced.clone();
            tokio::spawn(async move {
                tokio::time::sleep(budget).await;
                forced.cancel();
            })
        };

        tokio::select! {
            () = self.pipeline.drain() => {}
            () = forced.cancelled() => warn!("Shutdown deadline reached while draining telemetry"),
        }
        report(self.harvester.dispatch(&forced, &self.identity, true).await);
        timer.abort();
        info!("Extension shut down");
    }
}

/// Time left before `deadline_ms`, minus [`SHUTDOWN_MARGIN`].
#[must_use]
pub fn shutdown_budget(deadline_ms: i64, now_ms: i64) -> Duration {
    let remaining = u64::try_from(deadline_ms.saturating_sub(now_ms)).unwrap_or(0);
    Duration::from_millis(remaining).saturating_sub(SHUTDOWN_MARGIN)
}

fn report(result: Result<DispatchResult, HarvestError>) {
    match result {
        Ok(result) if result.attempted > 0 => {
            debug!("Delivered {} telemetry payloads", result.succeeded);
        }
        Ok(_) => {}
        // Chunk failures were logged by the dispatcher as they happened.
        Err(e @ HarvestError::Delivery(_)) => error!("{e}"),
        Err(e) => error!("Harvest failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_budget() {
        assert_eq!(shutdown_budget(2_000, 1_000), Duration::from_millis(800));
        assert_eq!(shutdown_budget(1_100, 1_000), Duration::ZERO);
        assert_eq!(shutdown_budget(500, 1_000), Duration::ZERO);
    }
}
