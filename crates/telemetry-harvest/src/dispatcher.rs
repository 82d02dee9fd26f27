// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! One harvest cycle: decode, build, split and deliver.
//!
//! Every chunk of every signal is sent by its own task. Tasks report into a shared failure
//! list and the dispatcher waits for all of them before returning, so a slow or failing
//! delivery never holds back its siblings.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::batch::Invocation;
use crate::client::DeliveryClient;
use crate::credential::CredentialFactory;
use crate::endpoints::{Endpoints, SignalType};
use crate::errors::{DeliveryError, HarvestError, SplitError};
use crate::payload::{self, build_payloads, FunctionIdentity};
use crate::record::{decode_chunk, InvocationRecord};
use crate::splitter::{split, CompressedChunk};

/// A chunk that could not be delivered.
#[derive(Debug)]
pub struct ChunkFailure {
    pub signal: SignalType,
    pub chunk_index: usize,
    pub error: DeliveryError,
}

/// Summary of one dispatch.
#[derive(Debug, Default)]
pub struct DispatchResult {
    pub attempted: usize,
    pub succeeded: usize,
    pub failures: Vec<ChunkFailure>,
}

impl DispatchResult {
    /// Chunks that did not succeed, including tasks that died before reporting.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.attempted.saturating_sub(self.succeeded)
    }
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    client: DeliveryClient,
    credentials: Arc<CredentialFactory>,
    endpoints: Endpoints,
    max_payload_bytes: usize,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        client: DeliveryClient,
        credentials: Arc<CredentialFactory>,
        endpoints: Endpoints,
        max_payload_bytes: usize,
    ) -> Self {
        Self {
            client,
            credentials,
            endpoints,
            max_payload_bytes,
        }
    }

    /// Ships everything in `harvested`. Returns an error if the payloads could not be built or
    /// if any chunk failed; successful chunks are never re-sent.
    pub async fn dispatch(
        &self,
        cancel: &CancellationToken,
        harvested: Vec<Invocation>,
        identity: &FunctionIdentity,
    ) -> Result<DispatchResult, HarvestError> {
        let records = flatten(harvested);
        if records.is_empty() {
            return Ok(DispatchResult::default());
        }

        let started = Instant::now();
        let payloads = build_payloads(&records, identity)?;
        let credential = self.credentials.get_credential().await?;
        let compression = self.client.compression();
        let limit = self.max_payload_bytes;

        let mut deliveries: Vec<(SignalType, Vec<CompressedChunk>)> = Vec::with_capacity(4);
        deliveries.push((
            SignalType::Logging,
            split(&payloads.logging, limit, compression, |entries| {
                serde_json::to_vec(entries)
            })
            .map_err(split_failed(SignalType::Logging))?,
        ));
        deliveries.push((
            SignalType::Metrics,
            split(&payloads.metrics, limit, compression, |metrics| {
                serde_json::to_vec(&payload::metrics_envelope(metrics))
            })
            .map_err(split_failed(SignalType::Metrics))?,
        ));
        if self.endpoints.url(SignalType::Events).is_some() {
            deliveries.push((
                SignalType::Events,
                split(&payloads.events, limit, compression, |events| {
                    serde_json::to_vec(events)
                })
                .map_err(split_failed(SignalType::Events))?,
            ));
        } else if !payloads.events.is_empty() {
            warn!(
                "No account id configured, skipping {} events",
                payloads.events.len()
            );
        }
        deliveries.push((
            SignalType::Traces,
            split(&payloads.traces, limit, compression, |spans| {
                serde_json::to_vec(&payload::traces_envelope(spans, &identity.name))
            })
            .map_err(split_failed(SignalType::Traces))?,
        ));

        let failures = Arc::new(Mutex::new(Vec::new()));
        let succeeded = Arc::new(AtomicUsize::new(0));
        let mut tasks = JoinSet::new();
        let mut attempted = 0;

        for (signal, chunks) in deliveries {
            let Some(url) = self.endpoints.url(signal) else {
                continue;
            };
            for (chunk_index, chunk) in chunks.into_iter().enumerate() {
                attempted += 1;
                let client = self.client.clone();
                let cancel = cancel.clone();
                let url = url.to_string();
                let credential = credential.to_string();
                let failures = Arc::clone(&failures);
                let succeeded = Arc::clone(&succeeded);
                tasks.spawn(async move {
                    let records = chunk.records.len();
                    match client
                        .send(&cancel, &url, &credential, signal, chunk.body)
                        .await
                    {
                        Ok(()) => {
                            succeeded.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(error) => {
                            error!(
                                "Failed to send {signal} chunk {chunk_index} ({records} records): {error}"
                            );
                            failures
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .push(ChunkFailure {
                                    signal,
                                    chunk_index,
                                    error,
                                });
                        }
                    }
                });
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Delivery task did not complete: {e}");
            }
        }

        let result = DispatchResult {
            attempted,
            succeeded: succeeded.load(Ordering::Relaxed),
            failures: std::mem::take(&mut *failures.lock().unwrap_or_else(PoisonError::into_inner)),
        };
        debug!(
            "Dispatched {} records in {} chunks ({} failed) in {} ms",
            records.len(),
            result.attempted,
            result.failed(),
            started.elapsed().as_millis()
        );

        if result.failed() > 0 {
            return Err(HarvestError::Delivery(result));
        }
        Ok(result)
    }
}

fn split_failed(signal: SignalType) -> impl FnOnce(SplitError) -> HarvestError {
    move |source| HarvestError::Split { signal, source }
}

/// Decodes every chunk of every invocation into records, keeping arrival order. Chunks that
/// are not valid Telemetry API bodies are dropped.
fn flatten(harvested: Vec<Invocation>) -> Vec<InvocationRecord> {
    let mut records = Vec::new();
    for invocation in harvested {
        for chunk in &invocation.telemetry {
            match decode_chunk(chunk) {
                Ok(decoded) => records.extend(decoded.into_iter().map(|record| {
                    InvocationRecord {
                        request_id: invocation.request_id.clone(),
                        record,
                    }
                })),
                Err(e) => error!(
                    "Skipping malformed telemetry chunk of {} bytes for {}: {e}",
                    chunk.len(),
                    invocation.request_id
                ),
            }
        }
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compressor::Compression;
    use crate::endpoints::EndpointOverrides;
    use chrono::Utc;
    use serde_json::json;
    use std::io::Read;
    use std::time::Duration;
    use tracing_test::traced_test;

    fn invocation(request_id: &str, chunks: Vec<serde_json::Value>) -> Invocation {
        let mut invocation = Invocation::new(request_id, Utc::now());
        invocation.telemetry = chunks.iter().map(|c| c.to_string().into_bytes()).collect();
        invocation
    }

    fn report_chunk() -> serde_json::Value {
        json!([{
            "time": "2024-01-01T00:00:00Z",
            "type": "platform.report",
            "record": {
                "requestId": "req-1",
                "metrics": {"durationMs": 12.5},
                "spans": [{"start": "2024-01-01T00:00:00Z", "durationMs": 5, "name": "responseLatency"}]
            }
        }])
    }

    fn dispatcher(server_url: &str, account_id: Option<&str>, max_payload_bytes: usize) -> Dispatcher {
        let overrides = EndpointOverrides {
            logging: Some(format!("{server_url}/log/v1")),
            metrics: Some(format!("{server_url}/metric/v1")),
            events: Some(format!("{server_url}/events")),
            traces: Some(format!("{server_url}/trace/v1")),
        };
        Dispatcher::new(
            DeliveryClient::new(
                reqwest::Client::new(),
                Duration::from_secs(2),
                Compression::default(),
            ),
            Arc::new(CredentialFactory::new_from_static_key("license")),
            Endpoints::resolve("license", account_id, &overrides),
            max_payload_bytes,
        )
    }

    #[tokio::test]
    async fn test_partial_failure_is_isolated() {
        let mut server = mockito::Server::new_async().await;
        let logs = server
            .mock("POST", "/log/v1")
            .with_status(202)
            .expect(1)
            .create_async()
            .await;
        let metrics = server
            .mock("POST", "/metric/v1")
            .with_status(202)
            .expect(1)
            .create_async()
            .await;
        let traces = server
            .mock("POST", "/trace/v1")
            .with_status(500)
            .with_body("boom")
            .expect(1)
            .create_async()
            .await;

        let result = dispatcher(&server.url(), None, 1_000_000)
            .dispatch(
                &CancellationToken::new(),
                vec![invocation("req-1", vec![report_chunk()])],
                &FunctionIdentity::new("fn", "arn:fn"),
            )
            .await;

        let Err(HarvestError::Delivery(result)) = result else {
            panic!("expected a delivery error");
        };
        assert_eq!(result.attempted, 3);
        assert_eq!(result.succeeded, 2);
        assert_eq!(result.failed(), 1);
        assert_eq!(result.failures[0].signal, SignalType::Traces);
        assert_eq!(result.failures[0].chunk_index, 0);
        assert_eq!(
            result.failures[0].error.status(),
            Some(reqwest::StatusCode::INTERNAL_SERVER_ERROR)
        );
        logs.assert_async().await;
        metrics.assert_async().await;
        traces.assert_async().await;
    }

    #[tokio::test]
    async fn test_all_signals_delivered() {
        let mut server = mockito::Server::new_async().await;
        let mut mocks = Vec::new();
        for path in ["/log/v1", "/metric/v1", "/events", "/trace/v1"] {
            mocks.push(
                server
                    .mock("POST", path)
                    .with_status(202)
                    .expect(1)
                    .create_async()
                    .await,
            );
        }

        let result = dispatcher(&server.url(), Some("42"), 1_000_000)
            .dispatch(
                &CancellationToken::new(),
                vec![invocation("req-1", vec![report_chunk()])],
                &FunctionIdentity::new("fn", "arn:fn"),
            )
            .await
            .expect("dispatch failed");

        assert_eq!(result.attempted, 4);
        assert_eq!(result.failed(), 0);
        for mock in mocks {
            mock.assert_async().await;
        }
    }

    #[tokio::test]
    async fn test_empty_harvest_sends_nothing() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", mockito::Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let result = dispatcher(&server.url(), Some("42"), 1_000_000)
            .dispatch(
                &CancellationToken::new(),
                vec![Invocation::new("req-1", Utc::now())],
                &FunctionIdentity::default(),
            )
            .await
            .expect("dispatch failed");

        assert_eq!(result.attempted, 0);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_build_error_aborts_cycle() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", mockito::Matcher::Any)
            .expect(0)
            .create_async()
            .await;
        let chunk = json!([
            {"time": "2024-01-01T00:00:00Z", "type": "function", "record": "fine"},
            {"time": "garbage", "type": "function", "record": "broken"}
        ]);

        let result = dispatcher(&server.url(), Some("42"), 1_000_000)
            .dispatch(
                &CancellationToken::new(),
                vec![invocation("req-1", vec![chunk])],
                &FunctionIdentity::default(),
            )
            .await;

        assert!(matches!(result, Err(HarvestError::Build(_))));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_logs_are_split_to_fit() {
        let mut server = mockito::Server::new_async().await;
        let logs = server
            .mock("POST", "/log/v1")
            .with_status(202)
            .expect_at_least(2)
            .create_async()
            .await;
        let events = server
            .mock("POST", "/events")
            .with_status(202)
            .expect_at_least(1)
            .create_async()
            .await;

        let records: Vec<_> = (0..80)
            .map(|i| {
                json!({
                    "time": "2024-01-01T00:00:00Z",
                    "type": "function",
                    "record": format!("line {i} {}", uuid::Uuid::new_v4())
                })
            })
            .collect();

        let result = dispatcher(&server.url(), Some("42"), 600)
            .dispatch(
                &CancellationToken::new(),
                vec![invocation("req-1", vec![json!(records)])],
                &FunctionIdentity::new("fn", "arn:fn"),
            )
            .await
            .expect("dispatch failed");

        assert!(result.attempted >= 3);
        logs.assert_async().await;
        events.assert_async().await;
    }

    #[tokio::test]
    async fn test_metrics_and_traces_split_with_envelope_per_chunk() {
        fn gunzip(body: &[u8]) -> serde_json::Value {
            let mut raw = Vec::new();
            flate2::read::GzDecoder::new(body)
                .read_to_end(&mut raw)
                .expect("gunzip failed");
            serde_json::from_slice(&raw).expect("body is not json")
        }

        let mut server = mockito::Server::new_async().await;
        let mut captured = Vec::new();
        for path in ["/metric/v1", "/trace/v1"] {
            let bodies = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&bodies);
            server
                .mock("POST", path)
                .with_status(202)
                .with_body_from_request(move |request| {
                    let body = request.body().expect("no body").clone();
                    sink.lock().expect("poisoned").push(body);
                    Vec::new()
                })
                .create_async()
                .await;
            captured.push(bodies);
        }
        let _logs = server
            .mock("POST", "/log/v1")
            .with_status(202)
            .create_async()
            .await;

        let metrics: serde_json::Map<String, serde_json::Value> = (0..60)
            .map(|i| (format!("m{i}.{}", uuid::Uuid::new_v4()), json!(i)))
            .collect();
        let spans: Vec<_> = (0..40)
            .map(|i| json!({"start": "2024-01-01T00:00:00Z", "name": format!("seg{i}")}))
            .collect();
        let chunk = json!([{
            "time": "2024-01-01T00:00:00Z",
            "type": "platform.report",
            "record": {"requestId": "req-1", "metrics": metrics, "spans": spans}
        }]);

        let result = dispatcher(&server.url(), None, 600)
            .dispatch(
                &CancellationToken::new(),
                vec![invocation("req-1", vec![chunk])],
                &FunctionIdentity::new("fn", "arn:fn"),
            )
            .await
            .expect("dispatch failed");
        assert_eq!(result.failed(), 0);

        let metric_bodies: Vec<_> = captured[0]
            .lock()
            .expect("poisoned")
            .iter()
            .map(|body| gunzip(body))
            .collect();
        assert!(metric_bodies.len() > 1);
        let mut metric_total = 0;
        for body in &metric_bodies {
            assert_eq!(body.as_array().map(Vec::len), Some(1));
            let series = body[0]["metrics"].as_array().expect("no metrics array");
            assert!(!series.is_empty());
            metric_total += series.len();
        }
        assert_eq!(metric_total, 60);

        let trace_bodies: Vec<_> = captured[1]
            .lock()
            .expect("poisoned")
            .iter()
            .map(|body| gunzip(body))
            .collect();
        assert!(trace_bodies.len() > 1);
        let mut span_total = 0;
        for body in &trace_bodies {
            assert_eq!(body.as_array().map(Vec::len), Some(1));
            assert_eq!(
                body[0]["common"]["attributes"],
                json!({"host": "aws.amazon.com", "service.name": "fn"})
            );
            span_total += body[0]["spans"].as_array().expect("no spans array").len();
        }
        assert_eq!(span_total, 40);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_malformed_chunk_is_skipped() {
        let mut server = mockito::Server::new_async().await;
        let logs = server
            .mock("POST", "/log/v1")
            .with_status(202)
            .expect(1)
            .create_async()
            .await;

        let mut harvested = invocation(
            "req-1",
            vec![json!([{"time": "2024-01-01T00:00:00Z", "type": "function", "record": "ok"}])],
        );
        harvested.telemetry.insert(0, b"{not json".to_vec());

        let result = dispatcher(&server.url(), None, 1_000_000)
            .dispatch(
                &CancellationToken::new(),
                vec![harvested],
                &FunctionIdentity::default(),
            )
            .await
            .expect("dispatch failed");

        assert_eq!(result.attempted, 1);
        assert!(logs_contain("Skipping malformed telemetry chunk"));
        assert!(logs_contain("No account id configured, skipping 1 events"));
        logs.assert_async().await;
    }

    #[tokio::test]
    async fn test_cancelled_dispatch_reports_failures() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = dispatcher("http://127.0.0.1:1", None, 1_000_000)
            .dispatch(
                &cancel,
                vec![invocation("req-1", vec![report_chunk()])],
                &FunctionIdentity::default(),
            )
            .await;

        let Err(HarvestError::Delivery(result)) = result else {
            panic!("expected a delivery error");
        };
        assert_eq!(result.failed(), 3);
        assert!(result
            .failures
            .iter()
            .all(|f| matches!(f.error, DeliveryError::Cancelled)));
    }
}
