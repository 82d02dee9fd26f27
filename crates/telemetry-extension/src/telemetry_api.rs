// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Telemetry API subscription and the local listener it pushes to.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::errors::ApiError;
use crate::extension_api::{check_status, EXTENSION_ID_HEADER};

const API_VERSION: &str = "2022-07-01";
const SCHEMA_VERSION: &str = "2022-12-13";
pub const MAX_ITEMS: u32 = 1_000;
pub const MAX_BYTES: u32 = 262_144;
pub const TIMEOUT_MS: u32 = 25;
/// Capacity of the queue between the listener and the batch.
pub const QUEUE_CAPACITY: usize = 64;
/// How long in-flight connections get to finish once the listener stops.
const CONNECTION_DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct TelemetryApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl TelemetryApiClient {
    #[must_use]
    pub fn new(client: reqwest::Client, runtime_api: &str) -> Self {
        Self::with_base_url(client, format!("http://{runtime_api}"))
    }

    #[must_use]
    pub fn with_base_url(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    /// Subscribes `destination` to platform, function and extension telemetry.
    pub async fn subscribe(&self, extension_id: &str, destination: &str) -> Result<(), ApiError> {
        let url = format!("{}/{API_VERSION}/telemetry", self.base_url);
        let body = json!({
            "schemaVersion": SCHEMA_VERSION,
            "types": ["platform", "function", "extension"],
            "buffering": {
                "maxItems": MAX_ITEMS,
                "maxBytes": MAX_BYTES,
                "timeoutMs": TIMEOUT_MS
            },
            "destination": {
                "protocol": "HTTP",
                "URI": destination
            }
        });
        let response = self
            .client
            .put(&url)
            .header(EXTENSION_ID_HEADER, extension_id)
            .json(&body)
            .send()
            .await
            .map_err(|source| ApiError::Transport {
                url: url.clone(),
                source,
            })?;
        check_status(&url, response).await?;
        debug!("Subscribed {destination} to the Telemetry API");
        Ok(())
    }
}

/// URI the host pushes telemetry to for a listener on `port`.
#[must_use]
pub fn destination_uri(port: u16) -> String {
    format!("http://sandbox.localdomain:{port}")
}

/// Local HTTP endpoint receiving Telemetry API pushes. Every POST body is queued as one raw
/// chunk; the queue is bounded so a slow consumer applies back-pressure to the host.
#[derive(Debug)]
pub struct TelemetryListener {
    listener: TcpListener,
    tx: mpsc::Sender<Vec<u8>>,
}

impl TelemetryListener {
    pub async fn bind(port: u16, tx: mpsc::Sender<Vec<u8>>) -> io::Result<Self> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = TcpListener::bind(&addr).await?;
        Ok(Self { listener, tx })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `cancel` fires. The queue sender is dropped on return, which
    /// lets the consumer drain and finish.
    pub async fn serve(self, cancel: CancellationToken) -> io::Result<()> {
        let Self { listener, tx } = self;
        let server = hyper::server::conn::http1::Builder::new();
        let mut joinset = tokio::task::JoinSet::new();

        loop {
            let conn = tokio::select! {
                () = cancel.cancelled() => break,
                con_res = listener.accept() => match con_res {
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::ConnectionAborted
                                | io::ErrorKind::ConnectionReset
                                | io::ErrorKind::ConnectionRefused
                        ) =>
                    {
                        continue;
                    }
                    Err(e) => {
                        error!("Telemetry listener error: {e}");
                        return Err(e);
                    }
                    Ok((conn, _)) => conn,
                },
                finished = async {
                    match joinset.join_next().await {
                        Some(finished) => finished,
                        None => std::future::pending().await,
                    }
                } => match finished {
                    Err(e) if e.is_panic() => {
                        error!("Telemetry connection handler panicked: {e:?}");
                        continue;
                    }
                    Ok(()) | Err(_) => continue,
                },
            };

            let conn = hyper_util::rt::TokioIo::new(conn);
            let server = server.clone();
            let tx = tx.clone();
            let service = service_fn(move |req| handle(req, tx.clone()));
            joinset.spawn(async move {
                if let Err(e) = server.serve_connection(conn, service).await {
                    debug!("Telemetry connection error: {e}");
                }
            });
        }

        let drained = tokio::time::timeout(CONNECTION_DRAIN_TIMEOUT, async {
            while joinset.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            debug!("Closing {} idle telemetry connections", joinset.len());
            joinset.shutdown().await;
        }
        debug!("Telemetry listener stopped");
        Ok(())
    }
}

async fn handle(
    req: Request<Incoming>,
    tx: mpsc::Sender<Vec<u8>>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    if req.method() != Method::POST {
        return Ok(respond(StatusCode::METHOD_NOT_ALLOWED));
    }
    let body = req.into_body().collect().await?.to_bytes();
    if !body.is_empty() && tx.send(body.to_vec()).await.is_err() {
        warn!("Telemetry queue closed, dropping {} bytes", body.len());
    }
    Ok(respond(StatusCode::OK))
}

fn respond(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}
