// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::compressor::Compression;
use crate::endpoints::SignalType;
use crate::errors::DeliveryError;

pub const CREDENTIAL_HEADER: &str = "Api-Key";
const DATA_FORMAT_HEADER: &str = "Data-Format";
const DATA_FORMAT_VERSION_HEADER: &str = "Data-Format-Version";

/// Single-attempt POST of one compressed chunk to an ingest endpoint.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    timeout: Duration,
    compression: Compression,
}

impl DeliveryClient {
    #[must_use]
    pub fn new(client: reqwest::Client, timeout: Duration, compression: Compression) -> Self {
        Self {
            client,
            timeout,
            compression,
        }
    }

    #[must_use]
    pub fn compression(&self) -> Compression {
        self.compression
    }

    fn headers(&self, credential: &str, signal: SignalType) -> Result<HeaderMap, DeliveryError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            CONTENT_ENCODING,
            HeaderValue::from_static(self.compression.content_encoding()),
        );
        headers.insert(
            CREDENTIAL_HEADER,
            HeaderValue::from_str(credential).map_err(|_| DeliveryError::InvalidCredential)?,
        );
        if signal == SignalType::Traces {
            headers.insert(DATA_FORMAT_HEADER, HeaderValue::from_static("newrelic"));
            headers.insert(DATA_FORMAT_VERSION_HEADER, HeaderValue::from_static("1"));
        }
        Ok(headers)
    }

    /// Sends `body` once. Transport failures, statuses of 300 and above, the per-call timeout
    /// and `cancel` firing are all errors.
    pub async fn send(
        &self,
        cancel: &CancellationToken,
        url: &str,
        credential: &str,
        signal: SignalType,
        body: Vec<u8>,
    ) -> Result<(), DeliveryError> {
        let started = Instant::now();
        let size = body.len();
        let request = self
            .client
            .post(url)
            .timeout(self.timeout)
            .headers(self.headers(credential, signal)?)
            .body(body);

        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(DeliveryError::Cancelled),
            response = request.send() => response.map_err(|source| DeliveryError::Transport {
                url: url.to_string(),
                source,
            })?,
        };

        let status = response.status();
        if status.as_u16() >= 300 {
            let body = response.text().await.unwrap_or_default();
            return Err(DeliveryError::Status { status, body });
        }
        debug!(
            "Sent {size} byte {signal} payload to {url} in {} ms, status {status}",
            started.elapsed().as_millis()
        );
        Ok(())
    }
}
