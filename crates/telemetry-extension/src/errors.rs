// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Failure talking to the Lambda Extensions or Telemetry API.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered [{status}] {body}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("response from {url} is missing the {header} header")]
    MissingHeader { url: String, header: &'static str },
    #[error("failed to decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        let err = ApiError::Status {
            url: "http://127.0.0.1:9001/2020-01-01/extension/register".to_string(),
            status: reqwest::StatusCode::FORBIDDEN,
            body: "{\"errorType\":\"Extension.Forbidden\"}".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "http://127.0.0.1:9001/2020-01-01/extension/register answered [403 Forbidden] {\"errorType\":\"Extension.Forbidden\"}"
        );
    }
}
