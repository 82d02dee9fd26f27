// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

use crate::dispatcher::DispatchResult;
use crate::endpoints::SignalType;

/// Failure of the compressor itself. Encoding into an in-memory buffer only fails on
/// encoder setup, so this is rare in practice.
#[derive(Debug, Error)]
#[error("failed to compress payload: {0}")]
pub struct CompressError(#[from] pub std::io::Error);

/// A harvested record could not be shaped into payloads. Aborts the whole harvest cycle.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("invalid timestamp {value:?} on {record_type} record: {source}")]
    RecordTimestamp {
        record_type: String,
        value: String,
        #[source]
        source: chrono::ParseError,
    },
    #[error("invalid span start {value:?} on {record_type} record: {source}")]
    SpanStart {
        record_type: String,
        value: String,
        #[source]
        source: chrono::ParseError,
    },
    #[error("span start on {record_type} record is not a string: {value}")]
    SpanStartType { record_type: String, value: String },
}

/// A built payload could not be turned into wire chunks.
#[derive(Debug, Error)]
pub enum SplitError {
    #[error("failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error(transparent)]
    Compress(#[from] CompressError),
}

/// Outcome of a single POST to an ingest endpoint.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("telemetry client error sending to {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("telemetry client response: [{status}] {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("delivery cancelled before the ingest responded")]
    Cancelled,
    #[error("credential is not a valid header value")]
    InvalidCredential,
}

impl DeliveryError {
    /// Status code returned by the ingest, if it answered at all.
    #[must_use]
    pub fn status(&self) -> Option<reqwest::StatusCode> {
        match self {
            DeliveryError::Status { status, .. } => Some(*status),
            DeliveryError::Transport { source, .. } => source.status(),
            DeliveryError::Cancelled | DeliveryError::InvalidCredential => None,
        }
    }
}

/// The license key could not be obtained. Fatal at startup.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("failed to reach the secrets cache: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("secrets cache answered [{status}] {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("failed to decode secret: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("secret does not contain a LicenseKey")]
    MissingLicenseKey,
}

/// Invalid environment configuration. Fatal at startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
    #[error("{name} must be greater than zero")]
    Zero { name: &'static str },
}

/// Error surfaced to the lifecycle driver for one harvest cycle.
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("failed to build telemetry payloads: {0}")]
    Build(#[from] BuildError),
    #[error("failed to resolve license key: {0}")]
    Credential(#[from] CredentialError),
    #[error("failed to prepare {signal} payload: {source}")]
    Split {
        signal: SignalType,
        #[source]
        source: SplitError,
    },
    #[error("{} of {} telemetry payloads failed to send", .0.failed(), .0.attempted)]
    Delivery(DispatchResult),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_error_display_carries_status_and_body() {
        let err = DeliveryError::Status {
            status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            body: "boom".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "telemetry client response: [500 Internal Server Error] boom"
        );
        assert_eq!(err.status(), Some(reqwest::StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[test]
    fn test_harvest_error_summarises_failures() {
        let result = DispatchResult {
            attempted: 3,
            succeeded: 2,
            failures: vec![],
        };
        assert_eq!(
            HarvestError::Delivery(result).to_string(),
            "1 of 3 telemetry payloads failed to send"
        );
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::Invalid {
            name: "NEW_RELIC_SEND_TIMEOUT_MS",
            value: "soon".to_string(),
            reason: "invalid digit found in string".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid value \"soon\" for NEW_RELIC_SEND_TIMEOUT_MS: invalid digit found in string"
        );
        assert_eq!(
            ConfigError::Zero {
                name: "NEW_RELIC_TELEMETRY_BATCH_SIZE_BYTES"
            }
            .to_string(),
            "NEW_RELIC_TELEMETRY_BATCH_SIZE_BYTES must be greater than zero"
        );
    }

    #[test]
    fn test_build_error_names_record() {
        let source = chrono::DateTime::parse_from_rfc3339("yesterday")
            .expect_err("not a timestamp");
        let err = BuildError::RecordTimestamp {
            record_type: "platform.start".to_string(),
            value: "yesterday".to_string(),
            source,
        };
        assert!(err.to_string().starts_with(
            "invalid timestamp \"yesterday\" on platform.start record"
        ));
    }
}
