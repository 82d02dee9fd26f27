// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Raw records as pushed by the Lambda Telemetry API.
//!
//! Each POST body delivered to the local listener is a JSON array of
//! `{"time": "...", "type": "...", "record": ...}` objects. The record body is free-form:
//! a string for function/extension log lines, an object for platform events.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One event emitted by the host during an invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTelemetryRecord {
    /// RFC 3339 emission time.
    pub time: String,
    #[serde(rename = "type")]
    pub record_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<Value>,
}

impl RawTelemetryRecord {
    /// The record body when it is a keyed mapping, the only shape that can carry metrics
    /// and spans.
    #[must_use]
    pub fn body_map(&self) -> Option<&Map<String, Value>> {
        self.record.as_ref().and_then(Value::as_object)
    }
}

/// A record tagged with the invocation it was accumulated under.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationRecord {
    pub request_id: String,
    pub record: RawTelemetryRecord,
}

/// Decodes one Telemetry API POST body.
pub fn decode_chunk(bytes: &[u8]) -> Result<Vec<RawTelemetryRecord>, serde_json::Error> {
    serde_json::from_slice(bytes)
}
