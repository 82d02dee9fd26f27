// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shapes harvested telemetry records into the four ingest signal payloads.
//!
//! Every record yields one [`Event`]. Records with a body also yield one [`LogEntry`], and
//! bodies that are keyed mappings fan out into one [`Metric`] per entry under `metrics` and
//! one [`Span`] per element of `spans`. Input order is preserved in every output sequence.
//!
//! Timestamps are parsed fail-fast: a malformed record time or span start aborts the whole
//! build so that a harvest cycle is never sent half-built.

use std::collections::BTreeMap;
use std::time::Instant;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::errors::BuildError;
use crate::record::{InvocationRecord, RawTelemetryRecord};
use crate::{EXTENSION_NAME, EXTENSION_VERSION, PLUGIN_ID};

/// Longest log message forwarded, in bytes (attribute limit plus blob allowance).
///
/// Longer messages are cut to exactly this length, or up to three bytes less when the cut
/// would otherwise split a multi-byte UTF-8 character.
pub const MAX_LOG_MESSAGE_LEN: usize = 4094 + 10_000;
/// Namespace prepended to every metric key found in a record body.
pub const METRIC_NAME_PREFIX: &str = "aws.telemetry.lambda_ext.";
pub const EVENT_TYPE: &str = "TelemetryApiEvent";
pub const TRACE_HOST: &str = "aws.amazon.com";

/// Name and ARN of the function the extension runs alongside.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionIdentity {
    pub name: String,
    pub arn: String,
}

impl FunctionIdentity {
    pub fn new(name: impl Into<String>, arn: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arn: arn.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    #[serde(rename = "eventType")]
    pub event_type: &'static str,
    pub timestamp: i64,
    #[serde(rename = "extension.name")]
    pub extension_name: &'static str,
    #[serde(rename = "extension.version")]
    pub extension_version: &'static str,
    #[serde(rename = "lambda.name")]
    pub lambda_name: String,
    /// Record type with `.` replaced, dots are not allowed in event attributes.
    #[serde(rename = "lambda.logevent.type")]
    pub log_event_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub timestamp: i64,
    pub message: String,
    pub attributes: LogAttributes,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogAttributes {
    pub plugin: &'static str,
    pub entity: LogEntity,
    pub faas: FaasAttributes,
    pub aws: AwsLogAttributes,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntity {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaasAttributes {
    pub arn: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AwsLogAttributes {
    #[serde(rename = "lambda.logevent.type")]
    pub log_event_type: String,
    #[serde(rename = "extension.name")]
    pub extension_name: &'static str,
    #[serde(rename = "extension.version")]
    pub extension_version: &'static str,
    #[serde(rename = "lambda.name")]
    pub lambda_name: String,
    #[serde(rename = "lambda.arn")]
    pub lambda_arn: String,
    #[serde(rename = "requestId")]
    pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metric {
    pub name: String,
    pub value: Value,
    pub timestamp: i64,
    pub attributes: MetricAttributes,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricAttributes {
    pub plugin: &'static str,
    #[serde(rename = "faas.arn")]
    pub faas_arn: String,
    #[serde(rename = "faas.name")]
    pub faas_name: String,
    #[serde(rename = "lambda.logevent.type")]
    pub log_event_type: String,
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(rename = "extension.name")]
    pub extension_name: &'static str,
    #[serde(rename = "extension.version")]
    pub extension_version: &'static str,
    #[serde(rename = "lambda.name")]
    pub lambda_name: String,
}

/// Span attribute. Only `duration.ms` is numeric, everything else is carried as text.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Number(f64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Span {
    #[serde(rename = "trace.id")]
    pub trace_id: String,
    pub id: String,
    pub timestamp: i64,
    pub attributes: BTreeMap<String, AttributeValue>,
}

/// The four independent collections built from one harvest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignalPayloads {
    pub events: Vec<Event>,
    pub logging: Vec<LogEntry>,
    pub metrics: Vec<Metric>,
    pub traces: Vec<Span>,
}

/// Metric API envelope: `[{"metrics": [...]}]`.
#[derive(Debug, Serialize)]
pub struct MetricsEnvelope<'a> {
    pub metrics: &'a [Metric],
}

/// Trace API envelope: `[{"common": {...}, "spans": [...]}]`.
#[derive(Debug, Serialize)]
pub struct TracesEnvelope<'a> {
    pub common: TracesCommon<'a>,
    pub spans: &'a [Span],
}

#[derive(Debug, Serialize)]
pub struct TracesCommon<'a> {
    pub attributes: TracesCommonAttributes<'a>,
}

#[derive(Debug, Serialize)]
pub struct TracesCommonAttributes<'a> {
    pub host: &'static str,
    #[serde(rename = "service.name")]
    pub service_name: &'a str,
}

#[must_use]
pub fn metrics_envelope(metrics: &[Metric]) -> [MetricsEnvelope<'_>; 1] {
    [MetricsEnvelope { metrics }]
}

#[must_use]
pub fn traces_envelope<'a>(spans: &'a [Span], function_name: &'a str) -> [TracesEnvelope<'a>; 1] {
    [TracesEnvelope {
        common: TracesCommon {
            attributes: TracesCommonAttributes {
                host: TRACE_HOST,
                service_name: function_name,
            },
        },
        spans,
    }]
}

/// Builds the four signal payloads, in input order, from harvested records.
pub fn build_payloads(
    entries: &[InvocationRecord],
    identity: &FunctionIdentity,
) -> Result<SignalPayloads, BuildError> {
    let started = Instant::now();
    let mut payloads = SignalPayloads::default();

    for entry in entries {
        let record = &entry.record;
        let timestamp =
            parse_millis(&record.time).map_err(|source| BuildError::RecordTimestamp {
                record_type: record.record_type.clone(),
                value: record.time.clone(),
                source,
            })?;

        payloads.events.push(Event {
            event_type: EVENT_TYPE,
            timestamp,
            extension_name: EXTENSION_NAME,
            extension_version: EXTENSION_VERSION,
            lambda_name: identity.name.clone(),
            log_event_type: record.record_type.replace('.', "_"),
        });

        let Some(body) = &record.record else {
            continue;
        };
        payloads.logging.push(LogEntry {
            timestamp,
            message: truncate_message(render_body(body)),
            attributes: LogAttributes {
                plugin: PLUGIN_ID,
                entity: LogEntity {
                    name: identity.name.clone(),
                },
                faas: FaasAttributes {
                    arn: identity.arn.clone(),
                    name: identity.name.clone(),
                },
                aws: AwsLogAttributes {
                    log_event_type: record.record_type.clone(),
                    extension_name: EXTENSION_NAME,
                    extension_version: EXTENSION_VERSION,
                    lambda_name: identity.name.clone(),
                    lambda_arn: identity.arn.clone(),
                    request_id: entry.request_id.clone(),
                },
            },
        });

        let Some(fields) = record.body_map() else {
            continue;
        };
        // Platform records name their own request; fall back to the invocation it was
        // collected under.
        let request_id = fields
            .get("requestId")
            .and_then(Value::as_str)
            .unwrap_or(&entry.request_id);

        if let Some(metrics) = fields.get("metrics").and_then(Value::as_object) {
            for (key, value) in metrics {
                payloads.metrics.push(Metric {
                    name: format!("{METRIC_NAME_PREFIX}{key}"),
                    value: value.clone(),
                    timestamp,
                    attributes: MetricAttributes {
                        plugin: PLUGIN_ID,
                        faas_arn: identity.arn.clone(),
                        faas_name: identity.name.clone(),
                        log_event_type: record.record_type.clone(),
                        request_id: request_id.to_string(),
                        extension_name: EXTENSION_NAME,
                        extension_version: EXTENSION_VERSION,
                        lambda_name: identity.name.clone(),
                    },
                });
            }
        }

        if let Some(spans) = fields.get("spans").and_then(Value::as_array) {
            for span in spans {
                let Some(span_fields) = span.as_object() else {
                    trace!("Skipping non-object span on {} record", record.record_type);
                    continue;
                };
                payloads
                    .traces
                    .push(build_span(span_fields, record, timestamp, request_id)?);
            }
        }
    }

    debug!(
        "Built {} events, {} logs, {} metrics and {} spans in {:?}",
        payloads.events.len(),
        payloads.logging.len(),
        payloads.metrics.len(),
        payloads.traces.len(),
        started.elapsed()
    );
    Ok(payloads)
}

fn build_span(
    fields: &Map<String, Value>,
    record: &RawTelemetryRecord,
    record_timestamp: i64,
    trace_id: &str,
) -> Result<Span, BuildError> {
    let mut attributes = BTreeMap::new();
    attributes.insert(
        "event".to_string(),
        AttributeValue::Text(record.record_type.clone()),
    );
    attributes.insert(
        "service.name".to_string(),
        AttributeValue::Text(EXTENSION_NAME.to_string()),
    );

    let mut timestamp = record_timestamp;
    for (key, value) in fields {
        match key.as_str() {
            "start" => {
                let Some(start) = value.as_str() else {
                    return Err(BuildError::SpanStartType {
                        record_type: record.record_type.clone(),
                        value: value.to_string(),
                    });
                };
                timestamp = parse_millis(start).map_err(|source| BuildError::SpanStart {
                    record_type: record.record_type.clone(),
                    value: start.to_string(),
                    source,
                })?;
            }
            "durationMs" => {
                let attribute = match value.as_f64() {
                    Some(duration) => AttributeValue::Number(duration),
                    None => AttributeValue::Text(render_body(value)),
                };
                attributes.insert("duration.ms".to_string(), attribute);
            }
            _ => {
                attributes.insert(key.clone(), AttributeValue::Text(render_body(value)));
            }
        }
    }

    Ok(Span {
        trace_id: trace_id.to_string(),
        id: uuid::Uuid::new_v4().to_string(),
        timestamp,
        attributes,
    })
}

fn parse_millis(value: &str) -> Result<i64, chrono::ParseError> {
    chrono::DateTime::parse_from_rfc3339(value).map(|time| time.timestamp_millis())
}

/// Strings are forwarded verbatim, anything else as compact JSON.
fn render_body(body: &Value) -> String {
    match body {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Cuts `message` to at most [`MAX_LOG_MESSAGE_LEN`] bytes on a character boundary.
fn truncate_message(mut message: String) -> String {
    if message.len() > MAX_LOG_MESSAGE_LEN {
        let mut end = MAX_LOG_MESSAGE_LEN;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        message.truncate(end);
    }
    message
}
