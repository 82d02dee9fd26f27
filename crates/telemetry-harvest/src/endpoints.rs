// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

/// Ingest signal a payload is destined for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalType {
    Events,
    Logging,
    Metrics,
    Traces,
}

impl SignalType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::Events => "events",
            SignalType::Logging => "logging",
            SignalType::Metrics => "metrics",
            SignalType::Traces => "traces",
        }
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const US_LOG_ENDPOINT: &str = "https://log-api.newrelic.com/log/v1";
const EU_LOG_ENDPOINT: &str = "https://log-api.eu.newrelic.com/log/v1";
const US_METRIC_ENDPOINT: &str = "https://metric-api.newrelic.com/metric/v1";
const EU_METRIC_ENDPOINT: &str = "https://metric-api.eu.newrelic.com/metric/v1";
const US_EVENT_HOST: &str = "https://insights-collector.newrelic.com";
const EU_EVENT_HOST: &str = "https://insights-collector.eu01.nr-data.net";
const US_TRACE_ENDPOINT: &str = "https://trace-api.newrelic.com/trace/v1";
const EU_TRACE_ENDPOINT: &str = "https://trace-api.eu.newrelic.com/trace/v1";

/// Explicit per-signal URLs taking precedence over the region defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointOverrides {
    pub logging: Option<String>,
    pub metrics: Option<String>,
    pub events: Option<String>,
    pub traces: Option<String>,
}

/// Resolved ingest URLs. Events stay unset without an account id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    logging: String,
    metrics: String,
    events: Option<String>,
    traces: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Us,
    Eu,
}

impl Region {
    /// EU license keys carry an `eu` prefix.
    #[must_use]
    pub fn from_credential(credential: &str) -> Self {
        if credential
            .get(..2)
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case("eu"))
        {
            Region::Eu
        } else {
            Region::Us
        }
    }
}

impl Endpoints {
    #[must_use]
    pub fn resolve(
        credential: &str,
        account_id: Option<&str>,
        overrides: &EndpointOverrides,
    ) -> Self {
        let region = Region::from_credential(credential);
        let pick = |explicit: &Option<String>, us: &str, eu: &str| {
            explicit.clone().unwrap_or_else(|| {
                match region {
                    Region::Us => us,
                    Region::Eu => eu,
                }
                .to_string()
            })
        };

        let events = account_id.filter(|id| !id.is_empty()).map(|account| {
            overrides.events.clone().unwrap_or_else(|| {
                let host = match region {
                    Region::Us => US_EVENT_HOST,
                    Region::Eu => EU_EVENT_HOST,
                };
                format!("{host}/v1/accounts/{account}/events")
            })
        });

        Self {
            logging: pick(&overrides.logging, US_LOG_ENDPOINT, EU_LOG_ENDPOINT),
            metrics: pick(&overrides.metrics, US_METRIC_ENDPOINT, EU_METRIC_ENDPOINT),
            events,
            traces: pick(&overrides.traces, US_TRACE_ENDPOINT, EU_TRACE_ENDPOINT),
        }
    }

    #[must_use]
    pub fn url(&self, signal: SignalType) -> Option<&str> {
        match signal {
            SignalType::Logging => Some(&self.logging),
            SignalType::Metrics => Some(&self.metrics),
            SignalType::Events => self.events.as_deref(),
            SignalType::Traces => Some(&self.traces),
        }
    }
}
