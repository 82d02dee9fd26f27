// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::compressor::Compression;
use crate::endpoints::EndpointOverrides;
use crate::errors::ConfigError;
use crate::splitter::DEFAULT_MAX_PAYLOAD_BYTES;

pub const DEFAULT_BATCH_SIZE_BYTES: usize = 1_000_000;
pub const DEFAULT_BATCH_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_LISTENER_PORT: u16 = 4243;
pub const DEFAULT_LICENSE_KEY_SECRET: &str = "NEW_RELIC_LICENSE_KEY";
pub const LOG_LEVEL_VAR: &str = "NEW_RELIC_EXTENSION_LOG_LEVEL";

/// Extension log verbosity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`.
    #[must_use]
    pub fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    /// Reads the level from the environment, falling back to the default on a bad value.
    /// Used before the subscriber exists, so it never logs.
    #[must_use]
    pub fn from_env() -> Self {
        env::var(LOG_LEVEL_VAR)
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or_default()
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(format!(
                "Invalid log level: '{s}'. Valid levels are: error, warn, info, debug, trace",
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// License key given directly; when unset it is looked up in the secrets cache.
    pub license_key: Option<String>,
    pub license_key_secret: String,
    /// Required for event delivery.
    pub account_id: Option<String>,
    pub batch_size_bytes: usize,
    pub batch_interval: Duration,
    /// Per-request delivery timeout.
    pub send_timeout: Duration,
    pub endpoints: EndpointOverrides,
    pub compression: Compression,
    pub log_level: LogLevel,
    pub listener_port: u16,
    pub proxy_https: Option<String>,
    /// Max compressed body size of one request.
    pub max_payload_bytes: usize,
    /// When false, pushed telemetry is drained from the queue and dropped.
    pub collect_agent_data: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            license_key: None,
            license_key_secret: DEFAULT_LICENSE_KEY_SECRET.to_string(),
            account_id: None,
            batch_size_bytes: DEFAULT_BATCH_SIZE_BYTES,
            batch_interval: Duration::from_millis(DEFAULT_BATCH_INTERVAL_MS),
            send_timeout: Duration::from_millis(DEFAULT_SEND_TIMEOUT_MS),
            endpoints: EndpointOverrides::default(),
            compression: Compression::default(),
            log_level: LogLevel::default(),
            listener_port: DEFAULT_LISTENER_PORT,
            proxy_https: None,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            collect_agent_data: true,
        }
    }
}

/// Non-empty value of `name`.
fn var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn parse_var<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match var(name) {
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
            value,
        }),
        None => Ok(default),
    }
}

fn parse_flag(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match var(name) {
        Some(value) => match value.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(ConfigError::Invalid {
                name,
                value,
                reason: "expected true or false".to_string(),
            }),
        },
        None => Ok(default),
    }
}

fn non_zero<T: PartialEq + Default>(name: &'static str, value: T) -> Result<T, ConfigError> {
    if value == T::default() {
        return Err(ConfigError::Zero { name });
    }
    Ok(value)
}

impl Config {
    pub fn from_env() -> Result<Config, ConfigError> {
        let log_level = match var(LOG_LEVEL_VAR) {
            Some(value) => value.parse().unwrap_or_else(|e| {
                warn!("{e}, using {}", LogLevel::default().as_directive());
                LogLevel::default()
            }),
            None => LogLevel::default(),
        };

        let batch_size_bytes = non_zero(
            "NEW_RELIC_TELEMETRY_BATCH_SIZE_BYTES",
            parse_var("NEW_RELIC_TELEMETRY_BATCH_SIZE_BYTES", DEFAULT_BATCH_SIZE_BYTES)?,
        )?;
        let batch_interval_ms = non_zero(
            "NEW_RELIC_TELEMETRY_BATCH_INTERVAL_MS",
            parse_var("NEW_RELIC_TELEMETRY_BATCH_INTERVAL_MS", DEFAULT_BATCH_INTERVAL_MS)?,
        )?;
        let send_timeout_ms = non_zero(
            "NEW_RELIC_SEND_TIMEOUT_MS",
            parse_var("NEW_RELIC_SEND_TIMEOUT_MS", DEFAULT_SEND_TIMEOUT_MS)?,
        )?;
        let max_payload_bytes = non_zero(
            "NEW_RELIC_MAX_PAYLOAD_BYTES",
            parse_var("NEW_RELIC_MAX_PAYLOAD_BYTES", DEFAULT_MAX_PAYLOAD_BYTES)?,
        )?;

        let mut compression: Compression =
            parse_var("NEW_RELIC_COMPRESSION", Compression::default())?;
        if var("NEW_RELIC_COMPRESSION_LEVEL").is_some() {
            compression = compression.with_level(parse_var("NEW_RELIC_COMPRESSION_LEVEL", 0)?);
        }

        Ok(Config {
            license_key: var("NEW_RELIC_LICENSE_KEY"),
            license_key_secret: var("NEW_RELIC_LICENSE_KEY_SECRET")
                .unwrap_or_else(|| DEFAULT_LICENSE_KEY_SECRET.to_string()),
            account_id: var("NEW_RELIC_ACCOUNT_ID"),
            batch_size_bytes,
            batch_interval: Duration::from_millis(batch_interval_ms),
            send_timeout: Duration::from_millis(send_timeout_ms),
            endpoints: EndpointOverrides {
                logging: var("NEW_RELIC_LOG_ENDPOINT"),
                metrics: var("NEW_RELIC_METRIC_ENDPOINT"),
                events: var("NEW_RELIC_EVENT_ENDPOINT"),
                traces: var("NEW_RELIC_TRACE_ENDPOINT"),
            },
            compression,
            log_level,
            listener_port: parse_var("NEW_RELIC_TELEMETRY_LISTENER_PORT", DEFAULT_LISTENER_PORT)?,
            proxy_https: var("NEW_RELIC_PROXY_HTTPS").or_else(|| var("HTTPS_PROXY")),
            max_payload_bytes,
            collect_agent_data: parse_flag("NEW_RELIC_COLLECT_AGENT_DATA", true)?,
        })
    }
}
