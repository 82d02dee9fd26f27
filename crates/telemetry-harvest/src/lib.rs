// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Telemetry dispatch and harvest engine for a Lambda extension.
//!
//! Raw Telemetry API chunks are accumulated per invocation in a [`batch::Batch`], harvested
//! when a size or time threshold is reached (or unconditionally at shutdown), shaped into
//! per-signal payloads by [`payload::build_payloads`], split into compressed chunks that fit
//! the ingest limits and delivered concurrently by the [`dispatcher::Dispatcher`].

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod batch;
pub mod client;
pub mod compressor;
pub mod config;
pub mod credential;
pub mod dispatcher;
pub mod endpoints;
pub mod errors;
pub mod harvester;
pub mod http;
pub mod logger;
pub mod payload;
pub mod record;
pub mod splitter;

/// Name reported in every payload this extension produces.
pub const EXTENSION_NAME: &str = "newrelic-lambda-extension";
/// Version reported alongside [`EXTENSION_NAME`].
pub const EXTENSION_VERSION: &str = env!("CARGO_PKG_VERSION");
/// Plugin identifier attached to log and metric attributes.
pub const PLUGIN_ID: &str = "com.newrelic.lambda.extension";
