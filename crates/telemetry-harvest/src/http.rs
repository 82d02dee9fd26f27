// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Outbound HTTP client shared by delivery and credential lookup.

use core::time::Duration;

use tracing::error;

use crate::config::Config;

/// Builds the process-wide client. An invalid proxy is logged and the client falls back to
/// a direct connection.
#[must_use]
pub fn get_client(config: &Config) -> reqwest::Client {
    match build_client(config, true) {
        Ok(client) => client,
        Err(e) => {
            error!("Unable to parse proxy configuration: {e}, falling back to direct connection");
            match build_client(config, false) {
                Ok(client) => client,
                Err(inner) => {
                    error!("Failed to build HTTP client without proxy: {inner}, using reqwest defaults");
                    reqwest::Client::new()
                }
            }
        }
    }
}

fn build_client(config: &Config, allow_proxy: bool) -> Result<reqwest::Client, reqwest::Error> {
    let mut client = reqwest::Client::builder()
        .use_rustls_tls()
        .pool_idle_timeout(Some(Duration::from_secs(270)))
        .tcp_keepalive(Some(Duration::from_secs(120)))
        .user_agent(format!(
            "{}/{}",
            crate::EXTENSION_NAME,
            crate::EXTENSION_VERSION
        ));

    if allow_proxy {
        if let Some(https_uri) = &config.proxy_https {
            client = client.proxy(reqwest::Proxy::https(https_uri.clone())?);
        }
    }

    client.build()
}
