// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Client for the Lambda Extensions API (register and the next-event long poll).

use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::errors::ApiError;

pub const EXTENSION_NAME_HEADER: &str = "Lambda-Extension-Name";
pub const EXTENSION_ID_HEADER: &str = "Lambda-Extension-Identifier";
const API_VERSION: &str = "2020-01-01";

/// Lifecycle event returned by the next-event poll.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "eventType")]
pub enum NextEvent {
    #[serde(rename = "INVOKE")]
    Invoke {
        #[serde(rename = "deadlineMs")]
        deadline_ms: i64,
        #[serde(rename = "requestId")]
        request_id: String,
        #[serde(rename = "invokedFunctionArn")]
        invoked_function_arn: String,
    },
    #[serde(rename = "SHUTDOWN")]
    Shutdown {
        #[serde(rename = "shutdownReason")]
        shutdown_reason: String,
        #[serde(rename = "deadlineMs")]
        deadline_ms: i64,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    #[serde(default)]
    pub function_name: String,
    #[serde(default)]
    pub function_version: String,
    #[serde(default)]
    pub handler: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub extension_id: String,
    pub function: RegisterResponse,
}

#[derive(Debug, Clone)]
pub struct ExtensionApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl ExtensionApiClient {
    /// `runtime_api` is the `host:port` from `AWS_LAMBDA_RUNTIME_API`.
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

    /// Registers for INVOKE and SHUTDOWN events.
    pub async fn register(&self, extension_name: &str) -> Result<Registration, ApiError> {
        let url = format!("{}/{API_VERSION}/extension/register", self.base_url);
        let response = self
            .client
            .post(&url)
            .header(EXTENSION_NAME_HEADER, extension_name)
            .json(&json!({"events": ["INVOKE", "SHUTDOWN"]}))
            .send()
            .await
            .map_err(|source| ApiError::Transport {
                url: url.clone(),
                source,
            })?;
        let response = check_status(&url, response).await?;

        let extension_id = response
            .headers()
            .get(EXTENSION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| ApiError::MissingHeader {
                url: url.clone(),
                header: EXTENSION_ID_HEADER,
            })?;
        let function = response
            .json::<RegisterResponse>()
            .await
            .map_err(|source| ApiError::Decode {
                url: url.clone(),
                source,
            })?;
        debug!("Registered extension {extension_name} as {extension_id}");

        Ok(Registration {
            extension_id,
            function,
        })
    }

    /// Blocks until the host has the next lifecycle event for this extension.
    pub async fn next_event(&self, extension_id: &str) -> Result<NextEvent, ApiError> {
        let url = format!("{}/{API_VERSION}/extension/event/next", self.base_url);
        let response = self
            .client
            .get(&url)
            .header(EXTENSION_ID_HEADER, extension_id)
            .send()
            .await
            .map_err(|source| ApiError::Transport {
                url: url.clone(),
                source,
            })?;
        let response = check_status(&url, response).await?;
        response
            .json::<NextEvent>()
            .await
            .map_err(|source| ApiError::Decode { url, source })
    }
}

pub(crate) async fn check_status(
    url: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ApiError::Status {
        url: url.to_string(),
        status,
        body,
    })
}
