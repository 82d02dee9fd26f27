// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::fmt::Debug;
use std::sync::Arc;
use std::{future::Future, pin::Pin};

use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::errors::CredentialError;

const DEFAULT_SECRETS_PORT: u16 = 2773;
const SECRETS_TOKEN_HEADER: &str = "X-Aws-Parameters-Secrets-Token";

pub type CredentialResolverFn = Arc<
    dyn Fn() -> Pin<Box<dyn Future<Output = Result<String, CredentialError>> + Send>>
        + Send
        + Sync,
>;

/// Source of the ingest license key. A dynamic key is resolved once and cached.
#[derive(Clone)]
pub enum CredentialFactory {
    Static(String),
    Dynamic {
        resolver_fn: CredentialResolverFn,
        credential: Arc<OnceCell<String>>,
    },
}

impl CredentialFactory {
    pub fn new_from_resolver(resolver_fn: CredentialResolverFn) -> Self {
        Self::Dynamic {
            resolver_fn,
            credential: Arc::new(OnceCell::new()),
        }
    }

    pub fn new_from_static_key(credential: &str) -> Self {
        Self::Static(credential.to_string())
    }

    /// Resolves the license key. A failed resolution is not cached, so the next call retries.
    pub async fn get_credential(&self) -> Result<&str, CredentialError> {
        match self {
            Self::Static(credential) => Ok(credential.as_str()),
            Self::Dynamic {
                resolver_fn,
                credential,
            } => credential
                .get_or_try_init(|| async { (resolver_fn)().await })
                .await
                .map(String::as_str),
        }
    }
}

impl Debug for CredentialFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CredentialFactory")
    }
}

#[derive(Deserialize)]
struct SecretValue {
    #[serde(rename = "SecretString")]
    secret_string: String,
}

#[derive(Deserialize)]
struct LicenseKeySecret {
    #[serde(rename = "LicenseKey", default)]
    license_key: String,
}

/// Extracts the license key from a `{"LicenseKey": "..."}` secret string.
pub fn decode_license_key(secret_string: &str) -> Result<String, CredentialError> {
    let secret: LicenseKeySecret = serde_json::from_str(secret_string)?;
    if secret.license_key.is_empty() {
        return Err(CredentialError::MissingLicenseKey);
    }
    Ok(secret.license_key)
}

/// Client for the Lambda parameters and secrets extension cache.
#[derive(Debug, Clone)]
pub struct SecretsCache {
    client: reqwest::Client,
    base_url: String,
    session_token: String,
}

impl SecretsCache {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        session_token: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            session_token: session_token.into(),
        }
    }

    /// Cache on the port Lambda assigns it, authenticated with the sandbox session token.
    #[must_use]
    pub fn from_env(client: reqwest::Client) -> Self {
        let port = env::var("PARAMETERS_SECRETS_EXTENSION_HTTP_PORT")
            .ok()
            .and_then(|port| port.parse::<u16>().ok())
            .unwrap_or(DEFAULT_SECRETS_PORT);
        Self::new(
            client,
            format!("http://localhost:{port}"),
            env::var("AWS_SESSION_TOKEN").unwrap_or_default(),
        )
    }

    pub async fn license_key(&self, secret_id: &str) -> Result<String, CredentialError> {
        debug!("Fetching license key from secret {secret_id}");
        let response = self
            .client
            .get(format!("{}/secretsmanager/get", self.base_url))
            .query(&[("secretId", secret_id)])
            .header(SECRETS_TOKEN_HEADER, &self.session_token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CredentialError::Status { status, body });
        }
        let secret: SecretValue = response.json().await?;
        decode_license_key(&secret.secret_string)
    }

    /// Resolver that looks `secret_id` up on first use.
    #[must_use]
    pub fn resolver(self, secret_id: String) -> CredentialResolverFn {
        let cache = Arc::new(self);
        Arc::new(move || {
            let cache = Arc::clone(&cache);
            let secret_id = secret_id.clone();
            Box::pin(async move { cache.license_key(&secret_id).await })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_static_key() {
        let factory = CredentialFactory::new_from_static_key("mock-license-key");
        assert_eq!(
            factory.get_credential().await.expect("no credential"),
            "mock-license-key"
        );
    }

    #[tokio::test]
    async fn test_resolver_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let factory = CredentialFactory::new_from_resolver(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok("resolved-key".to_string()) })
        }));

        assert_eq!(factory.get_credential().await.expect("no key"), "resolved-key");
        assert_eq!(factory.get_credential().await.expect("no key"), "resolved-key");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_resolution_is_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let factory = CredentialFactory::new_from_resolver(Arc::new(move || {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if attempt == 0 {
                    Err(CredentialError::MissingLicenseKey)
                } else {
                    Ok("second-try".to_string())
                }
            })
        }));

        assert!(factory.get_credential().await.is_err());
        assert_eq!(factory.get_credential().await.expect("no key"), "second-try");
    }

    #[test]
    fn test_decode_license_key() {
        assert_eq!(
            decode_license_key(r#"{"LicenseKey":"abc"}"#).expect("decode failed"),
            "abc"
        );
        assert!(matches!(
            decode_license_key(r#"{"LicenseKey":""}"#),
            Err(CredentialError::MissingLicenseKey)
        ));
        assert!(matches!(
            decode_license_key(r#"{"Other":"abc"}"#),
            Err(CredentialError::MissingLicenseKey)
        ));
        assert!(matches!(
            decode_license_key("abc"),
            Err(CredentialError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_secrets_cache_lookup() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/secretsmanager/get")
            .match_query(Matcher::UrlEncoded(
                "secretId".into(),
                "NEW_RELIC_LICENSE_KEY".into(),
            ))
            .match_header("X-Aws-Parameters-Secrets-Token", "session-token")
            .with_status(200)
            .with_body(r#"{"Name":"x","SecretString":"{\"LicenseKey\":\"secret-key\"}"}"#)
            .create_async()
            .await;

        let cache = SecretsCache::new(reqwest::Client::new(), server.url(), "session-token");
        let factory = CredentialFactory::new_from_resolver(
            cache.resolver("NEW_RELIC_LICENSE_KEY".to_string()),
        );

        assert_eq!(
            factory.get_credential().await.expect("lookup failed"),
            "secret-key"
        );
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_secrets_cache_error_status() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/secretsmanager/get")
            .match_query(Matcher::Any)
            .with_status(403)
            .with_body("denied")
            .create_async()
            .await;

        let cache = SecretsCache::new(reqwest::Client::new(), server.url(), "");
        let err = cache
            .license_key("missing")
            .await
            .expect_err("lookup should fail");
        assert!(matches!(
            err,
            CredentialError::Status { status, ref body }
                if status == reqwest::StatusCode::FORBIDDEN && body == "denied"
        ));
    }
}
