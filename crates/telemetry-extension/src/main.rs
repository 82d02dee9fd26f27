// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, error::Error, process, sync::Arc};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use telemetry_extension::{
    extension_api::ExtensionApiClient,
    lifecycle::{Lifecycle, TelemetryPipeline},
    telemetry_api::{destination_uri, TelemetryApiClient, TelemetryListener, QUEUE_CAPACITY},
};
use telemetry_harvest::{
    batch::Batch,
    client::DeliveryClient,
    config::{Config, LogLevel},
    credential::{CredentialFactory, SecretsCache},
    dispatcher::Dispatcher,
    endpoints::Endpoints,
    harvester::Harvester,
    http,
    logger::Formatter,
    EXTENSION_NAME,
};

const RUNTIME_API_VAR: &str = "AWS_LAMBDA_RUNTIME_API";
const FUNCTION_NAME_VAR: &str = "AWS_LAMBDA_FUNCTION_NAME";

#[tokio::main]
pub async fn main() {
    let log_level = LogLevel::from_env();
    let env_filter = format!(
        "h2=off,hyper=off,rustls=off,reqwest=off,{}",
        log_level.as_directive()
    );

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_ansi(false)
        .event_format(Formatter)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    if let Err(e) = run(&cancel).await {
        error!("Extension failed: {e}");
        process::exit(1);
    }
}

async fn run(cancel: &CancellationToken) -> Result<(), Box<dyn Error>> {
    let config = Config::from_env()?;
    debug!(
        "Batching up to {} bytes or {} ms, sending with {} compression",
        config.batch_size_bytes,
        config.batch_interval.as_millis(),
        config.compression
    );
    let client = http::get_client(&config);

    let credentials = Arc::new(match &config.license_key {
        Some(key) => CredentialFactory::new_from_static_key(key),
        None => CredentialFactory::new_from_resolver(
            SecretsCache::from_env(client.clone()).resolver(config.license_key_secret.clone()),
        ),
    });
    let credential = credentials.get_credential().await?;
    let endpoints = Endpoints::resolve(
        credential,
        config.account_id.as_deref(),
        &config.endpoints,
    );
    debug!("Resolved endpoints: {endpoints:?}");

    let dispatcher = Dispatcher::new(
        DeliveryClient::new(client.clone(), config.send_timeout, config.compression),
        credentials,
        endpoints,
        config.max_payload_bytes,
    );
    let harvester = Harvester::new(
        Batch::new(config.batch_size_bytes, config.batch_interval),
        dispatcher,
    )
    .collect_agent_data(config.collect_agent_data);
    if !config.collect_agent_data {
        info!("Agent data collection disabled, pushed telemetry will be dropped");
    }

    let runtime_api = env::var(RUNTIME_API_VAR)
        .map_err(|_| format!("{RUNTIME_API_VAR} is not set, not running inside Lambda?"))?;
    let extension_api = ExtensionApiClient::new(client.clone(), &runtime_api);
    let registration = extension_api.register(EXTENSION_NAME).await?;
    let function_name = env::var(FUNCTION_NAME_VAR)
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or(registration.function.function_name);
    info!(
        "Registered {EXTENSION_NAME} for {function_name} as {}",
        registration.extension_id
    );

    let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
    let listener = TelemetryListener::bind(config.listener_port, tx).await?;
    let listener_cancel = cancel.child_token();
    let listener = tokio::spawn(listener.serve(listener_cancel.clone()));
    let collector = harvester.spawn_collector(rx);

    TelemetryApiClient::new(client, &runtime_api)
        .subscribe(
            &registration.extension_id,
            &destination_uri(config.listener_port),
        )
        .await?;

    let pipeline = TelemetryPipeline {
        cancel: listener_cancel,
        listener,
        collector,
    };
    Lifecycle::new(
        extension_api,
        registration.extension_id,
        harvester,
        function_name,
        pipeline,
    )
    .run(cancel)
    .await?;
    Ok(())
}

#[cfg(unix)]
fn spawn_signal_handler(cancel: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                (Err(e), _) | (_, Err(e)) => {
                    error!("Failed to install signal handlers: {e}");
                    return;
                }
            };
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
        cancel.cancel();
    });
}

#[cfg(not(unix))]
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received interrupt");
            cancel.cancel();
        }
    });
}
