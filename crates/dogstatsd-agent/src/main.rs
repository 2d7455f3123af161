// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod logger;

use dogstatsd::{agent::Agent, config::Config};
use std::process::ExitCode;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
pub async fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            // no subscriber yet
            eprintln!("DOGSTATSD | ERROR | {e}");
            return ExitCode::FAILURE;
        }
    };

    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", config.log_level);
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::try_new(env_filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .event_format(logger::Formatter)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("DOGSTATSD | ERROR | failed to install log subscriber: {e}");
    }
    debug!("Logging subsystem enabled");

    if config.api_key.is_empty() {
        error!("DD_API_KEY is not set, payloads will be rejected by the intake");
    }

    let grace = config.shutdown_grace;
    let agent = match Agent::start(config).await {
        Ok(agent) => agent,
        Err(e) => {
            error!("Failed to start DogStatsD agent: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(addr) = agent.udp_addr() {
        info!("Accepting DogStatsD traffic on {}", addr);
    }

    wait_for_shutdown().await;
    agent.stop(grace).await;
    ExitCode::SUCCESS
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!("Failed to listen for SIGTERM: {}", e);
            return ctrl_c().await;
        }
    };
    tokio::select! {
        () = ctrl_c() => {}
        _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    ctrl_c().await;
}

async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, initiating shutdown"),
        Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
    }
}
