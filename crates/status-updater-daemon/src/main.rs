// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, process::ExitCode, sync::Arc};

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use status_updater::{logger, Config, EtcdClient, Supervisor};

#[tokio::main]
pub async fn main() -> ExitCode {
    let log_level = env::var(logger::LOG_LEVEL_ENV)
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    if let Err(e) = logger::init(&log_level) {
        eprintln!("STATUS_UPDATER | ERROR | failed to set up logging: {e}");
        return ExitCode::FAILURE;
    }
    debug!("Logging subsystem enabled");

    let config = match Config::new() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let store = match EtcdClient::new(&config.store) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Unable to create the etcd client: {e}");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    info!(
        "Relaying status from {} to {}",
        config.listener.socket_path.display(),
        config.key_updater.key
    );
    match Supervisor::new(config, store).run(shutdown).await {
        Ok(()) => {
            info!("Status updater stopped");
            ExitCode::SUCCESS
        }
        Err(e) if e.is_startup() => {
            error!("Failed to start: {e}");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("Shutting down: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Cancels `shutdown` on SIGINT or SIGTERM.
async fn cancel_on_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = signal::ctrl_c() => debug!("Received SIGINT"),
                    _ = terminate.recv() => debug!("Received SIGTERM"),
                }
            }
            Err(e) => {
                error!("Unable to listen for SIGTERM, only SIGINT will stop the process: {e}");
                if let Err(e) = signal::ctrl_c().await {
                    error!("Unable to listen for SIGINT: {e}");
                    return;
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = signal::ctrl_c().await {
            error!("Unable to listen for shutdown signals: {e}");
            return;
        }
    }
    shutdown.cancel();
}
