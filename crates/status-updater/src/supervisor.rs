// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Lifecycle wiring for the listener and the key updater.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{Config, ConfigError};
use crate::key_updater::KeyUpdater;
use crate::listener::{ListenerError, LocalListener};
use crate::store::KeyStore;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("invalid key updater configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("cannot open the reporting socket: {0}")]
    ListenerStartup(#[source] ListenerError),
    #[error("reporting socket failed: {0}")]
    ListenerFailed(#[source] ListenerError),
}

impl SupervisorError {
    pub fn is_startup(&self) -> bool {
        matches!(self, Self::Config(_) | Self::ListenerStartup(_))
    }
}

pub struct Supervisor {
    config: Config,
    store: Arc<dyn KeyStore>,
}

impl Supervisor {
    pub fn new(config: Config, store: Arc<dyn KeyStore>) -> Self {
        Self { config, store }
    }

    /// Runs until `shutdown` is cancelled or the listener fails.
    ///
    /// Startup and listener failures are returned; a requested shutdown stops
    /// the listener, then the updater, and returns `Ok(())`.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), SupervisorError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();

        let updater = KeyUpdater::new(self.config.key_updater, self.store, events_rx)?;
        let mut listener = LocalListener::new(self.config.listener, events_tx, fatal_tx);
        listener
            .start()
            .map_err(SupervisorError::ListenerStartup)?;
        let updater = updater.start();

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!("supervisor: shutdown requested");
                listener.stop().await;
                updater.stop().await;
                Ok(())
            }
            Some(err) = fatal_rx.recv() => {
                error!("supervisor: listener failed, stopping");
                listener.stop().await;
                updater.stop().await;
                Err(SupervisorError::ListenerFailed(err))
            }
        }
    }
}
