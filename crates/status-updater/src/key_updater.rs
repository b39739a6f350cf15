// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! TTL-bound key maintenance.
//!
//! The updater owns the last known status and keeps it alive in the store:
//!
//! - a new [`StatusEvent`] is written immediately,
//! - a successful write schedules a refresh of the same value after
//!   `refresh_interval`,
//! - a failed write schedules a retry after `retry_interval`.
//!
//! Writes are issued one at a time from a single loop. Events that queue up
//! while a write is in flight are coalesced so only the newest is written
//! next, and a newer status always preempts a pending retry. Store failures
//! are never fatal; the updater keeps retrying until it is stopped.

use std::future::pending;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn, Instrument};

use crate::config::{ConfigError, KeyUpdaterConfig};
use crate::event::StatusEvent;
use crate::store::{KeyStore, StoreError};

/// Tracks consecutive failures so that outages are reported once, not on
/// every retry.
#[derive(Debug, Default)]
struct WriteHealth {
    consecutive_failures: u32,
    /// The key's TTL runs from here.
    last_success: Option<Instant>,
    /// First failure when nothing was ever written.
    first_failure: Option<Instant>,
    expiry_reported: bool,
}

impl WriteHealth {
    fn record_success(&mut self, key: &str, now: Instant) {
        if self.consecutive_failures > 0 {
            info!(
                "key-updater: {key} written again after {} failed attempts",
                self.consecutive_failures
            );
        }
        *self = Self {
            last_success: Some(now),
            ..Self::default()
        };
    }

    fn record_failure(&mut self, config: &KeyUpdaterConfig, err: &StoreError, now: Instant) {
        self.consecutive_failures += 1;
        if err.is_transient() {
            warn!(
                "key-updater: failed to write {} (attempt {}), retrying in {:?}: {err}",
                config.key, self.consecutive_failures, config.retry_interval
            );
        } else {
            error!(
                "key-updater: store rejected {} (attempt {}), retrying in {:?}: {err}",
                config.key, self.consecutive_failures, config.retry_interval
            );
        }
        let since = match self.last_success {
            Some(at) => at,
            None => *self.first_failure.get_or_insert(now),
        };
        if !self.expiry_reported && now.duration_since(since) >= config.ttl {
            error!(
                "key-updater: {} has not been written for longer than its TTL ({:?}) and has presumably expired",
                config.key, config.ttl
            );
            self.expiry_reported = true;
        }
    }
}

/// Keeps one key alive in the store with the latest reported status.
pub struct KeyUpdater {
    config: KeyUpdaterConfig,
    store: Arc<dyn KeyStore>,
    events_rx: mpsc::UnboundedReceiver<StatusEvent>,
    cancel_token: CancellationToken,
}

impl KeyUpdater {
    pub fn new(
        config: KeyUpdaterConfig,
        store: Arc<dyn KeyStore>,
        events_rx: mpsc::UnboundedReceiver<StatusEvent>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            store,
            events_rx,
            cancel_token: CancellationToken::new(),
        })
    }

    /// Spawns the scheduling loop. Must be called from within a Tokio runtime.
    pub fn start(self) -> KeyUpdaterHandle {
        let cancel_token = self.cancel_token.clone();
        let task = tokio::spawn(self.run().in_current_span());
        KeyUpdaterHandle { cancel_token, task }
    }

    async fn run(mut self) {
        info!(
            "key-updater: maintaining {} (ttl {:?}, refresh every {:?})",
            self.config.key, self.config.ttl, self.config.refresh_interval
        );
        let mut value: Option<Vec<u8>> = None;
        let mut next_write: Option<Instant> = None;
        let mut health = WriteHealth::default();
        let mut events_open = true;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => break,
                event = self.events_rx.recv(), if events_open => match event {
                    Some(event) => value = Some(self.newest_payload(event)),
                    None => {
                        debug!("key-updater: status stream closed, refreshing last known value until stopped");
                        events_open = false;
                        continue;
                    }
                },
                _ = wait_until(next_write) => trace!("key-updater: timer fired"),
            }

            let Some(payload) = value.as_deref() else {
                continue;
            };

            debug!("key-updater: writing {}", self.config.key);
            let result = tokio::select! {
                biased;
                // an in-flight write is abandoned on stop
                _ = self.cancel_token.cancelled() => break,
                result = self.store.put(&self.config.key, payload, self.config.ttl) => result,
            };

            let now = Instant::now();
            match result {
                Ok(()) => {
                    health.record_success(&self.config.key, now);
                    next_write = Some(now + self.config.refresh_interval);
                }
                Err(err) => {
                    health.record_failure(&self.config, &err, now);
                    next_write = Some(now + self.config.retry_interval);
                }
            }
        }
        info!("key-updater: stopped");
    }

    /// Skips over statuses that were superseded while the loop was busy.
    fn newest_payload(&mut self, event: StatusEvent) -> Vec<u8> {
        let mut newest = event;
        let mut skipped = 0usize;
        while let Ok(event) = self.events_rx.try_recv() {
            newest = event;
            skipped += 1;
        }
        if skipped > 0 {
            debug!("key-updater: coalesced {skipped} superseded statuses");
        }
        newest.into_payload()
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

/// Handle to a running [`KeyUpdater`].
#[derive(Debug)]
pub struct KeyUpdaterHandle {
    cancel_token: CancellationToken,
    task: JoinHandle<()>,
}

impl KeyUpdaterHandle {
    #[cfg(test)]
    fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops the loop and waits for it to exit. No Put is issued after this
    /// returns.
    pub async fn stop(self) {
        self.cancel_token.cancel();
        if let Err(e) = self.task.await {
            error!("key-updater: loop ended abnormally: {e}");
        }
    }
}
