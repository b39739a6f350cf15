// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Relays the status of a local process into a TTL-bound etcd key.
//!
//! The reporting process writes its status to a Unix socket. The
//! [`listener`] turns each payload into a [`StatusEvent`], the
//! [`key_updater`] writes the newest one to the store and keeps re-writing it
//! before its TTL runs out. Observers treat the key's disappearance as the
//! reporting process having died.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod event;
pub mod key_updater;
pub mod listener;
pub mod logger;
pub mod store;
pub mod supervisor;

#[cfg(test)]
mod test_support;

pub use config::{Config, ConfigError, KeyUpdaterConfig, ListenerConfig, StoreConfig, TlsFiles};
pub use event::StatusEvent;
pub use key_updater::{KeyUpdater, KeyUpdaterHandle};
pub use listener::{ListenerError, LocalListener};
pub use store::{EtcdClient, KeyStore, StoreError};
pub use supervisor::{Supervisor, SupervisorError};
