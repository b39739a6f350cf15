// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mock key stores for driving the supervisor without etcd

use std::sync::Mutex;
use std::time::Duration;

use status_updater::{KeyStore, StoreError};
use tokio::sync::Notify;

/// Key store that keeps every successful Put in memory
#[derive(Default)]
pub struct MemoryStore {
    puts: Mutex<Vec<(String, Vec<u8>, Duration)>>,
    written: Notify,
}

#[allow(dead_code)]
impl MemoryStore {
    pub fn puts(&self) -> Vec<(String, Vec<u8>, Duration)> {
        self.puts.lock().expect("lock poisoned").clone()
    }

    pub fn values(&self) -> Vec<String> {
        self.puts()
            .into_iter()
            .map(|(_, value, _)| String::from_utf8_lossy(&value).into_owned())
            .collect()
    }

    /// Waits until at least `count` Puts have been recorded.
    pub async fn wait_for_puts(&self, count: usize) {
        loop {
            let notified = self.written.notified();
            if self.puts.lock().expect("lock poisoned").len() >= count {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait::async_trait]
impl KeyStore for MemoryStore {
    async fn put(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        self.puts
            .lock()
            .expect("lock poisoned")
            .push((key.to_string(), value.to_vec(), ttl));
        self.written.notify_waiters();
        Ok(())
    }
}
