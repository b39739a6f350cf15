// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-memory store used by the unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tokio::time::Instant;

use crate::store::{KeyStore, StoreError};

#[derive(Debug, Clone)]
pub(crate) struct RecordedPut {
    pub key: String,
    pub value: Vec<u8>,
    pub ttl: Duration,
    /// Time of the call relative to the store's creation.
    pub at: Duration,
    pub ok: bool,
}

/// Records every Put. Failures can be scripted; an optional delay keeps each
/// Put in flight for a while.
pub(crate) struct RecordingStore {
    created: Instant,
    delay: Duration,
    puts: Mutex<Vec<RecordedPut>>,
    fail_next: AtomicUsize,
    failing: AtomicBool,
    completed: AtomicUsize,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            created: Instant::now(),
            delay,
            puts: Mutex::new(Vec::new()),
            fail_next: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            completed: AtomicUsize::new(0),
        }
    }

    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn puts(&self) -> Vec<RecordedPut> {
        self.puts.lock().expect("lock poisoned").clone()
    }

    /// Number of Puts that ran to completion.
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    fn should_fail(&self) -> bool {
        if self.failing.load(Ordering::SeqCst) {
            return true;
        }
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl KeyStore for RecordingStore {
    async fn put(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        let ok = !self.should_fail();
        self.puts.lock().expect("lock poisoned").push(RecordedPut {
            key: key.to_string(),
            value: value.to_vec(),
            ttl,
            at: Instant::now().duration_since(self.created),
            ok,
        });
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.completed.fetch_add(1, Ordering::SeqCst);
        if ok {
            Ok(())
        } else {
            Err(StoreError::Status {
                status: StatusCode::SERVICE_UNAVAILABLE,
                message: "injected failure".to_string(),
            })
        }
    }
}
