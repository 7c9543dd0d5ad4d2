// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Ledger
//!
//! Durable per-message attempt counter. Counts live in the shared store rather than in
//! process memory so that a redelivery after a crash does not reset them.

use crate::store::SharedStore;
use std::{sync::Arc, time::Duration};
use tracing::{debug, warn};

/// Key prefix of retry counters
pub const RETRY_COUNT_PREFIX: &str = "amqp:retry:count";

/// TTL-bound attempt counter keyed by message id.
///
/// Store failures never surface to the caller: a failed read counts as zero and a failed
/// write is logged and skipped, so the dispatcher can always issue its terminal action.
#[derive(Clone)]
pub struct RetryLedger {
    store: Arc<dyn SharedStore>,
    ttl: Duration,
}

impl RetryLedger {
    pub fn new(store: Arc<dyn SharedStore>, ttl: Duration) -> Self {
        RetryLedger { store, ttl }
    }

    /// Store key for a message id.
    pub fn key(message_id: &str) -> String {
        format!("{RETRY_COUNT_PREFIX}:{message_id}")
    }

    /// Current attempt count, zero when unknown.
    pub async fn get(&self, message_id: &str) -> u32 {
        match self.store.get(&RetryLedger::key(message_id)).await {
            Ok(count) => count
                .and_then(|c| u32::try_from(c).ok())
                .unwrap_or_default(),
            Err(err) => {
                warn!(
                    error = err.to_string(),
                    message_id, "failure to read retry count"
                );
                0
            }
        }
    }

    /// Adds one attempt and refreshes the TTL, returning the new count.
    pub async fn increment(&self, message_id: &str) -> u32 {
        let count = self.get(message_id).await.saturating_add(1);

        if let Err(err) = self
            .store
            .set_ex(&RetryLedger::key(message_id), i64::from(count), self.ttl)
            .await
        {
            warn!(
                error = err.to_string(),
                message_id, "failure to store retry count"
            );
        }

        debug!(message_id, count, "retry count incremented");
        count
    }

    /// Forgets all attempts of a message.
    pub async fn clear(&self, message_id: &str) {
        if let Err(err) = self.store.del(&RetryLedger::key(message_id)).await {
            warn!(
                error = err.to_string(),
                message_id, "failure to clear retry count"
            );
        }
    }
}
