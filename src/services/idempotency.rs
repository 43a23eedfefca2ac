use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::{
    constants::DUPLICATE_TRANSACTION_MESSAGE,
    error::{AppError, Result},
    models::{AdjustmentResponse, IdempotencyRecord},
    services::store::{keys, SharedStore},
};

/// Outcome of trying to claim a `(username, uniqid)` pair.
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// First delivery; the caller owns the placeholder.
    Fresh,
    /// Seen before. Carries the stored response once processing finished.
    Duplicate(Option<AdjustmentResponse>),
}

/// At-most-once gate keyed by `(username, uniqid)`.
///
/// One record per key holds either the in-flight placeholder or the final
/// response, so both expire together.
pub struct IdempotencyGuard {
    store: Arc<dyn SharedStore>,
    ttl_secs: u64,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn SharedStore>, ttl_secs: u64) -> Self {
        Self { store, ttl_secs }
    }

    pub async fn claim(&self, username: &str, uniqid: &str, now: DateTime<Utc>) -> Result<Claim> {
        let key = keys::idempotency(username, uniqid);
        let placeholder = encode(&IdempotencyRecord::Pending { created_at: now })?;

        if self.store.set_nx_ex(&key, &placeholder, self.ttl_secs).await? {
            return Ok(Claim::Fresh);
        }

        let stored = match self.store.get(&key).await? {
            Some(raw) => match serde_json::from_str::<IdempotencyRecord>(&raw) {
                Ok(IdempotencyRecord::Completed { response, .. }) => Some(response),
                Ok(IdempotencyRecord::Pending { .. }) => None,
                Err(err) => {
                    tracing::warn!("Unreadable idempotency record {}: {}", key, err);
                    None
                }
            },
            None => None,
        };
        Ok(Claim::Duplicate(stored))
    }

    /// Replaces the placeholder with the final response.
    pub async fn complete(
        &self,
        username: &str,
        uniqid: &str,
        response: &AdjustmentResponse,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let record = encode(&IdempotencyRecord::Completed {
            response: response.clone(),
            stored_at: now,
        })?;
        self.store
            .set_ex(&keys::idempotency(username, uniqid), &record, self.ttl_secs)
            .await
    }

    /// Drops a placeholder whose request never reached a balance commit.
    pub async fn release(&self, username: &str, uniqid: &str) {
        if let Err(err) = self.store.del(&keys::idempotency(username, uniqid)).await {
            tracing::warn!(
                "Failed to release idempotency placeholder user={} uniqid={}: {}",
                username,
                uniqid,
                err
            );
        }
    }
}

/// Response for a repeated delivery. Only `balance` may differ from the
/// original answer.
pub fn replay_response(
    stored: Option<AdjustmentResponse>,
    current_balance: String,
    now: DateTime<Utc>,
) -> AdjustmentResponse {
    match stored {
        Some(mut response) => {
            response.balance = current_balance;
            response
        }
        None => AdjustmentResponse::rejected(current_balance, DUPLICATE_TRANSACTION_MESSAGE, now),
    }
}

fn encode(record: &IdempotencyRecord) -> Result<String> {
    serde_json::to_string(record)
        .map_err(|e| AppError::Internal(format!("Failed to encode idempotency record: {}", e)))
}
