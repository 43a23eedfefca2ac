use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::{
    db::LedgerStore,
    error::Result,
    services::store::{keys, BalanceWrite, CommitOutcome, SharedStore},
};

/// Lamport-style write clock: wall-clock microseconds, but never repeats
/// and never goes backwards, even if the system clock does.
#[derive(Debug, Default)]
pub struct LogicalClock {
    last: AtomicU64,
}

impl LogicalClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        let wall = Utc::now().timestamp_micros().max(0) as u64;
        let mut current = self.last.load(Ordering::SeqCst);
        loop {
            let candidate = wall.max(current + 1);
            match self
                .last
                .compare_exchange(current, candidate, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return candidate,
                Err(actual) => current = actual,
            }
        }
    }

    /// Moves the clock past a timestamp written by another instance.
    pub fn observe(&self, seen: u64) {
        self.last.fetch_max(seen, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedBalance {
    pub minor: i64,
    /// `false` when the value came from the durable store.
    pub cached: bool,
}

impl LoadedBalance {
    /// Value the guarded commit must still find in the cache.
    pub fn expected(&self) -> Option<i64> {
        self.cached.then_some(self.minor)
    }
}

/// Reads and writes the per-user cached balance with its write timestamp.
pub struct CacheSynchronizer {
    store: Arc<dyn SharedStore>,
    ledger: Arc<dyn LedgerStore>,
    clock: LogicalClock,
}

impl CacheSynchronizer {
    pub fn new(store: Arc<dyn SharedStore>, ledger: Arc<dyn LedgerStore>) -> Self {
        Self {
            store,
            ledger,
            clock: LogicalClock::new(),
        }
    }

    pub async fn load(&self, username: &str) -> Result<LoadedBalance> {
        let cached = self
            .store
            .read_balance(&keys::balance(username), &keys::balance_timestamp(username))
            .await?;
        if let Some((minor, stamp)) = cached {
            self.clock.observe(stamp);
            return Ok(LoadedBalance {
                minor,
                cached: true,
            });
        }

        let minor = self.ledger.user_balance(username).await?.unwrap_or(0);
        tracing::debug!(
            "Balance cache miss user={} durable_minor={}",
            username,
            minor
        );
        Ok(LoadedBalance {
            minor,
            cached: false,
        })
    }

    /// Cache first, durable store second. `None` only if both lookups fail.
    pub async fn best_effort_minor(&self, username: &str) -> Option<i64> {
        match self.load(username).await {
            Ok(balance) => Some(balance.minor),
            Err(err) => {
                tracing::warn!("Balance lookup failed user={}: {}", username, err);
                None
            }
        }
    }

    /// Writes `new_minor` if the cache still holds what the preview started
    /// from and no newer write has landed. Returns the outcome and the
    /// logical timestamp used.
    pub async fn commit(
        &self,
        username: &str,
        loaded: &LoadedBalance,
        new_minor: i64,
    ) -> Result<(CommitOutcome, u64)> {
        let write_timestamp = self.clock.next();
        let write = BalanceWrite {
            balance_key: keys::balance(username),
            timestamp_key: keys::balance_timestamp(username),
            expected_minor: loaded.expected(),
            new_minor,
            write_timestamp,
        };
        let outcome = self.store.commit_balance(&write).await?;
        if let CommitOutcome::StaleTimestamp { stored } = outcome {
            self.clock.observe(stored);
        }
        Ok((outcome, write_timestamp))
    }
}
