use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Coin-to-display-currency conversion rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub rate: Decimal,
    pub fetched_at: DateTime<Utc>,
    pub source: String,
}

impl PriceQuote {
    pub fn new(rate: Decimal, source: impl Into<String>) -> Self {
        Self {
            rate,
            fetched_at: Utc::now(),
            source: source.into(),
        }
    }
}

/// Operator override freezing the oracle rate, shared by every instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestModeLock {
    pub active: bool,
    pub locked_rate: Decimal,
    pub expiry: DateTime<Utc>,
}

impl TestModeLock {
    pub fn is_effective(&self, now: DateTime<Utc>) -> bool {
        self.active && self.expiry > now
    }
}

// ==================== ADMIN ====================

#[derive(Debug, Deserialize)]
pub struct LockRequest {
    pub duration_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct OracleStatus {
    pub locked: bool,
    pub locked_rate: Option<Decimal>,
    pub lock_expiry: Option<DateTime<Utc>>,
    pub cached_rate: Option<Decimal>,
    pub cached_source: Option<String>,
}
