use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::{STATUS_OK, STATUS_REJECTED};
use crate::utils::wire_timestamp;

// ==================== INBOUND ====================

/// Body exactly as the game provider sent it. Values stay untyped so the
/// signature can be recomputed over what was actually received.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawAdjustment {
    pub command: Option<Value>,
    #[serde(rename = "type")]
    pub tx_type: Option<Value>,
    pub login: Option<Value>,
    pub amount: Option<Value>,
    pub uniqid: Option<Value>,
    pub timestamp: Option<Value>,
    pub hashed_result: Option<Value>,
    pub gpid: Option<Value>,
    pub subtype: Option<Value>,
    pub gameid: Option<Value>,
    pub custom_data: Option<Value>,
    pub internal_session_id: Option<Value>,
    pub userid: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Bet,
    Win,
    #[serde(rename = "cancelbet")]
    CancelBet,
    #[serde(rename = "cancelwin")]
    CancelWin,
}

impl TransactionType {
    /// `cancel` is the legacy spelling of `cancelbet`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "bet" => Some(Self::Bet),
            "win" => Some(Self::Win),
            "cancel" | "cancelbet" => Some(Self::CancelBet),
            "cancelwin" => Some(Self::CancelWin),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bet => "bet",
            Self::Win => "win",
            Self::CancelBet => "cancelbet",
            Self::CancelWin => "cancelwin",
        }
    }

    /// Types that take money away from the player and can therefore overdraw.
    pub fn is_debit(&self) -> bool {
        matches!(self, Self::Bet | Self::CancelWin)
    }
}

/// Validated, typed view of a [`RawAdjustment`].
#[derive(Debug, Clone)]
pub struct AdjustmentRequest {
    pub command: String,
    pub tx_type: TransactionType,
    pub login: String,
    pub username: String,
    pub amount: Decimal,
    pub uniqid: String,
    pub gpid: Option<String>,
    pub subtype: Option<String>,
    pub game_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub custom_data: Option<Value>,
}

// ==================== OUTBOUND ====================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustmentResponse {
    pub status: String,
    pub balance: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errormsg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl AdjustmentResponse {
    pub fn success(balance: String, now: DateTime<Utc>) -> Self {
        Self {
            status: STATUS_OK.to_string(),
            balance,
            errormsg: None,
            timestamp: Some(wire_timestamp(now)),
        }
    }

    /// Business rejection: a normal protocol outcome, answered with HTTP 200.
    pub fn rejected(balance: String, message: &str, now: DateTime<Utc>) -> Self {
        Self {
            status: STATUS_REJECTED.to_string(),
            balance,
            errormsg: Some(message.to_string()),
            timestamp: Some(wire_timestamp(now)),
        }
    }

    /// Hard failure body. Carries no timestamp.
    pub fn failure(balance: Option<String>, message: String) -> Self {
        Self {
            status: STATUS_REJECTED.to_string(),
            balance: balance.unwrap_or_else(|| "0".to_string()),
            errormsg: Some(message),
            timestamp: None,
        }
    }
}

// ==================== IDEMPOTENCY ====================

/// Single record per `(username, uniqid)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum IdempotencyRecord {
    Pending {
        created_at: DateTime<Utc>,
    },
    Completed {
        response: AdjustmentResponse,
        stored_at: DateTime<Utc>,
    },
}

// ==================== DURABLE JOB ====================

/// Normalized transaction handed to the durable worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceJob {
    pub username: String,
    pub login: String,
    pub uniqid: String,
    pub tx_type: TransactionType,
    pub amount: Decimal,
    pub gpid: Option<String>,
    pub game_id: Option<String>,
    pub subtype: Option<String>,
    pub custom_data: Option<Value>,
    pub request_timestamp: DateTime<Utc>,
    pub rate: Decimal,
    pub balance_before_minor: i64,
    pub balance_after_minor: i64,
    pub write_timestamp: u64,
    pub processed_at: DateTime<Utc>,
}
