// src/models/mod.rs
pub mod adjustment;
pub mod price;

use serde::Serialize;

// Re-export commonly used types so other modules can use `crate::models::X`
pub use adjustment::{
    AdjustmentRequest,
    AdjustmentResponse,
    BalanceJob,
    IdempotencyRecord,
    RawAdjustment,
    TransactionType,
};
pub use price::{LockRequest, OracleStatus, PriceQuote, TestModeLock};

/// Envelope for administrative endpoints.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}
