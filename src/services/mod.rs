// Balance-adjustment ledger services
pub mod adjustment;
pub mod balance_calculator;
pub mod cache_sync;
pub mod idempotency;
pub mod job_dispatcher;
pub mod price_guard;
pub mod price_oracle;
pub mod request_validator;
pub mod store;

// Re-export for convenience
pub use adjustment::AdjustmentService;
pub use job_dispatcher::{DispatcherSettings, JobDispatcher};
pub use price_oracle::{OracleSettings, PriceOracle};
pub use store::{RedisStore, SharedStore};
