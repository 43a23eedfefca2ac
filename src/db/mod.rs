use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use std::time::Duration;

use crate::{
    config::Config,
    constants::DATABASE_TIMEOUT_MS,
    error::{AppError, Result},
    models::PriceQuote,
    utils::with_timeout,
};

/// Durable relational store. Authoritative for balances; written by the
/// out-of-process ledger worker, read here only as a fallback.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn user_balance(&self, username: &str) -> Result<Option<i64>>;
    async fn latest_price(&self) -> Result<Option<PriceQuote>>;
    async fn record_price(&self, quote: &PriceQuote) -> Result<()>;
}

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    budget: Duration,
}

impl Database {
    pub async fn new(config: &Config) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .acquire_timeout(Duration::from_millis(DATABASE_TIMEOUT_MS))
            .connect(&config.database_url)
            .await?;

        Ok(Self {
            pool,
            budget: Duration::from_millis(DATABASE_TIMEOUT_MS),
        })
    }

    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ==================== LEDGER QUERIES ====================
#[async_trait]
impl LedgerStore for Database {
    async fn user_balance(&self, username: &str) -> Result<Option<i64>> {
        with_timeout("db user_balance", self.budget, async {
            let balance = sqlx::query_scalar::<_, i64>(
                "SELECT balance_minor FROM user_balances WHERE username = $1",
            )
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
            Ok::<_, AppError>(balance)
        })
        .await
    }

    async fn latest_price(&self) -> Result<Option<PriceQuote>> {
        with_timeout("db latest_price", self.budget, async {
            let row = sqlx::query(
                "SELECT rate, source, recorded_at FROM price_records
                 ORDER BY recorded_at DESC LIMIT 1",
            )
            .fetch_optional(&self.pool)
            .await?;

            Ok::<_, AppError>(row.map(|row| PriceQuote {
                rate: row.get::<Decimal, _>("rate"),
                source: row.get::<String, _>("source"),
                fetched_at: row.get::<DateTime<Utc>, _>("recorded_at"),
            }))
        })
        .await
    }

    async fn record_price(&self, quote: &PriceQuote) -> Result<()> {
        with_timeout("db record_price", self.budget, async {
            sqlx::query(
                "INSERT INTO price_records (rate, source, recorded_at) VALUES ($1, $2, $3)",
            )
            .bind(quote.rate)
            .bind(&quote.source)
            .bind(quote.fetched_at)
            .execute(&self.pool)
            .await?;
            Ok::<_, AppError>(())
        })
        .await
    }
}
