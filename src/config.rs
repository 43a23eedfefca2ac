use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;
use std::net::IpAddr;
use std::str::FromStr;

use crate::constants::*;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // Server
    pub host: String,
    pub port: u16,
    pub environment: String,

    // Database
    pub database_url: String,
    pub database_max_connections: u32,

    // Redis
    pub redis_url: String,

    // Request validation
    pub signing_secret: String,
    pub adjustment_command: String,
    pub timestamp_window_secs: i64,
    pub allowed_origins: Vec<IpAddr>,
    pub trust_forwarded_for: bool,
    pub login_prefixes: Vec<String>,

    // Balance accounting
    pub minor_units_per_coin: i64,

    // Price oracle
    pub min_rate: Decimal,
    pub max_rate: Decimal,
    pub local_price_ttl_secs: u64,
    pub shared_price_ttl_secs: u64,
    pub provider_timeout_ms: u64,
    pub coingecko_url: String,
    pub binance_url: String,
    pub kraken_url: String,

    // Ephemeral records
    pub idempotency_ttl_secs: u64,
    pub pending_bet_ttl_secs: u64,

    // Job dispatch
    pub job_stream: String,
    pub job_stream_max_len: usize,
    pub job_queue_capacity: usize,
    pub job_signing_secret: Option<String>,

    // Admin
    pub admin_key: Option<String>,

    // CORS
    pub cors_allowed_origins: String,
}

// Internal helper that parses an optional env var, falling back to a default.
fn env_or<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => Ok(raw.trim().parse()?),
        _ => Ok(default),
    }
}

// Internal helper that checks conditions for `env_flag`.
fn env_flag(name: &str) -> bool {
    env::var(name)
        .ok()
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(false)
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn parse_origins(raw: &str) -> anyhow::Result<Vec<IpAddr>> {
    split_list(raw)
        .into_iter()
        .map(|entry| {
            entry
                .parse::<IpAddr>()
                .map_err(|e| anyhow::anyhow!("Invalid ALLOWED_ORIGINS entry '{}': {}", entry, e))
        })
        .collect()
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        Ok(Config {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_or("PORT", 3000)?,
            environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),

            database_url: env::var("DATABASE_URL")?,
            database_max_connections: env_or("DATABASE_MAX_CONNECTIONS", 20)?,

            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),

            signing_secret: env::var("SIGNING_SECRET")?,
            adjustment_command: env::var("ADJUSTMENT_COMMAND")
                .unwrap_or_else(|_| DEFAULT_ADJUSTMENT_COMMAND.to_string()),
            timestamp_window_secs: env_or("TIMESTAMP_WINDOW_SECS", DEFAULT_TIMESTAMP_WINDOW_SECS)?,
            allowed_origins: parse_origins(&env::var("ALLOWED_ORIGINS").unwrap_or_default())?,
            trust_forwarded_for: env_flag("TRUST_FORWARDED_FOR"),
            login_prefixes: split_list(
                &env::var("LOGIN_PREFIXES").unwrap_or_else(|_| DEFAULT_LOGIN_PREFIXES.to_string()),
            ),

            minor_units_per_coin: env_or("MINOR_UNITS_PER_COIN", DEFAULT_MINOR_UNITS_PER_COIN)?,

            min_rate: env_or("RATE_MIN", Decimal::from_str(DEFAULT_MIN_RATE)?)?,
            max_rate: env_or("RATE_MAX", Decimal::from_str(DEFAULT_MAX_RATE)?)?,
            local_price_ttl_secs: env_or("LOCAL_PRICE_TTL_SECS", DEFAULT_LOCAL_PRICE_TTL_SECS)?,
            shared_price_ttl_secs: env_or("SHARED_PRICE_TTL_SECS", DEFAULT_SHARED_PRICE_TTL_SECS)?,
            provider_timeout_ms: env_or("PROVIDER_TIMEOUT_MS", DEFAULT_PROVIDER_TIMEOUT_MS)?,
            coingecko_url: env::var("COINGECKO_URL")
                .unwrap_or_else(|_| DEFAULT_COINGECKO_URL.to_string()),
            binance_url: env::var("BINANCE_URL").unwrap_or_else(|_| DEFAULT_BINANCE_URL.to_string()),
            kraken_url: env::var("KRAKEN_URL").unwrap_or_else(|_| DEFAULT_KRAKEN_URL.to_string()),

            idempotency_ttl_secs: env_or("IDEMPOTENCY_TTL_SECS", DEFAULT_IDEMPOTENCY_TTL_SECS)?,
            pending_bet_ttl_secs: env_or("PENDING_BET_TTL_SECS", DEFAULT_PENDING_BET_TTL_SECS)?,

            job_stream: env::var("JOB_STREAM").unwrap_or_else(|_| DEFAULT_JOB_STREAM.to_string()),
            job_stream_max_len: env_or("JOB_STREAM_MAX_LEN", DEFAULT_JOB_STREAM_MAX_LEN)?,
            job_queue_capacity: env_or("JOB_QUEUE_CAPACITY", DEFAULT_JOB_QUEUE_CAPACITY)?,
            job_signing_secret: env::var("JOB_SIGNING_SECRET")
                .ok()
                .filter(|v| !v.trim().is_empty()),

            admin_key: env::var("ADMIN_KEY").ok().filter(|v| !v.trim().is_empty()),

            cors_allowed_origins: env::var("CORS_ALLOWED_ORIGINS")
                .unwrap_or_else(|_| "*".to_string()),
        })
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database_url.trim().is_empty() {
            anyhow::bail!("DATABASE_URL is empty");
        }
        if self.signing_secret.trim().is_empty() {
            anyhow::bail!("SIGNING_SECRET is empty");
        }
        if self.adjustment_command.trim().is_empty() {
            anyhow::bail!("ADJUSTMENT_COMMAND is empty");
        }
        if self.timestamp_window_secs <= 0 {
            anyhow::bail!("TIMESTAMP_WINDOW_SECS must be > 0");
        }
        if self.login_prefixes.is_empty() {
            anyhow::bail!("LOGIN_PREFIXES must list at least one prefix");
        }
        if self.minor_units_per_coin <= 0 {
            anyhow::bail!("MINOR_UNITS_PER_COIN must be > 0");
        }
        if self.min_rate <= Decimal::ZERO || self.min_rate >= self.max_rate {
            anyhow::bail!(
                "Rate sanity band is invalid: min={} max={}",
                self.min_rate,
                self.max_rate
            );
        }
        if self.local_price_ttl_secs == 0 || self.shared_price_ttl_secs == 0 {
            anyhow::bail!("Price cache TTLs must be > 0");
        }
        if self.idempotency_ttl_secs == 0 || self.pending_bet_ttl_secs == 0 {
            anyhow::bail!("Idempotency and pending-bet TTLs must be > 0");
        }
        if self.job_queue_capacity == 0 {
            anyhow::bail!("JOB_QUEUE_CAPACITY must be > 0");
        }

        if self.allowed_origins.is_empty() {
            if !self.is_development() {
                anyhow::bail!("ALLOWED_ORIGINS must be set outside development");
            }
            tracing::warn!("ALLOWED_ORIGINS is empty; origin check is bypassed");
        }
        if self.admin_key.is_none() {
            tracing::warn!("ADMIN_KEY is not set; oracle admin endpoints are disabled");
        }
        if self.signing_secret.len() < 16 {
            tracing::warn!("SIGNING_SECRET is shorter than 16 characters");
        }
        if self.cors_allowed_origins.trim().is_empty() {
            tracing::warn!("CORS_ALLOWED_ORIGINS is empty; requests may be blocked");
        }

        Ok(())
    }

    pub fn is_development(&self) -> bool {
        self.environment == "development" || self.environment == "test"
    }
}

#[cfg(test)]
pub fn test_config() -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 3000,
        environment: "test".to_string(),
        database_url: "postgres://localhost/ledger_test".to_string(),
        database_max_connections: 1,
        redis_url: "redis://localhost:6379".to_string(),
        signing_secret: "test_signing_secret_value".to_string(),
        adjustment_command: DEFAULT_ADJUSTMENT_COMMAND.to_string(),
        timestamp_window_secs: DEFAULT_TIMESTAMP_WINDOW_SECS,
        allowed_origins: Vec::new(),
        trust_forwarded_for: false,
        login_prefixes: split_list(DEFAULT_LOGIN_PREFIXES),
        minor_units_per_coin: 100,
        min_rate: Decimal::from(1),
        max_rate: Decimal::from(10_000),
        local_price_ttl_secs: DEFAULT_LOCAL_PRICE_TTL_SECS,
        shared_price_ttl_secs: DEFAULT_SHARED_PRICE_TTL_SECS,
        provider_timeout_ms: 200,
        coingecko_url: DEFAULT_COINGECKO_URL.to_string(),
        binance_url: DEFAULT_BINANCE_URL.to_string(),
        kraken_url: DEFAULT_KRAKEN_URL.to_string(),
        idempotency_ttl_secs: DEFAULT_IDEMPOTENCY_TTL_SECS,
        pending_bet_ttl_secs: DEFAULT_PENDING_BET_TTL_SECS,
        job_stream: DEFAULT_JOB_STREAM.to_string(),
        job_stream_max_len: 1_000,
        job_queue_capacity: 16,
        job_signing_secret: None,
        admin_key: Some("admin-test-key".to_string()),
        cors_allowed_origins: "*".to_string(),
    }
}
