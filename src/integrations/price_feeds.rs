use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::{
    config::Config,
    constants::{PROVIDER_BINANCE, PROVIDER_COINGECKO, PROVIDER_KRAKEN},
    error::{AppError, Result},
};

/// External source of the coin/USD rate.
#[async_trait]
pub trait PriceProvider: Send + Sync {
    fn name(&self) -> &'static str;
    async fn fetch_rate(&self) -> Result<Decimal>;
}

/// Providers in fallback priority order: primary, secondary, tertiary.
pub fn default_feeds(config: &Config) -> Result<Vec<Arc<dyn PriceProvider>>> {
    let client = Client::builder()
        .timeout(Duration::from_millis(config.provider_timeout_ms))
        .build()
        .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {}", e)))?;

    let primary: Arc<dyn PriceProvider> =
        Arc::new(CoinGeckoFeed::new(client.clone(), config.coingecko_url.clone()));
    let secondary: Arc<dyn PriceProvider> =
        Arc::new(BinanceFeed::new(client.clone(), config.binance_url.clone()));
    let tertiary: Arc<dyn PriceProvider> =
        Arc::new(KrakenFeed::new(client, config.kraken_url.clone()));

    Ok(vec![primary, secondary, tertiary])
}

async fn get_json<T: for<'de> Deserialize<'de>>(client: &Client, url: &str, name: &str) -> Result<T> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| AppError::ExternalAPI(format!("{} request failed: {}", name, e)))?
        .error_for_status()
        .map_err(|e| AppError::ExternalAPI(format!("{} returned error status: {}", name, e)))?;

    response
        .json::<T>()
        .await
        .map_err(|e| AppError::ExternalAPI(format!("{} payload invalid: {}", name, e)))
}

fn parse_decimal(raw: &str, name: &str) -> Result<Decimal> {
    Decimal::from_str(raw.trim())
        .map_err(|e| AppError::ExternalAPI(format!("{} price '{}' invalid: {}", name, raw, e)))
}

// ==================== COINGECKO ====================

pub struct CoinGeckoFeed {
    client: Client,
    url: String,
}

impl CoinGeckoFeed {
    pub fn new(client: Client, url: String) -> Self {
        Self { client, url }
    }
}

// {"solana":{"usd":152.31}}
type CoinGeckoPriceResponse = HashMap<String, HashMap<String, f64>>;

fn coingecko_rate(payload: &CoinGeckoPriceResponse) -> Result<Decimal> {
    payload
        .values()
        .find_map(|quotes| quotes.get("usd").copied())
        .and_then(|usd| Decimal::try_from(usd).ok())
        .ok_or_else(|| AppError::ExternalAPI("CoinGecko payload has no usd quote".to_string()))
}

#[async_trait]
impl PriceProvider for CoinGeckoFeed {
    fn name(&self) -> &'static str {
        PROVIDER_COINGECKO
    }

    async fn fetch_rate(&self) -> Result<Decimal> {
        let payload: CoinGeckoPriceResponse = get_json(&self.client, &self.url, self.name()).await?;
        coingecko_rate(&payload)
    }
}

// ==================== BINANCE ====================

pub struct BinanceFeed {
    client: Client,
    url: String,
}

impl BinanceFeed {
    pub fn new(client: Client, url: String) -> Self {
        Self { client, url }
    }
}

// {"symbol":"SOLUSDT","price":"152.31000000"}
#[derive(Debug, Deserialize)]
struct BinanceTicker {
    price: String,
}

#[async_trait]
impl PriceProvider for BinanceFeed {
    fn name(&self) -> &'static str {
        PROVIDER_BINANCE
    }

    async fn fetch_rate(&self) -> Result<Decimal> {
        let ticker: BinanceTicker = get_json(&self.client, &self.url, self.name()).await?;
        parse_decimal(&ticker.price, self.name())
    }
}

// ==================== KRAKEN ====================

pub struct KrakenFeed {
    client: Client,
    url: String,
}

impl KrakenFeed {
    pub fn new(client: Client, url: String) -> Self {
        Self { client, url }
    }
}

// {"error":[],"result":{"SOLUSD":{"c":["152.31","0.5"], ...}}}
#[derive(Debug, Deserialize)]
struct KrakenTickerResponse {
    #[serde(default)]
    error: Vec<String>,
    #[serde(default)]
    result: HashMap<String, KrakenPair>,
}

#[derive(Debug, Deserialize)]
struct KrakenPair {
    /// Last trade closed: [price, lot volume].
    c: Vec<String>,
}

fn kraken_rate(payload: &KrakenTickerResponse) -> Result<Decimal> {
    if !payload.error.is_empty() {
        return Err(AppError::ExternalAPI(format!(
            "Kraken error: {}",
            payload.error.join("; ")
        )));
    }
    let last = payload
        .result
        .values()
        .find_map(|pair| pair.c.first())
        .ok_or_else(|| AppError::ExternalAPI("Kraken payload has no ticker".to_string()))?;
    parse_decimal(last, PROVIDER_KRAKEN)
}

#[async_trait]
impl PriceProvider for KrakenFeed {
    fn name(&self) -> &'static str {
        PROVIDER_KRAKEN
    }

    async fn fetch_rate(&self) -> Result<Decimal> {
        let payload: KrakenTickerResponse = get_json(&self.client, &self.url, self.name()).await?;
        kraken_rate(&payload)
    }
}
