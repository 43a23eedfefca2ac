use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::time::timeout;

use crate::{
    config::Config,
    constants::{MAX_TEST_LOCK_SECS, TEST_LOCK_REFRESH_SECS},
    db::LedgerStore,
    error::{AppError, Result},
    integrations::PriceProvider,
    models::{OracleStatus, PriceQuote, TestModeLock},
    services::price_guard::{sanitize_rate, RateBand},
    services::store::{keys, SharedStore},
};

const SOURCE_TEST_LOCK: &str = "test_lock";

#[derive(Debug, Clone)]
pub struct OracleSettings {
    pub local_ttl: Duration,
    pub shared_ttl_secs: u64,
    pub provider_timeout: Duration,
    pub lock_refresh: Duration,
    pub band: RateBand,
}

impl OracleSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            local_ttl: Duration::from_secs(config.local_price_ttl_secs),
            shared_ttl_secs: config.shared_price_ttl_secs,
            provider_timeout: Duration::from_millis(config.provider_timeout_ms),
            lock_refresh: Duration::from_secs(TEST_LOCK_REFRESH_SECS),
            band: RateBand::new(config.min_rate, config.max_rate),
        }
    }
}

struct LocalQuote {
    quote: PriceQuote,
    valid_until: Instant,
}

struct LockMemo {
    checked_at: Instant,
    lock: Option<TestModeLock>,
}

/// Conversion-rate oracle.
///
/// Resolution order: test-mode lock, process-local cache, shared cache,
/// live providers in priority order, last persisted record. When every tier
/// fails the caller gets [`AppError::PriceUnavailable`]; no rate is ever made up.
pub struct PriceOracle {
    store: Arc<dyn SharedStore>,
    ledger: Arc<dyn LedgerStore>,
    providers: Vec<Arc<dyn PriceProvider>>,
    settings: OracleSettings,
    local: RwLock<Option<LocalQuote>>,
    lock_memo: RwLock<Option<LockMemo>>,
}

impl PriceOracle {
    pub fn new(
        store: Arc<dyn SharedStore>,
        ledger: Arc<dyn LedgerStore>,
        providers: Vec<Arc<dyn PriceProvider>>,
        settings: OracleSettings,
    ) -> Self {
        Self {
            store,
            ledger,
            providers,
            settings,
            local: RwLock::new(None),
            lock_memo: RwLock::new(None),
        }
    }

    /// Pre-fetches a rate so the first adjustment does not pay for it.
    pub async fn warm_up(&self) {
        match self.get_rate().await {
            Ok(quote) => tracing::info!(
                "Price oracle warmed up rate={} source={}",
                quote.rate,
                quote.source
            ),
            Err(err) => tracing::warn!("Price oracle warm-up failed: {}", err),
        }
    }

    pub async fn shutdown(&self) {
        *self.local.write().await = None;
        *self.lock_memo.write().await = None;
        tracing::info!("Price oracle state cleared");
    }

    /// Lock and cache tiers only. Never calls a provider.
    pub async fn cached_rate(&self) -> Option<PriceQuote> {
        if let Some(lock) = self.active_lock().await {
            let quote = PriceQuote {
                rate: lock.locked_rate,
                fetched_at: Utc::now(),
                source: SOURCE_TEST_LOCK.to_string(),
            };
            let in_sync = self
                .local_quote()
                .await
                .is_some_and(|q| q.rate == quote.rate && q.source == quote.source);
            if !in_sync {
                // Lower tiers must not outlive the lock.
                let remaining = (lock.expiry - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                self.populate_local_for(&quote, remaining.min(self.settings.local_ttl))
                    .await;
                self.populate_shared_for(
                    &quote,
                    remaining.as_secs().clamp(1, self.settings.shared_ttl_secs),
                )
                .await;
            }
            return Some(quote);
        }

        if let Some(quote) = self.local_quote().await {
            return Some(quote);
        }

        match self.shared_quote().await {
            Ok(Some(quote)) => {
                self.populate_local(&quote).await;
                Some(quote)
            }
            Ok(None) => None,
            Err(err) => {
                tracing::warn!("Shared price cache unavailable: {}", err);
                None
            }
        }
    }

    /// Rate for echoing a balance on rejections and replays: the cached
    /// tiers, then the last persisted record inside the sanity band.
    /// Never calls a provider.
    pub async fn offline_rate(&self) -> Option<PriceQuote> {
        if let Some(quote) = self.cached_rate().await {
            return Some(quote);
        }
        match self.ledger.latest_price().await {
            Ok(quote) => quote.filter(|q| self.settings.band.contains(q.rate)),
            Err(err) => {
                tracing::warn!("Last-known-good lookup failed: {}", err);
                None
            }
        }
    }

    pub async fn get_rate(&self) -> Result<PriceQuote> {
        if let Some(quote) = self.cached_rate().await {
            return Ok(quote);
        }

        if let Some(quote) = self.emergency_fetch().await {
            self.populate_local(&quote).await;
            self.populate_shared(&quote).await;
            self.persist(&quote);
            return Ok(quote);
        }

        match self.ledger.latest_price().await {
            Ok(Some(quote)) if self.settings.band.contains(quote.rate) => {
                tracing::warn!(
                    "Using last-known-good rate={} recorded_at={}",
                    quote.rate,
                    quote.fetched_at
                );
                return Ok(quote);
            }
            Ok(Some(quote)) => {
                tracing::error!("Last-known-good rate {} outside sanity band", quote.rate)
            }
            Ok(None) => tracing::error!("No persisted price record available"),
            Err(err) => tracing::error!("Last-known-good lookup failed: {}", err),
        }

        tracing::error!("Price oracle exhausted every tier");
        Err(AppError::PriceUnavailable(
            "all price sources failed".to_string(),
        ))
    }

    /// Rate for one adjustment, re-checked against the sanity band.
    pub async fn get_synchronized_rate(&self, username: &str) -> Result<PriceQuote> {
        let quote = self.get_rate().await?;
        if sanitize_rate(quote.rate, &self.settings.band).is_none() {
            tracing::error!(
                "Rejecting implausible rate={} source={} user={}",
                quote.rate,
                quote.source,
                username
            );
            return Err(AppError::PriceUnavailable(format!(
                "rate {} outside sanity band",
                quote.rate
            )));
        }
        Ok(quote)
    }

    /// Freezes the current rate for `duration_secs` across every instance.
    pub async fn lock(&self, duration_secs: u64) -> Result<TestModeLock> {
        if duration_secs == 0 || duration_secs > MAX_TEST_LOCK_SECS {
            return Err(AppError::BadRequest(format!(
                "duration_seconds must be between 1 and {}",
                MAX_TEST_LOCK_SECS
            )));
        }

        let snapshot = self.get_rate().await?;
        let lock = TestModeLock {
            active: true,
            locked_rate: snapshot.rate,
            expiry: Utc::now() + chrono::Duration::seconds(duration_secs as i64),
        };
        let payload = serde_json::to_string(&lock)
            .map_err(|e| AppError::Internal(format!("Failed to encode test lock: {}", e)))?;
        self.store
            .set_ex(keys::TEST_MODE_LOCK, &payload, duration_secs)
            .await?;

        *self.lock_memo.write().await = Some(LockMemo {
            checked_at: Instant::now(),
            lock: Some(lock.clone()),
        });
        tracing::warn!(
            "Price oracle test-mode lock engaged rate={} until={}",
            lock.locked_rate,
            lock.expiry
        );
        Ok(lock)
    }

    pub async fn unlock(&self) -> Result<()> {
        self.store.del(keys::TEST_MODE_LOCK).await?;
        // Caches may still hold the frozen rate.
        self.store.del(keys::SHARED_PRICE).await?;
        *self.local.write().await = None;
        *self.lock_memo.write().await = Some(LockMemo {
            checked_at: Instant::now(),
            lock: None,
        });
        tracing::warn!("Price oracle test-mode lock released");
        Ok(())
    }

    pub async fn status(&self) -> OracleStatus {
        let lock = self.active_lock().await;
        let cached = self.cached_rate().await;
        OracleStatus {
            locked: lock.is_some(),
            locked_rate: lock.as_ref().map(|l| l.locked_rate),
            lock_expiry: lock.as_ref().map(|l| l.expiry),
            cached_rate: cached.as_ref().map(|q| q.rate),
            cached_source: cached.map(|q| q.source),
        }
    }

    // Lock state is re-read from the shared store at most once per refresh window.
    async fn active_lock(&self) -> Option<TestModeLock> {
        let now = Utc::now();
        {
            let memo = self.lock_memo.read().await;
            if let Some(memo) = memo.as_ref() {
                if memo.checked_at.elapsed() < self.settings.lock_refresh {
                    return memo.lock.clone().filter(|l| l.is_effective(now));
                }
            }
        }

        let lock = match self.store.get(keys::TEST_MODE_LOCK).await {
            Ok(Some(raw)) => match serde_json::from_str::<TestModeLock>(&raw) {
                Ok(lock) => Some(lock),
                Err(err) => {
                    tracing::warn!("Ignoring malformed test-mode lock: {}", err);
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                tracing::warn!("Test-mode lock lookup failed, keeping last state: {}", err);
                let memo = self.lock_memo.read().await;
                return memo
                    .as_ref()
                    .and_then(|m| m.lock.clone())
                    .filter(|l| l.is_effective(now));
            }
        };

        *self.lock_memo.write().await = Some(LockMemo {
            checked_at: Instant::now(),
            lock: lock.clone(),
        });
        lock.filter(|l| l.is_effective(now))
    }

    async fn local_quote(&self) -> Option<PriceQuote> {
        let local = self.local.read().await;
        local
            .as_ref()
            .filter(|entry| Instant::now() < entry.valid_until)
            .map(|entry| entry.quote.clone())
    }

    async fn shared_quote(&self) -> Result<Option<PriceQuote>> {
        let Some(raw) = self.store.get(keys::SHARED_PRICE).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<PriceQuote>(&raw) {
            Ok(quote) => Ok(Some(quote)),
            Err(err) => {
                tracing::warn!("Ignoring malformed shared price entry: {}", err);
                Ok(None)
            }
        }
    }

    async fn emergency_fetch(&self) -> Option<PriceQuote> {
        for provider in &self.providers {
            let name = provider.name();
            match timeout(self.settings.provider_timeout, provider.fetch_rate()).await {
                Ok(Ok(rate)) => match sanitize_rate(rate, &self.settings.band) {
                    Some(rate) => {
                        tracing::info!("Fetched rate={} from {}", rate, name);
                        return Some(PriceQuote::new(rate, name));
                    }
                    None => tracing::warn!("{} returned implausible rate {}", name, rate),
                },
                Ok(Err(err)) => tracing::warn!("{} price fetch failed: {}", name, err),
                Err(_) => tracing::warn!(
                    "{} price fetch timed out after {}ms",
                    name,
                    self.settings.provider_timeout.as_millis()
                ),
            }
        }
        None
    }

    async fn populate_local(&self, quote: &PriceQuote) {
        self.populate_local_for(quote, self.settings.local_ttl).await;
    }

    async fn populate_local_for(&self, quote: &PriceQuote, ttl: Duration) {
        *self.local.write().await = Some(LocalQuote {
            quote: quote.clone(),
            valid_until: Instant::now() + ttl,
        });
    }

    async fn populate_shared(&self, quote: &PriceQuote) {
        self.populate_shared_for(quote, self.settings.shared_ttl_secs)
            .await;
    }

    async fn populate_shared_for(&self, quote: &PriceQuote, ttl_secs: u64) {
        let payload = match serde_json::to_string(quote) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!("Failed to encode price quote: {}", err);
                return;
            }
        };
        if let Err(err) = self
            .store
            .set_ex(keys::SHARED_PRICE, &payload, ttl_secs)
            .await
        {
            tracing::warn!("Failed to populate shared price cache: {}", err);
        }
    }

    // Last-known-good history; written off the request path.
    fn persist(&self, quote: &PriceQuote) {
        let ledger = self.ledger.clone();
        let quote = quote.clone();
        tokio::spawn(async move {
            if let Err(err) = ledger.record_price(&quote).await {
                tracing::warn!("Failed to persist price record: {}", err);
            }
        });
    }

    #[cfg(test)]
    pub(crate) async fn expire_local(&self) {
        *self.local.write().await = None;
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::db::memory::MemoryLedger;
    use crate::services::store::memory::MemoryStore;

    fn oracle_with(
        store: Arc<MemoryStore>,
        ledger: Arc<MemoryLedger>,
        providers: Vec<Arc<ScriptedProvider>>,
    ) -> PriceOracle {
        let providers = providers
            .into_iter()
            .map(|p| p as Arc<dyn PriceProvider>)
            .collect();
        PriceOracle::new(store, ledger, providers, settings())
    }

    #[tokio::test]
    async fn primary_provider_wins_and_populates_caches() {
        let store = Arc::new(MemoryStore::new());
        let primary = ScriptedProvider::ok("primary", Decimal::from(150));
        let secondary = ScriptedProvider::ok("secondary", Decimal::from(151));
        let oracle = oracle_with(
            store.clone(),
            Arc::new(MemoryLedger::new()),
            vec![primary.clone(), secondary.clone()],
        );

        let quote = oracle.get_rate().await.unwrap();
        assert_eq!(quote.rate, Decimal::from(150));
        assert_eq!(secondary.call_count(), 0);
        assert!(store.raw(keys::SHARED_PRICE).is_some());

        // Served from the local cache afterwards.
        oracle.get_rate().await.unwrap();
        assert_eq!(primary.call_count(), 1);
    }

    #[tokio::test]
    async fn fetched_rate_is_persisted_for_last_known_good() {
        let ledger = Arc::new(MemoryLedger::new());
        let oracle = oracle_with(
            Arc::new(MemoryStore::new()),
            ledger.clone(),
            vec![ScriptedProvider::ok("primary", Decimal::from(150))],
        );
        oracle.get_rate().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let recorded = ledger.recorded_prices();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].source, "primary");
    }

    #[tokio::test]
    async fn cached_rate_never_calls_providers() {
        let primary = ScriptedProvider::ok("primary", Decimal::from(150));
        let oracle = oracle_with(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryLedger::new()),
            vec![primary.clone()],
        );
        assert!(oracle.cached_rate().await.is_none());
        assert_eq!(primary.call_count(), 0);
    }

    #[tokio::test]
    async fn failing_primary_falls_back_to_secondary() {
        let primary = ScriptedProvider::failing("primary");
        let secondary = ScriptedProvider::ok("secondary", Decimal::from(151));
        let oracle = oracle_with(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryLedger::new()),
            vec![primary.clone(), secondary],
        );

        let quote = oracle.get_rate().await.unwrap();
        assert_eq!(quote.rate, Decimal::from(151));
        assert_eq!(quote.source, "secondary");
        assert_eq!(primary.call_count(), 1);
    }

    #[tokio::test]
    async fn hung_primary_is_cut_off_by_timeout() {
        let oracle = oracle_with(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryLedger::new()),
            vec![
                ScriptedProvider::hanging("primary", Decimal::from(150)),
                ScriptedProvider::ok("secondary", Decimal::from(151)),
            ],
        );

        let started = Instant::now();
        let quote = oracle.get_rate().await.unwrap();
        assert_eq!(quote.rate, Decimal::from(151));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn implausible_provider_value_is_skipped() {
        let oracle = oracle_with(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryLedger::new()),
            vec![
                ScriptedProvider::ok("primary", Decimal::from(15_000_000)),
                ScriptedProvider::ok("secondary", Decimal::from(151)),
            ],
        );
        assert_eq!(oracle.get_rate().await.unwrap().rate, Decimal::from(151));
    }

    #[tokio::test]
    async fn all_providers_down_uses_last_known_good() {
        let ledger = Arc::new(MemoryLedger::new());
        ledger
            .record_price(&PriceQuote::new(Decimal::from(140), "CoinGecko"))
            .await
            .unwrap();
        let oracle = oracle_with(
            Arc::new(MemoryStore::new()),
            ledger,
            vec![
                ScriptedProvider::failing("primary"),
                ScriptedProvider::failing("secondary"),
                ScriptedProvider::failing("tertiary"),
            ],
        );
        assert_eq!(oracle.get_rate().await.unwrap().rate, Decimal::from(140));
    }

    #[tokio::test]
    async fn total_failure_is_fatal_not_zero() {
        let oracle = oracle_with(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryLedger::new()),
            vec![
                ScriptedProvider::failing("primary"),
                ScriptedProvider::failing("secondary"),
                ScriptedProvider::failing("tertiary"),
            ],
        );
        assert!(matches!(
            oracle.get_rate().await,
            Err(AppError::PriceUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn shared_cache_is_used_before_providers() {
        let store = Arc::new(MemoryStore::new());
        let cached = PriceQuote::new(Decimal::from(149), "Binance");
        store.put(keys::SHARED_PRICE, &serde_json::to_string(&cached).unwrap());
        let primary = ScriptedProvider::ok("primary", Decimal::from(150));
        let oracle = oracle_with(store, Arc::new(MemoryLedger::new()), vec![primary.clone()]);

        assert_eq!(oracle.get_rate().await.unwrap().rate, Decimal::from(149));
        assert_eq!(primary.call_count(), 0);
    }

    #[tokio::test]
    async fn test_mode_lock_freezes_rate_until_unlocked() {
        let store = Arc::new(MemoryStore::new());
        let primary = ScriptedProvider::ok("primary", Decimal::from(150));
        let oracle = oracle_with(store.clone(), Arc::new(MemoryLedger::new()), vec![primary]);

        let lock = oracle.lock(600).await.unwrap();
        assert_eq!(lock.locked_rate, Decimal::from(150));
        assert!(store.raw(keys::TEST_MODE_LOCK).is_some());

        // Another instance pushes a new live rate into the shared cache.
        store.put(
            keys::SHARED_PRICE,
            &serde_json::to_string(&PriceQuote::new(Decimal::from(170), "Kraken")).unwrap(),
        );
        oracle.expire_local().await;
        let quote = oracle.get_rate().await.unwrap();
        assert_eq!(quote.rate, Decimal::from(150));
        assert_eq!(quote.source, SOURCE_TEST_LOCK);

        let status = oracle.status().await;
        assert!(status.locked);
        assert_eq!(status.locked_rate, Some(Decimal::from(150)));

        oracle.unlock().await.unwrap();
        assert!(!oracle.status().await.locked);
        assert!(store.raw(keys::TEST_MODE_LOCK).is_none());
    }

    #[tokio::test]
    async fn lock_published_by_another_instance_is_honoured() {
        let store = Arc::new(MemoryStore::new());
        let lock = TestModeLock {
            active: true,
            locked_rate: Decimal::from(123),
            expiry: Utc::now() + chrono::Duration::minutes(5),
        };
        store.put(keys::TEST_MODE_LOCK, &serde_json::to_string(&lock).unwrap());
        let oracle = oracle_with(
            store,
            Arc::new(MemoryLedger::new()),
            vec![ScriptedProvider::ok("primary", Decimal::from(150))],
        );
        assert_eq!(oracle.get_rate().await.unwrap().rate, Decimal::from(123));
    }

    #[tokio::test]
    async fn expired_lock_is_ignored() {
        let store = Arc::new(MemoryStore::new());
        let lock = TestModeLock {
            active: true,
            locked_rate: Decimal::from(123),
            expiry: Utc::now() - chrono::Duration::seconds(1),
        };
        store.put(keys::TEST_MODE_LOCK, &serde_json::to_string(&lock).unwrap());
        let oracle = oracle_with(
            store,
            Arc::new(MemoryLedger::new()),
            vec![ScriptedProvider::ok("primary", Decimal::from(150))],
        );
        assert_eq!(oracle.get_rate().await.unwrap().rate, Decimal::from(150));
    }

    #[tokio::test]
    async fn locked_rate_is_written_down_once_and_bounded_by_the_lock() {
        let store = Arc::new(MemoryStore::new());
        let oracle = oracle_with(
            store.clone(),
            Arc::new(MemoryLedger::new()),
            vec![ScriptedProvider::ok("primary", Decimal::from(150))],
        );
        oracle.lock(2).await.unwrap();

        assert_eq!(oracle.cached_rate().await.unwrap().source, SOURCE_TEST_LOCK);
        assert!(store.ttl(keys::SHARED_PRICE).unwrap() <= Duration::from_secs(2));

        // Local tier already holds the locked rate: no further shared writes.
        store.del(keys::SHARED_PRICE).await.unwrap();
        assert_eq!(oracle.cached_rate().await.unwrap().rate, Decimal::from(150));
        assert!(store.raw(keys::SHARED_PRICE).is_none());
    }

    #[tokio::test]
    async fn frozen_rate_expires_with_the_lock() {
        let store = Arc::new(MemoryStore::new());
        let lock = TestModeLock {
            active: true,
            locked_rate: Decimal::from(123),
            expiry: Utc::now() + chrono::Duration::milliseconds(300),
        };
        store.put(keys::TEST_MODE_LOCK, &serde_json::to_string(&lock).unwrap());
        let oracle = oracle_with(
            store,
            Arc::new(MemoryLedger::new()),
            vec![ScriptedProvider::ok("primary", Decimal::from(150))],
        );
        assert_eq!(oracle.get_rate().await.unwrap().rate, Decimal::from(123));

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(oracle.get_rate().await.unwrap().rate, Decimal::from(150));
    }

    #[tokio::test]
    async fn offline_rate_falls_back_to_persisted_record_without_providers() {
        let ledger = Arc::new(MemoryLedger::new());
        let primary = ScriptedProvider::ok("primary", Decimal::from(150));
        let oracle = oracle_with(Arc::new(MemoryStore::new()), ledger.clone(), vec![primary.clone()]);
        assert!(oracle.offline_rate().await.is_none());

        ledger
            .record_price(&PriceQuote::new(Decimal::from(140), "CoinGecko"))
            .await
            .unwrap();
        assert_eq!(oracle.offline_rate().await.unwrap().rate, Decimal::from(140));

        ledger
            .record_price(&PriceQuote::new(Decimal::from(50_000), "corrupt"))
            .await
            .unwrap();
        assert!(oracle.offline_rate().await.is_none());
        assert_eq!(primary.call_count(), 0);
    }

    #[tokio::test]
    async fn lock_duration_is_bounded() {
        let oracle = oracle_with(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryLedger::new()),
            vec![ScriptedProvider::ok("primary", Decimal::from(150))],
        );
        assert!(matches!(oracle.lock(0).await, Err(AppError::BadRequest(_))));
        assert!(matches!(
            oracle.lock(MAX_TEST_LOCK_SECS + 1).await,
            Err(AppError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn synchronized_rate_rejects_corrupt_shared_value() {
        let store = Arc::new(MemoryStore::new());
        store.put(
            keys::SHARED_PRICE,
            &serde_json::to_string(&PriceQuote::new(Decimal::new(152, 9), "bad")).unwrap(),
        );
        let oracle = oracle_with(
            store,
            Arc::new(MemoryLedger::new()),
            vec![ScriptedProvider::ok("primary", Decimal::from(150))],
        );
        assert!(matches!(
            oracle.get_synchronized_rate("alice").await,
            Err(AppError::PriceUnavailable(_))
        ));
    }
}
