use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::net::IpAddr;
use std::sync::Arc;

use crate::{
    config::Config,
    constants::{INSUFFICIENT_FUNDS_MESSAGE, MAX_COMMIT_ATTEMPTS},
    db::LedgerStore,
    error::AppError,
    models::{AdjustmentRequest, AdjustmentResponse, BalanceJob, RawAdjustment},
    services::{
        balance_calculator::{
            format_balance, BalanceCalculator, BalancePreview, PendingBets, Preview, Stake,
        },
        cache_sync::CacheSynchronizer,
        idempotency::{replay_response, Claim, IdempotencyGuard},
        job_dispatcher::JobDispatcher,
        price_oracle::PriceOracle,
        request_validator::{RequestValidator, ValidatorSettings},
        store::{CommitOutcome, SharedStore},
    },
};

/// Failure while processing a claimed request.
struct Failure {
    error: AppError,
    /// Whether the idempotency placeholder may be dropped. False once a
    /// balance write may have landed.
    release: bool,
}

impl From<AppError> for Failure {
    fn from(error: AppError) -> Self {
        Self {
            error,
            release: true,
        }
    }
}

/// End-to-end handling of one balance adjustment:
/// validate, claim, price, preview, commit, record, dispatch.
pub struct AdjustmentService {
    validator: RequestValidator,
    guard: IdempotencyGuard,
    oracle: Arc<PriceOracle>,
    calculator: BalanceCalculator,
    pending: PendingBets,
    cache: CacheSynchronizer,
    jobs: JobDispatcher,
}

impl AdjustmentService {
    pub fn new(
        config: &Config,
        store: Arc<dyn SharedStore>,
        ledger: Arc<dyn LedgerStore>,
        oracle: Arc<PriceOracle>,
        jobs: JobDispatcher,
    ) -> Self {
        Self {
            validator: RequestValidator::new(
                store.clone(),
                &config.signing_secret,
                ValidatorSettings::from_config(config),
            ),
            guard: IdempotencyGuard::new(store.clone(), config.idempotency_ttl_secs),
            oracle,
            calculator: BalanceCalculator::new(config.minor_units_per_coin),
            pending: PendingBets::new(store.clone(), config.pending_bet_ttl_secs),
            cache: CacheSynchronizer::new(store, ledger),
            jobs,
        }
    }

    pub async fn handle(
        &self,
        raw: &RawAdjustment,
        origin: Option<IpAddr>,
    ) -> (StatusCode, AdjustmentResponse) {
        let now = Utc::now();

        let request = match self.validator.validate(raw, origin, now).await {
            Ok(request) => request,
            Err(err) => {
                let username = self.validator.username_hint(raw);
                return self.error_response(err, username.as_deref()).await;
            }
        };

        match self.guard.claim(&request.username, &request.uniqid, now).await {
            Ok(Claim::Fresh) => {}
            Ok(Claim::Duplicate(stored)) => {
                tracing::info!(
                    "Duplicate adjustment user={} uniqid={} replayed={}",
                    request.username,
                    request.uniqid,
                    stored.is_some()
                );
                return (StatusCode::OK, self.replay(stored, &request.username, now).await);
            }
            Err(err) => return self.error_response(err, Some(&request.username)).await,
        }

        match self.process(&request, now).await {
            Ok(response) => (StatusCode::OK, response),
            Err(Failure { error, release }) => {
                if release {
                    self.guard.release(&request.username, &request.uniqid).await;
                }
                tracing::warn!(
                    "Adjustment failed user={} uniqid={} placeholder_released={}: {}",
                    request.username,
                    request.uniqid,
                    release,
                    error
                );
                self.error_response(error, Some(&request.username)).await
            }
        }
    }

    async fn process(
        &self,
        request: &AdjustmentRequest,
        now: DateTime<Utc>,
    ) -> Result<AdjustmentResponse, Failure> {
        let username = request.username.as_str();

        // One rate for the whole request.
        let quote = self.oracle.get_synchronized_rate(username).await?;
        let stake = self
            .pending
            .effective_amount(request.tx_type, request.amount, username, request.gpid.as_deref())
            .await?;

        let result = self.apply(request, now, quote.rate, stake.amount).await;
        if let (Err(failure), Some(gpid)) = (&result, stake.claimed_round.as_deref()) {
            self.return_stake(username, gpid, &stake, failure).await;
        }
        result
    }

    async fn apply(
        &self,
        request: &AdjustmentRequest,
        now: DateTime<Utc>,
        rate: Decimal,
        amount: Decimal,
    ) -> Result<AdjustmentResponse, Failure> {
        let username = request.username.as_str();
        let gpid = request.gpid.as_deref();

        let mut committed: Option<(BalancePreview, u64)> = None;
        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            let loaded = self.cache.load(username).await?;
            let preview = match self
                .calculator
                .preview(request.tx_type, amount, loaded.minor, rate)?
            {
                Preview::Apply(preview) => preview,
                Preview::InsufficientFunds { start_display } => {
                    tracing::warn!(
                        "Insufficient funds user={} uniqid={} type={} amount={} balance_minor={}",
                        username,
                        request.uniqid,
                        request.tx_type.as_str(),
                        amount,
                        loaded.minor
                    );
                    let response = AdjustmentResponse::rejected(
                        format_balance(start_display),
                        INSUFFICIENT_FUNDS_MESSAGE,
                        now,
                    );
                    self.guard
                        .complete(username, &request.uniqid, &response, now)
                        .await?;
                    return Ok(response);
                }
            };

            let (outcome, stamp) = self
                .cache
                .commit(username, &loaded, preview.new_minor)
                .await
                .map_err(|error| Failure {
                    error,
                    release: false,
                })?;
            match outcome {
                CommitOutcome::Written => {
                    committed = Some((preview, stamp));
                    break;
                }
                CommitOutcome::StaleTimestamp { stored } => tracing::debug!(
                    "Commit skipped, newer write stored={} user={} attempt={}",
                    stored,
                    username,
                    attempt
                ),
                CommitOutcome::BalanceMoved { current } => tracing::debug!(
                    "Commit skipped, balance moved to {:?} user={} attempt={}",
                    current,
                    username,
                    attempt
                ),
            }
        }

        let Some((preview, write_timestamp)) = committed else {
            return Err(AppError::CommitContention(username.to_string()).into());
        };

        tracing::info!(
            "Adjustment applied user={} uniqid={} type={} amount={} rate={} minor {} -> {}",
            username,
            request.uniqid,
            request.tx_type.as_str(),
            amount,
            rate,
            preview.start_minor,
            preview.new_minor
        );

        let response = AdjustmentResponse::success(format_balance(preview.new_display), now);

        // The balance is committed; from here on nothing may fail the request.
        if let Err(err) = self
            .guard
            .complete(username, &request.uniqid, &response, now)
            .await
        {
            tracing::error!(
                "Failed to store response user={} uniqid={}: {}",
                username,
                request.uniqid,
                err
            );
        }
        if let Err(err) = self
            .pending
            .settle(request.tx_type, amount, username, gpid)
            .await
        {
            tracing::warn!(
                "Round bookkeeping failed user={} gpid={:?}: {}",
                username,
                gpid,
                err
            );
        }

        self.jobs.dispatch(BalanceJob {
            username: username.to_string(),
            login: request.login.clone(),
            uniqid: request.uniqid.clone(),
            tx_type: request.tx_type,
            amount,
            gpid: request.gpid.clone(),
            game_id: request.game_id.clone(),
            subtype: request.subtype.clone(),
            custom_data: request.custom_data.clone(),
            request_timestamp: request.timestamp,
            rate,
            balance_before_minor: preview.start_minor,
            balance_after_minor: preview.new_minor,
            write_timestamp,
            processed_at: now,
        });

        Ok(response)
    }

    // A claimed round stake goes back unless the refund may have landed.
    async fn return_stake(&self, username: &str, gpid: &str, stake: &Stake, failure: &Failure) {
        if !failure.release {
            tracing::error!(
                "Round stake {} claimed but refund outcome unknown user={} gpid={}",
                stake.amount,
                username,
                gpid
            );
            return;
        }
        if let Err(err) = self.pending.restore(username, gpid, stake.amount).await {
            tracing::error!(
                "Failed to restore round stake {} user={} gpid={}: {}",
                stake.amount,
                username,
                gpid,
                err
            );
        }
    }

    async fn replay(
        &self,
        stored: Option<AdjustmentResponse>,
        username: &str,
        now: DateTime<Utc>,
    ) -> AdjustmentResponse {
        match self.best_effort_balance(Some(username)).await {
            Some(balance) => replay_response(stored, balance, now),
            None => match stored {
                Some(original) => original,
                None => replay_response(None, "0".to_string(), now),
            },
        }
    }

    /// Current display balance without contacting a price provider.
    async fn best_effort_balance(&self, username: Option<&str>) -> Option<String> {
        let minor = self.cache.best_effort_minor(username?).await?;
        let quote = self.oracle.offline_rate().await?;
        self.calculator
            .to_display(minor, quote.rate)
            .ok()
            .map(format_balance)
    }

    async fn error_response(
        &self,
        err: AppError,
        username: Option<&str>,
    ) -> (StatusCode, AdjustmentResponse) {
        let status = err.status_code();
        if status.is_server_error() {
            tracing::error!("Adjustment request failed: {}", err);
        } else if err.is_security() {
            tracing::warn!("Security rejection user={:?}: {}", username, err);
        }
        let balance = self.best_effort_balance(username).await;
        (status, err.to_body(balance))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::db::memory::MemoryLedger;
    use crate::integrations::PriceProvider;
    use crate::services::job_dispatcher::DispatcherSettings;
    use crate::services::price_oracle::{testing::ScriptedProvider, OracleSettings};
    use crate::services::request_validator::testing::{resign, signed_body};
    use crate::services::store::{keys, memory::MemoryStore, BalanceWrite};
    use async_trait::async_trait;
    use crate::models::PriceQuote;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
    use tokio::task::JoinHandle;

    /// Yields before every call so concurrent requests interleave.
    struct InterleavingStore {
        inner: Arc<MemoryStore>,
        /// Report every balance commit as lost to a concurrent writer.
        contended: AtomicBool,
    }

    #[async_trait]
    impl SharedStore for InterleavingStore {
        async fn get(&self, key: &str) -> crate::error::Result<Option<String>> {
            tokio::task::yield_now().await;
            self.inner.get(key).await
        }
        async fn set_ex(&self, key: &str, value: &str, ttl: u64) -> crate::error::Result<()> {
            tokio::task::yield_now().await;
            self.inner.set_ex(key, value, ttl).await
        }
        async fn set_nx_ex(&self, key: &str, value: &str, ttl: u64) -> crate::error::Result<bool> {
            tokio::task::yield_now().await;
            self.inner.set_nx_ex(key, value, ttl).await
        }
        async fn del(&self, key: &str) -> crate::error::Result<()> {
            tokio::task::yield_now().await;
            self.inner.del(key).await
        }
        async fn exists(&self, key: &str) -> crate::error::Result<bool> {
            tokio::task::yield_now().await;
            self.inner.exists(key).await
        }
        async fn push_ex(&self, key: &str, value: &str, ttl: u64) -> crate::error::Result<()> {
            tokio::task::yield_now().await;
            self.inner.push_ex(key, value, ttl).await
        }
        async fn list(&self, key: &str) -> crate::error::Result<Vec<String>> {
            tokio::task::yield_now().await;
            self.inner.list(key).await
        }
        async fn take_list(&self, key: &str) -> crate::error::Result<Vec<String>> {
            tokio::task::yield_now().await;
            self.inner.take_list(key).await
        }
        async fn read_balance(
            &self,
            balance_key: &str,
            timestamp_key: &str,
        ) -> crate::error::Result<Option<(i64, u64)>> {
            tokio::task::yield_now().await;
            self.inner.read_balance(balance_key, timestamp_key).await
        }
        async fn commit_balance(&self, write: &BalanceWrite) -> crate::error::Result<CommitOutcome> {
            tokio::task::yield_now().await;
            if self.contended.load(AtomicOrdering::SeqCst) {
                return Ok(CommitOutcome::BalanceMoved { current: None });
            }
            self.inner.commit_balance(write).await
        }
        async fn append_stream(
            &self,
            stream: &str,
            max_len: usize,
            fields: &[(&str, String)],
        ) -> crate::error::Result<String> {
            self.inner.append_stream(stream, max_len, fields).await
        }
        async fn ping(&self) -> crate::error::Result<()> {
            Ok(())
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        ledger: Arc<MemoryLedger>,
        interleaving: Option<Arc<InterleavingStore>>,
        service: Arc<AdjustmentService>,
        jobs: Option<JoinHandle<()>>,
    }

    impl Harness {
        fn build(
            shared: Arc<dyn SharedStore>,
            store: Arc<MemoryStore>,
            providers: Vec<Arc<dyn PriceProvider>>,
        ) -> Self {
            let config = test_config();
            let ledger = Arc::new(MemoryLedger::new());
            let oracle = Arc::new(PriceOracle::new(
                shared.clone(),
                ledger.clone(),
                providers,
                OracleSettings::from_config(&config),
            ));
            let (jobs, handle) = JobDispatcher::start(
                shared.clone(),
                DispatcherSettings {
                    stream: config.job_stream.clone(),
                    max_len: config.job_stream_max_len,
                    capacity: config.job_queue_capacity,
                    signing_secret: None,
                },
            );
            let service = AdjustmentService::new(&config, shared, ledger.clone(), oracle, jobs);
            store.put(&keys::session("alice"), "1");
            Self {
                store,
                ledger,
                interleaving: None,
                service: Arc::new(service),
                jobs: Some(handle),
            }
        }

        fn new() -> Self {
            let store = Arc::new(MemoryStore::new());
            Self::build(store.clone(), store, vec![ScriptedProvider::ok("primary", Decimal::from(100)) as Arc<dyn PriceProvider>])
        }

        fn interleaving() -> Self {
            let store = Arc::new(MemoryStore::new());
            let shared = Arc::new(InterleavingStore {
                inner: store.clone(),
                contended: AtomicBool::new(false),
            });
            let mut harness = Self::build(
                shared.clone(),
                store,
                vec![ScriptedProvider::ok("primary", Decimal::from(100)) as Arc<dyn PriceProvider>],
            );
            harness.interleaving = Some(shared);
            harness
        }

        fn set_balance(&self, minor: i64) {
            self.store.put(&keys::balance("alice"), &minor.to_string());
        }

        fn balance(&self) -> Option<String> {
            self.store.raw(&keys::balance("alice"))
        }

        async fn send(&self, raw: &RawAdjustment) -> (StatusCode, AdjustmentResponse) {
            self.service.handle(raw, None).await
        }

        /// Stops the dispatcher and returns the job stream.
        async fn drain_jobs(mut self) -> Vec<Vec<(String, String)>> {
            let store = self.store.clone();
            let handle = self.jobs.take();
            drop(self.service);
            if let Some(handle) = handle {
                handle.await.unwrap();
            }
            store.stream(crate::constants::DEFAULT_JOB_STREAM)
        }
    }

    #[tokio::test]
    async fn bet_scenario_applies_once_and_replays_identically() {
        let h = Harness::new();
        h.set_balance(500_000);
        let raw = signed_body("bet", json!(50_000), "tx-1", Utc::now());

        let (status, first) = h.send(&raw).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first.status, "1");
        assert_eq!(first.balance, "450000.00");
        assert!(first.errormsg.is_none());
        assert_eq!(h.balance().as_deref(), Some("450000"));

        let (status, second) = h.send(&raw).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second, first);
        assert_eq!(h.balance().as_deref(), Some("450000"));

        let jobs = h.drain_jobs().await;
        assert_eq!(jobs.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_duplicates_mutate_once() {
        let h = Harness::new();
        h.set_balance(500_000);
        let raw = signed_body("bet", json!(50_000), "tx-dup", Utc::now());

        let (a, b) = tokio::join!(h.send(&raw), h.send(&raw));
        assert_eq!(a.0, StatusCode::OK);
        assert_eq!(b.0, StatusCode::OK);
        assert_eq!(h.balance().as_deref(), Some("450000"));
    }

    #[tokio::test]
    async fn replay_reflects_later_balance_changes() {
        let h = Harness::new();
        h.set_balance(500_000);
        let bet = signed_body("bet", json!(50_000), "tx-1", Utc::now());
        let (_, first) = h.send(&bet).await;

        let win = signed_body("win", json!(1_000), "tx-2", Utc::now());
        h.send(&win).await;

        let (_, replay) = h.send(&bet).await;
        assert_eq!(replay.status, first.status);
        assert_eq!(replay.timestamp, first.timestamp);
        assert_eq!(replay.balance, "451000.00");
    }

    #[tokio::test]
    async fn tampered_request_is_forbidden_and_leaves_balance() {
        let h = Harness::new();
        h.set_balance(500_000);
        // Cold rate cache: the echo uses the last persisted rate.
        h.ledger
            .record_price(&PriceQuote::new(Decimal::from(100), "CoinGecko"))
            .await
            .unwrap();

        let mut raw = signed_body("bet", json!(50_000), "tx-1", Utc::now());
        raw.amount = Some(json!(100_000));
        let (status, body) = h.send(&raw).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body.status, "0");
        assert_eq!(body.balance, "500000.00");
        assert_eq!(h.balance().as_deref(), Some("500000"));
        assert!(h
            .store
            .raw(&keys::idempotency("alice", "tx-1"))
            .is_none());
    }

    #[tokio::test]
    async fn insufficient_funds_is_business_rejection() {
        let h = Harness::new();
        h.set_balance(1_000);
        let raw = signed_body("bet", json!(5_000), "tx-1", Utc::now());

        let (status, body) = h.send(&raw).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.status, "0");
        assert_eq!(body.balance, "1000.00");
        assert_eq!(body.errormsg.as_deref(), Some(INSUFFICIENT_FUNDS_MESSAGE));
        assert_eq!(h.balance().as_deref(), Some("1000"));

        // Replayed, not re-evaluated, even after a deposit.
        h.set_balance(10_000);
        let (_, again) = h.send(&raw).await;
        assert_eq!(again.errormsg.as_deref(), Some(INSUFFICIENT_FUNDS_MESSAGE));
        assert_eq!(h.balance().as_deref(), Some("10000"));
    }

    #[tokio::test]
    async fn concurrent_distinct_adjustments_both_land() {
        let h = Harness::interleaving();
        h.set_balance(500_000);
        let bet = signed_body("bet", json!(20_000), "tx-a", Utc::now());
        let win = signed_body("win", json!(7_500), "tx-b", Utc::now());
        let cancel = signed_body("cancelwin", json!(2_500), "tx-c", Utc::now());

        let (a, b, c) = tokio::join!(h.send(&bet), h.send(&win), h.send(&cancel));
        for (status, body) in [a, b, c] {
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body.status, "1");
        }
        assert_eq!(h.balance().as_deref(), Some("485000"));
    }

    #[tokio::test]
    async fn balance_never_goes_negative_across_a_sequence() {
        let h = Harness::new();
        h.set_balance(100);
        let steps = [
            ("bet", 60, "1"),
            ("bet", 60, "0"),
            ("win", 10, "1"),
            ("cancelwin", 100, "0"),
            ("bet", 50, "1"),
            ("cancelwin", 1, "0"),
        ];
        for (i, (tx_type, amount, expected)) in steps.into_iter().enumerate() {
            let raw = signed_body(tx_type, json!(amount), &format!("seq-{}", i), Utc::now());
            let (_, body) = h.send(&raw).await;
            assert_eq!(body.status, expected, "step {}", i);
            let minor: i64 = h.balance().unwrap().parse().unwrap();
            assert!(minor >= 0);
        }
        assert_eq!(h.balance().as_deref(), Some("0"));
    }

    #[tokio::test]
    async fn round_cancel_without_amount_refunds_stake() {
        let h = Harness::new();
        h.set_balance(1_000);
        h.send(&signed_body("bet", json!(100), "b1", Utc::now())).await;
        h.send(&signed_body("bet", json!(50), "b2", Utc::now())).await;
        assert_eq!(h.balance().as_deref(), Some("850"));

        let (_, body) = h
            .send(&signed_body("cancel", json!(0), "c1", Utc::now()))
            .await;
        assert_eq!(body.status, "1");
        assert_eq!(h.balance().as_deref(), Some("1000"));
        assert!(h
            .store
            .list(&keys::pending_bet("alice", "round-1"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn concurrent_round_cancels_refund_the_stake_once() {
        let h = Harness::interleaving();
        h.set_balance(1_000);
        h.send(&signed_body("bet", json!(100), "b1", Utc::now())).await;
        assert_eq!(h.balance().as_deref(), Some("900"));

        let c1 = signed_body("cancel", json!(0), "c1", Utc::now());
        let c2 = signed_body("cancel", json!(0), "c2", Utc::now());
        let (a, b) = tokio::join!(h.send(&c1), h.send(&c2));
        assert_eq!(a.1.status, "1");
        assert_eq!(b.1.status, "1");
        assert_eq!(h.balance().as_deref(), Some("1000"));
    }

    #[tokio::test]
    async fn failed_round_cancel_puts_the_stake_back() {
        let h = Harness::interleaving();
        h.set_balance(1_000);
        h.send(&signed_body("bet", json!(100), "b1", Utc::now())).await;

        // Contention on every attempt: the refund never lands.
        h.interleaving
            .as_ref()
            .unwrap()
            .contended
            .store(true, AtomicOrdering::SeqCst);
        let (status, _) = h
            .send(&signed_body("cancel", json!(0), "c1", Utc::now()))
            .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(h.balance().as_deref(), Some("900"));
        assert_eq!(
            h.store.list(&keys::pending_bet("alice", "round-1")).await.unwrap(),
            vec!["100"]
        );
    }

    #[tokio::test]
    async fn price_outage_is_503_and_releases_claim() {
        let store = Arc::new(MemoryStore::new());
        let h = Harness::build(
            store.clone(),
            store,
            vec![ScriptedProvider::failing("primary") as Arc<dyn PriceProvider>],
        );
        h.set_balance(500_000);
        let raw = signed_body("bet", json!(10), "tx-1", Utc::now());

        let (status, body) = h.send(&raw).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.status, "0");
        assert!(body.timestamp.is_none());
        assert_eq!(h.balance().as_deref(), Some("500000"));
        assert!(h.store.raw(&keys::idempotency("alice", "tx-1")).is_none());
    }

    #[tokio::test]
    async fn missing_session_is_forbidden() {
        let h = Harness::new();
        h.store.del(&keys::session("alice")).await.unwrap();
        let mut raw = signed_body("bet", json!(10), "tx-1", Utc::now());
        resign(&mut raw);
        let (status, body) = h.send(&raw).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body.errormsg.as_deref(), Some("Session invalid"));
    }

    #[tokio::test]
    async fn malformed_request_is_bad_request() {
        let h = Harness::new();
        let raw = RawAdjustment {
            command: Some(json!("balance_adj")),
            ..Default::default()
        };
        let (status, body) = h.send(&raw).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.balance, "0");
    }
}
