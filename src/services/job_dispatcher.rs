use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::{
    crypto::hash,
    error::{AppError, Result},
    models::BalanceJob,
    services::store::SharedStore,
};

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub stream: String,
    pub max_len: usize,
    pub capacity: usize,
    /// When set, each entry carries an HMAC of its payload for the worker.
    pub signing_secret: Option<String>,
}

/// Non-blocking hand-off of committed adjustments to the durable worker.
///
/// Requests push onto a bounded channel; one background consumer appends
/// each job to the shared stream. Failures are logged and never reach the
/// request that produced the job.
#[derive(Clone)]
pub struct JobDispatcher {
    tx: mpsc::Sender<BalanceJob>,
}

impl JobDispatcher {
    pub fn start(store: Arc<dyn SharedStore>, settings: DispatcherSettings) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(settings.capacity.max(1));
        let handle = tokio::spawn(consume(store, settings, rx));
        (Self { tx }, handle)
    }

    pub fn dispatch(&self, job: BalanceJob) {
        let uniqid = job.uniqid.clone();
        let username = job.username.clone();
        if let Err(err) = self.tx.try_send(job) {
            let reason = match err {
                mpsc::error::TrySendError::Full(_) => "queue full",
                mpsc::error::TrySendError::Closed(_) => "dispatcher stopped",
            };
            tracing::error!(
                "Balance job dropped ({}) user={} uniqid={}; durable reconciliation required",
                reason,
                username,
                uniqid
            );
        }
    }
}

async fn consume(
    store: Arc<dyn SharedStore>,
    settings: DispatcherSettings,
    mut rx: mpsc::Receiver<BalanceJob>,
) {
    tracing::info!("Job dispatcher consuming into stream {}", settings.stream);
    // recv() keeps yielding buffered jobs after every sender is gone.
    while let Some(job) = rx.recv().await {
        match publish(store.as_ref(), &settings, &job).await {
            Ok(id) => tracing::debug!(
                "Balance job queued id={} user={} uniqid={}",
                id,
                job.username,
                job.uniqid
            ),
            Err(err) => tracing::error!(
                "Failed to enqueue balance job user={} uniqid={}: {}",
                job.username,
                job.uniqid,
                err
            ),
        }
    }
    tracing::info!("Job dispatcher drained");
}

async fn publish(
    store: &dyn SharedStore,
    settings: &DispatcherSettings,
    job: &BalanceJob,
) -> Result<String> {
    let payload = serde_json::to_string(job)
        .map_err(|e| AppError::Internal(format!("Failed to encode balance job: {}", e)))?;
    let mut fields = vec![
        ("uniqid", job.uniqid.clone()),
        ("username", job.username.clone()),
    ];
    if let Some(secret) = settings.signing_secret.as_deref() {
        fields.push(("mac", hash::hmac_sha256_hex(secret.as_bytes(), payload.as_bytes())));
    }
    fields.push(("payload", payload));
    store
        .append_stream(&settings.stream, settings.max_len, &fields)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TransactionType;
    use crate::services::store::memory::MemoryStore;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use std::sync::atomic::Ordering;

    fn job(uniqid: &str) -> BalanceJob {
        BalanceJob {
            username: "alice".into(),
            login: "cl_alice".into(),
            uniqid: uniqid.into(),
            tx_type: TransactionType::Bet,
            amount: Decimal::from(10),
            gpid: Some("r1".into()),
            game_id: None,
            subtype: None,
            custom_data: None,
            request_timestamp: Utc::now(),
            rate: Decimal::from(100),
            balance_before_minor: 100,
            balance_after_minor: 90,
            write_timestamp: 1,
            processed_at: Utc::now(),
        }
    }

    fn settings(secret: Option<&str>) -> DispatcherSettings {
        DispatcherSettings {
            stream: "jobs".into(),
            max_len: 100,
            capacity: 8,
            signing_secret: secret.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn queued_jobs_are_drained_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let (dispatcher, handle) = JobDispatcher::start(store.clone(), settings(None));
        for i in 0..5 {
            dispatcher.dispatch(job(&format!("tx-{}", i)));
        }
        drop(dispatcher);
        handle.await.unwrap();

        let entries = store.stream("jobs");
        assert_eq!(entries.len(), 5);
        let payload = &entries[0].iter().find(|(k, _)| k == "payload").unwrap().1;
        let decoded: BalanceJob = serde_json::from_str(payload).unwrap();
        assert_eq!(decoded.uniqid, "tx-0");
    }

    #[tokio::test]
    async fn signed_entries_carry_payload_mac() {
        let store = Arc::new(MemoryStore::new());
        let (dispatcher, handle) = JobDispatcher::start(store.clone(), settings(Some("k")));
        dispatcher.dispatch(job("tx-1"));
        drop(dispatcher);
        handle.await.unwrap();

        let entry = &store.stream("jobs")[0];
        let field = |name: &str| entry.iter().find(|(k, _)| k == name).unwrap().1.clone();
        assert!(hash::verify_hmac_sha256_hex(
            b"k",
            field("payload").as_bytes(),
            &field("mac")
        ));
    }

    #[tokio::test]
    async fn enqueue_failure_does_not_stop_consumer() {
        let store = Arc::new(MemoryStore::new());
        let (dispatcher, handle) = JobDispatcher::start(store.clone(), settings(None));
        store.fail_writes.store(true, Ordering::SeqCst);
        dispatcher.dispatch(job("lost"));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        store.fail_writes.store(false, Ordering::SeqCst);
        dispatcher.dispatch(job("kept"));
        drop(dispatcher);
        handle.await.unwrap();

        let entries = store.stream("jobs");
        assert_eq!(entries.len(), 1);
        assert!(entries[0].contains(&("uniqid".to_string(), "kept".to_string())));
    }
}
