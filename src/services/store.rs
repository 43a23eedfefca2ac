use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands};
use std::time::Duration;

use crate::{
    constants::STORE_TIMEOUT_MS,
    error::{AppError, Result},
    utils::with_timeout,
};

// ==================== KEYS ====================

pub mod keys {
    pub const SHARED_PRICE: &str = "oracle:price:sol_usd";
    pub const TEST_MODE_LOCK: &str = "oracle:test_lock";

    pub fn balance(username: &str) -> String {
        format!("balance:{}", username)
    }

    pub fn balance_timestamp(username: &str) -> String {
        format!("balance_ts:{}", username)
    }

    pub fn session(username: &str) -> String {
        format!("session:{}", username)
    }

    pub fn idempotency(username: &str, uniqid: &str) -> String {
        format!("idem:{}:{}", username, uniqid)
    }

    pub fn pending_bet(username: &str, gpid: &str) -> String {
        format!("pending_bet:{}:{}", username, gpid)
    }
}

// ==================== GUARDED BALANCE WRITE ====================

/// A balance write that only lands if nothing newer got there first.
#[derive(Debug, Clone)]
pub struct BalanceWrite {
    pub balance_key: String,
    pub timestamp_key: String,
    /// Balance the write was computed from; `None` means the key must be absent.
    pub expected_minor: Option<i64>,
    pub new_minor: i64,
    pub write_timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Written,
    /// Stored timestamp is newer than ours; write skipped.
    StaleTimestamp { stored: u64 },
    /// Balance changed since it was read; write skipped.
    BalanceMoved { current: Option<i64> },
}

// Compare-and-set on timestamp and balance, then write both in one step.
const COMMIT_BALANCE_SCRIPT: &str = r#"
local stored_ts = redis.call('GET', KEYS[2])
if stored_ts and tonumber(stored_ts) > tonumber(ARGV[3]) then
  return {0, stored_ts}
end
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '' then
  if current then return {1, current} end
elseif current ~= ARGV[1] then
  return {1, current or ''}
end
redis.call('MSET', KEYS[1], ARGV[2], KEYS[2], ARGV[3])
return {2, ARGV[2]}
"#;

fn parse_commit_reply(code: i64, value: String) -> Result<CommitOutcome> {
    match code {
        0 => Ok(CommitOutcome::StaleTimestamp {
            stored: value.parse().unwrap_or(u64::MAX),
        }),
        1 => Ok(CommitOutcome::BalanceMoved {
            current: value.parse().ok(),
        }),
        2 => Ok(CommitOutcome::Written),
        other => Err(AppError::Internal(format!(
            "Unexpected commit script reply {}",
            other
        ))),
    }
}

// ==================== STORE TRAIT ====================

/// Shared low-latency store used by every running instance.
#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()>;
    /// Create-if-absent. Returns `false` when the key already exists.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool>;
    async fn del(&self, key: &str) -> Result<()>;
    async fn exists(&self, key: &str) -> Result<bool>;
    /// Appends to a list and (re)arms its TTL.
    async fn push_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()>;
    async fn list(&self, key: &str) -> Result<Vec<String>>;
    /// Reads and deletes a list in one atomic step.
    async fn take_list(&self, key: &str) -> Result<Vec<String>>;
    /// Reads a balance and its write timestamp together.
    async fn read_balance(&self, balance_key: &str, timestamp_key: &str)
        -> Result<Option<(i64, u64)>>;
    async fn commit_balance(&self, write: &BalanceWrite) -> Result<CommitOutcome>;
    /// Appends an entry to an ordered, capped stream. Returns the entry id.
    async fn append_stream(
        &self,
        stream: &str,
        max_len: usize,
        fields: &[(&str, String)],
    ) -> Result<String>;
    async fn ping(&self) -> Result<()>;
}

// ==================== REDIS ====================

#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    budget: Duration,
    commit_script: redis::Script,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            budget: Duration::from_millis(STORE_TIMEOUT_MS),
            commit_script: redis::Script::new(COMMIT_BALANCE_SCRIPT),
        }
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        with_timeout("redis GET", self.budget, async move {
            let value: Option<String> = conn.get(key).await?;
            Ok::<_, AppError>(value)
        })
        .await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        with_timeout("redis SET EX", self.budget, async move {
            let _: () = redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("EX")
                .arg(ttl_secs)
                .query_async(&mut conn)
                .await?;
            Ok::<_, AppError>(())
        })
        .await
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool> {
        let mut conn = self.conn.clone();
        with_timeout("redis SET NX", self.budget, async move {
            let reply: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("EX")
                .arg(ttl_secs)
                .query_async(&mut conn)
                .await?;
            Ok::<_, AppError>(reply.is_some())
        })
        .await
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        with_timeout("redis DEL", self.budget, async move {
            let _: i64 = conn.del(key).await?;
            Ok::<_, AppError>(())
        })
        .await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        with_timeout("redis EXISTS", self.budget, async move {
            let found: bool = conn.exists(key).await?;
            Ok::<_, AppError>(found)
        })
        .await
    }

    async fn push_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        with_timeout("redis RPUSH", self.budget, async move {
            let _: (i64, i64) = redis::pipe()
                .atomic()
                .cmd("RPUSH")
                .arg(key)
                .arg(value)
                .cmd("EXPIRE")
                .arg(key)
                .arg(ttl_secs)
                .query_async(&mut conn)
                .await?;
            Ok::<_, AppError>(())
        })
        .await
    }

    async fn list(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        with_timeout("redis LRANGE", self.budget, async move {
            let items: Vec<String> = conn.lrange(key, 0, -1).await?;
            Ok::<_, AppError>(items)
        })
        .await
    }

    async fn take_list(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        with_timeout("redis LRANGE+DEL", self.budget, async move {
            let (items, _): (Vec<String>, i64) = redis::pipe()
                .atomic()
                .cmd("LRANGE")
                .arg(key)
                .arg(0)
                .arg(-1)
                .cmd("DEL")
                .arg(key)
                .query_async(&mut conn)
                .await?;
            Ok::<_, AppError>(items)
        })
        .await
    }

    async fn read_balance(
        &self,
        balance_key: &str,
        timestamp_key: &str,
    ) -> Result<Option<(i64, u64)>> {
        let mut conn = self.conn.clone();
        with_timeout("redis MGET balance", self.budget, async move {
            let (balance, stamp): (Option<String>, Option<String>) = redis::cmd("MGET")
                .arg(balance_key)
                .arg(timestamp_key)
                .query_async(&mut conn)
                .await?;
            let Some(balance) = balance else {
                return Ok(None);
            };
            let minor = balance.trim().parse::<i64>().map_err(|e| {
                AppError::Internal(format!("Corrupt cached balance {}: {}", balance_key, e))
            })?;
            let stamp = stamp.and_then(|s| s.trim().parse::<u64>().ok()).unwrap_or(0);
            Ok::<_, AppError>(Some((minor, stamp)))
        })
        .await
    }

    async fn commit_balance(&self, write: &BalanceWrite) -> Result<CommitOutcome> {
        let mut conn = self.conn.clone();
        let expected = write
            .expected_minor
            .map(|v| v.to_string())
            .unwrap_or_default();
        with_timeout("redis balance commit", self.budget, async move {
            let (code, value): (i64, String) = self
                .commit_script
                .key(&write.balance_key)
                .key(&write.timestamp_key)
                .arg(expected)
                .arg(write.new_minor.to_string())
                .arg(write.write_timestamp.to_string())
                .invoke_async(&mut conn)
                .await?;
            parse_commit_reply(code, value)
        })
        .await
    }

    async fn append_stream(
        &self,
        stream: &str,
        max_len: usize,
        fields: &[(&str, String)],
    ) -> Result<String> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream).arg("MAXLEN").arg("~").arg(max_len).arg("*");
        for (name, value) in fields {
            cmd.arg(*name).arg(value);
        }
        with_timeout("redis XADD", self.budget, async move {
            let id: String = cmd.query_async(&mut conn).await?;
            Ok::<_, AppError>(id)
        })
        .await
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        with_timeout("redis PING", self.budget, async move {
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok::<_, AppError>(())
        })
        .await
    }
}

// ==================== IN-MEMORY (tests) ====================
