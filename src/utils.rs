// Utility helpers shared across services

use chrono::{DateTime, NaiveDateTime, Utc};
use std::future::Future;
use std::time::Duration;

use crate::{
    constants::WIRE_TIMESTAMP_FORMAT,
    error::{AppError, Result},
};

/// Formats a time the way the provider protocol expects (`YYYY-MM-DD HH:MM:SS`, UTC).
pub fn wire_timestamp(time: DateTime<Utc>) -> String {
    time.format(WIRE_TIMESTAMP_FORMAT).to_string()
}

pub fn parse_wire_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw.trim(), WIRE_TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Ordered login prefix table. The first matching prefix wins, so longer
/// forms must be listed before the shorter forms they contain.
#[derive(Debug, Clone)]
pub struct LoginPrefixes {
    entries: Vec<(String, usize)>,
}

impl LoginPrefixes {
    pub fn new(prefixes: &[String]) -> Self {
        let entries = prefixes
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .map(|p| (p.to_ascii_lowercase(), p.len()))
            .collect();
        Self { entries }
    }

    /// Strips the operator prefix from `login`. Returns `None` when no known
    /// prefix matches or nothing is left after stripping.
    pub fn extract_username(&self, login: &str) -> Option<String> {
        let login = login.trim();
        let lowered = login.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(prefix, _)| lowered.starts_with(prefix.as_str()))
            .and_then(|(_, strip)| login.get(*strip..))
            .filter(|rest| !rest.is_empty())
            .map(str::to_string)
    }
}

/// Bounds an external call. An elapsed budget becomes [`AppError::Timeout`].
pub async fn with_timeout<T, F>(label: &str, budget: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(budget, fut).await {
        Ok(result) => result,
        Err(_) => Err(AppError::Timeout(format!(
            "{} exceeded {}ms",
            label,
            budget.as_millis()
        ))),
    }
}
