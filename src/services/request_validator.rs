use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use crate::{
    config::Config,
    crypto::SignatureVerifier,
    error::{AppError, Result},
    models::{AdjustmentRequest, RawAdjustment, TransactionType},
    services::store::{keys, SharedStore},
    utils::{parse_wire_timestamp, LoginPrefixes},
};

#[derive(Debug, Clone)]
pub struct ValidatorSettings {
    pub command: String,
    pub window: Duration,
    pub allowed_origins: Vec<IpAddr>,
    pub prefixes: LoginPrefixes,
}

impl ValidatorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            command: config.adjustment_command.clone(),
            window: Duration::seconds(config.timestamp_window_secs),
            allowed_origins: config.allowed_origins.clone(),
            prefixes: LoginPrefixes::new(&config.login_prefixes),
        }
    }
}

/// Fail-closed gate in front of every balance mutation.
///
/// Shape first (400), then signature, timestamp window, origin and session,
/// stopping at the first failure.
pub struct RequestValidator {
    store: Arc<dyn SharedStore>,
    verifier: SignatureVerifier,
    settings: ValidatorSettings,
}

impl RequestValidator {
    pub fn new(store: Arc<dyn SharedStore>, secret: &str, settings: ValidatorSettings) -> Self {
        Self {
            store,
            verifier: SignatureVerifier::new(secret),
            settings,
        }
    }

    pub async fn validate(
        &self,
        raw: &RawAdjustment,
        origin: Option<IpAddr>,
        now: DateTime<Utc>,
    ) -> Result<AdjustmentRequest> {
        let result = self.run_checks(raw, origin, now).await;
        if let Err(err) = &result {
            tracing::warn!(
                "Adjustment rejected: {} login={} uniqid={} origin={:?}",
                err,
                field_str(&raw.login).unwrap_or_default(),
                field_str(&raw.uniqid).unwrap_or_default(),
                origin
            );
        }
        result
    }

    async fn run_checks(
        &self,
        raw: &RawAdjustment,
        origin: Option<IpAddr>,
        now: DateTime<Utc>,
    ) -> Result<AdjustmentRequest> {
        let request = self.parse(raw)?;
        self.verifier.verify(raw)?;
        self.check_window(request.timestamp, now)?;
        self.check_origin(origin)?;
        self.check_session(&request.username).await?;
        tracing::debug!(
            "Adjustment accepted command={} type={} user={} uniqid={}",
            request.command,
            request.tx_type.as_str(),
            request.username,
            request.uniqid
        );
        Ok(request)
    }

    /// Username from the raw login, if it can be derived. Used to echo a
    /// balance on rejections that happen before full parsing succeeds.
    pub fn username_hint(&self, raw: &RawAdjustment) -> Option<String> {
        field_str(&raw.login).and_then(|login| self.settings.prefixes.extract_username(&login))
    }

    pub fn parse(&self, raw: &RawAdjustment) -> Result<AdjustmentRequest> {
        let command = required(&raw.command, "command")?;
        if command != self.settings.command {
            return Err(AppError::BadRequest(format!("Unknown command: {}", command)));
        }

        let type_raw = required(&raw.tx_type, "type")?;
        let tx_type = TransactionType::parse(&type_raw)
            .ok_or_else(|| AppError::BadRequest(format!("Unknown type: {}", type_raw)))?;

        let login = required(&raw.login, "login")?;
        let username = self
            .settings
            .prefixes
            .extract_username(&login)
            .ok_or_else(|| AppError::BadRequest("Unrecognized login".to_string()))?;

        let amount = parse_amount(raw.amount.as_ref())?;
        let uniqid = required(&raw.uniqid, "uniqid")?;

        let timestamp_raw = required(&raw.timestamp, "timestamp")?;
        let timestamp = parse_wire_timestamp(&timestamp_raw)
            .ok_or_else(|| AppError::BadRequest("Invalid timestamp format".to_string()))?;

        required(&raw.hashed_result, "hashed_result")?;

        Ok(AdjustmentRequest {
            command,
            tx_type,
            login,
            username,
            amount,
            uniqid,
            gpid: field_str(&raw.gpid),
            subtype: field_str(&raw.subtype),
            game_id: field_str(&raw.gameid),
            timestamp,
            custom_data: raw.custom_data.clone().filter(|v| !v.is_null()),
        })
    }

    fn check_window(&self, timestamp: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
        let skew_ms = (now - timestamp).num_milliseconds().abs();
        if skew_ms > self.settings.window.num_milliseconds() {
            return Err(AppError::StaleTimestamp(format!(
                "{}s skew exceeds {}s",
                skew_ms / 1_000,
                self.settings.window.num_seconds()
            )));
        }
        Ok(())
    }

    fn check_origin(&self, origin: Option<IpAddr>) -> Result<()> {
        if self.settings.allowed_origins.is_empty() {
            return Ok(());
        }
        match origin {
            Some(ip) if self.settings.allowed_origins.contains(&ip) => Ok(()),
            Some(ip) => Err(AppError::OriginNotAllowed(ip.to_string())),
            None => Err(AppError::OriginNotAllowed("unknown".to_string())),
        }
    }

    async fn check_session(&self, username: &str) -> Result<()> {
        if self.store.exists(&keys::session(username)).await? {
            Ok(())
        } else {
            Err(AppError::SessionInvalid)
        }
    }
}

// Internal helper that reads a scalar field as trimmed text.
fn field_str(value: &Option<Value>) -> Option<String> {
    match value.as_ref()? {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn required(value: &Option<Value>, name: &str) -> Result<String> {
    field_str(value).ok_or_else(|| AppError::BadRequest(format!("Missing field: {}", name)))
}

fn parse_amount(value: Option<&Value>) -> Result<Decimal> {
    let text = match value {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err(AppError::BadRequest("Missing field: amount".to_string())),
    };
    let amount = Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|_| AppError::BadRequest(format!("Invalid amount: {}", text)))?;
    if amount.is_sign_negative() && !amount.is_zero() {
        return Err(AppError::BadRequest("Amount must not be negative".to_string()));
    }
    Ok(amount)
}
