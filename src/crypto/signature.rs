use serde_json::{Number, Value};

use crate::crypto::hash;
use crate::error::{AppError, Result};
use crate::models::RawAdjustment;

/// Verifies the keyed hash a game provider attaches to each adjustment.
///
/// The signed message is a JSON object over a fixed, ordered field list.
/// Absent fields are left out, numeric-looking strings are emitted as
/// numbers and escaped slashes are written plain, so both sides produce the
/// same bytes regardless of how the body was encoded on the wire.
pub struct SignatureVerifier {
    secret: Vec<u8>,
}

impl SignatureVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
        }
    }

    pub fn verify(&self, raw: &RawAdjustment) -> Result<()> {
        let provided = raw
            .hashed_result
            .as_ref()
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(AppError::InvalidSignature)?;

        let message = canonical_message(raw);
        if hash::verify_hmac_sha256_hex(&self.secret, message.as_bytes(), provided) {
            Ok(())
        } else {
            Err(AppError::InvalidSignature)
        }
    }

    #[cfg(test)]
    pub fn sign(&self, raw: &RawAdjustment) -> String {
        hash::hmac_sha256_hex(&self.secret, canonical_message(raw).as_bytes())
    }
}

/// Signed fields in signing order.
fn signed_fields(raw: &RawAdjustment) -> [(&'static str, Option<&Value>); 9] {
    [
        ("command", raw.command.as_ref()),
        ("timestamp", raw.timestamp.as_ref()),
        ("login", raw.login.as_ref()),
        ("internal_session_id", raw.internal_session_id.as_ref()),
        ("uniqid", raw.uniqid.as_ref()),
        ("amount", raw.amount.as_ref()),
        ("type", raw.tx_type.as_ref()),
        ("userid", raw.userid.as_ref()),
        ("custom_data", raw.custom_data.as_ref()),
    ]
}

pub fn canonical_message(raw: &RawAdjustment) -> String {
    let parts: Vec<String> = signed_fields(raw)
        .into_iter()
        .filter_map(|(name, value)| {
            let value = value.filter(|v| !v.is_null())?;
            let encoded = serde_json::to_string(&coerce_numeric(value)).ok()?;
            Some(format!("\"{}\":{}", name, encoded))
        })
        .collect();

    format!("{{{}}}", parts.join(",")).replace("\\/", "/")
}

// Internal helper that turns numeric-looking strings into JSON numbers.
fn coerce_numeric(value: &Value) -> Value {
    match value {
        Value::String(s) => numeric_from_str(s)
            .map(Value::Number)
            .unwrap_or_else(|| value.clone()),
        Value::Number(n) => Value::Number(canonical_number(n)),
        Value::Array(items) => Value::Array(items.iter().map(coerce_numeric).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), coerce_numeric(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn numeric_from_str(s: &str) -> Option<Number> {
    let looks_numeric = !s.is_empty()
        && s.chars().any(|c| c.is_ascii_digit())
        && s
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E'));
    if !looks_numeric {
        return None;
    }
    if let Ok(int) = s.parse::<i64>() {
        return Some(Number::from(int));
    }
    s.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(|n| canonical_number(&n))
}

// Largest magnitude below which every integer is exact in an f64.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// Whole-valued floats are written without a fraction, the way a
/// JavaScript signer prints them (`10.00` and `10.0` both become `10`).
fn canonical_number(n: &Number) -> Number {
    match n.as_f64() {
        Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() <= MAX_SAFE_INTEGER => {
            Number::from(f as i64)
        }
        _ => n.clone(),
    }
}
