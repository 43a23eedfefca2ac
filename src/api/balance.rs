use super::AppState;
use crate::{
    error::AppError,
    models::{AdjustmentResponse, RawAdjustment},
};
use axum::{
    body::Bytes,
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use std::net::{IpAddr, SocketAddr};

const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

// Internal helper that resolves the caller address used by the origin allow-list.
fn client_ip(headers: &HeaderMap, peer: SocketAddr, trust_forwarded_for: bool) -> IpAddr {
    if trust_forwarded_for {
        let forwarded = headers
            .get(FORWARDED_FOR_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|raw| raw.split(',').next())
            .and_then(|first| first.trim().parse::<IpAddr>().ok());
        if let Some(ip) = forwarded {
            return ip;
        }
    }
    peer.ip()
}

/// POST /api/v1/balance/adjust
///
/// The body is taken as raw bytes so malformed JSON still gets a protocol
/// error body instead of the framework's default rejection.
pub async fn adjust_balance(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<AdjustmentResponse>) {
    let raw: RawAdjustment = match serde_json::from_slice(&body) {
        Ok(raw) => raw,
        Err(e) => {
            let err = AppError::BadRequest(format!("Invalid JSON body: {}", e));
            tracing::warn!("Adjustment rejected from {}: {}", peer, err);
            return (err.status_code(), Json(err.to_body(None)));
        }
    };

    let origin = client_ip(&headers, peer, state.config.trust_forwarded_for);
    let (status, response) = state.adjustments.handle(&raw, Some(origin)).await;
    (status, Json(response))
}
