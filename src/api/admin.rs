use super::AppState;
use crate::{
    error::{AppError, Result},
    models::{ApiResponse, LockRequest, OracleStatus},
};
use axum::{
    extract::State,
    http::{HeaderMap, HeaderName},
    Json,
};

pub const ADMIN_KEY_HEADER: &str = "x-admin-key";

fn require_admin_key(headers: &HeaderMap, configured: Option<&str>) -> Result<()> {
    let expected = configured
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            AppError::AuthError(
                "ADMIN_KEY is not configured on backend. Oracle admin is disabled.".to_string(),
            )
        })?;

    let header_name = HeaderName::from_static(ADMIN_KEY_HEADER);
    let provided = headers
        .get(&header_name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            AppError::AuthError(format!(
                "Missing admin key. Send header '{}' to access this endpoint.",
                ADMIN_KEY_HEADER
            ))
        })?;

    if provided != expected {
        return Err(AppError::AuthError("Invalid admin key".to_string()));
    }
    Ok(())
}

/// POST /api/v1/admin/oracle/lock
pub async fn lock_oracle(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<LockRequest>,
) -> Result<Json<ApiResponse<OracleStatus>>> {
    require_admin_key(&headers, state.config.admin_key.as_deref())?;
    state.oracle.lock(req.duration_seconds).await?;
    Ok(Json(ApiResponse::success(state.oracle.status().await)))
}

/// POST /api/v1/admin/oracle/unlock
pub async fn unlock_oracle(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<OracleStatus>>> {
    require_admin_key(&headers, state.config.admin_key.as_deref())?;
    state.oracle.unlock().await?;
    Ok(Json(ApiResponse::success(state.oracle.status().await)))
}

/// GET /api/v1/admin/oracle/status
pub async fn oracle_status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<OracleStatus>>> {
    require_admin_key(&headers, state.config.admin_key.as_deref())?;
    Ok(Json(ApiResponse::success(state.oracle.status().await)))
}
