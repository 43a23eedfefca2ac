use axum::{extract::State, Json};
use serde::Serialize;
use super::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub database: String,
    pub redis: String,
}

fn connectivity(ok: bool) -> String {
    if ok { "connected" } else { "disconnected" }.to_string()
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    // Postgres answers if a pooled connection can be acquired
    let db_ok = state.db.pool().acquire().await.is_ok();
    let redis_ok = state.store.ping().await.is_ok();

    let status = if db_ok && redis_ok { "ok" } else { "degraded" };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database: connectivity(db_ok),
        redis: connectivity(redis_ok),
    })
}
