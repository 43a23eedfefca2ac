// src/api/mod.rs

pub mod admin;
pub mod balance;
pub mod health;

use axum::http::{header, HeaderName, HeaderValue, Method};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

// AppState definition
use crate::config::Config;
use crate::db::Database;
use crate::services::{AdjustmentService, PriceOracle, SharedStore};

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub store: Arc<dyn SharedStore>,
    pub config: Config,
    pub oracle: Arc<PriceOracle>,
    pub adjustments: Arc<AdjustmentService>,
}

#[derive(Debug, PartialEq)]
enum CorsOrigins {
    Any,
    List(Vec<HeaderValue>),
    /// Nothing usable configured; browsers are refused.
    Refuse,
}

fn parse_cors_origins(raw: &str) -> CorsOrigins {
    let raw = raw.trim();
    if raw == "*" {
        return CorsOrigins::Any;
    }
    let origins: Vec<HeaderValue> = raw
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty() && *origin != "*")
        .filter_map(|origin| origin.parse().ok())
        .collect();
    if origins.is_empty() {
        CorsOrigins::Refuse
    } else {
        CorsOrigins::List(origins)
    }
}

/// Browser access only matters for the operator console; game providers
/// call server to server. Only the methods and headers the routes use are
/// allowed.
pub fn cors_layer(config: &Config) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            header::CONTENT_TYPE,
            HeaderName::from_static(admin::ADMIN_KEY_HEADER),
        ]);
    match parse_cors_origins(&config.cors_allowed_origins) {
        CorsOrigins::Any => layer.allow_origin(Any),
        CorsOrigins::List(origins) => layer.allow_origin(AllowOrigin::list(origins)),
        CorsOrigins::Refuse => {
            tracing::warn!("No valid CORS origins configured; cross-origin requests are refused");
            layer
        }
    }
}
