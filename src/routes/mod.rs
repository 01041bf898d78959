//! Router construction.

use axum::http::{HeaderValue, Method, header};
use axum::routing::get;
use axum::{Json, Router, extract::State};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::handlers::bridge::bridge_ws;
use crate::handlers::token::mint_token;
use crate::state::SharedState;

/// Build the application router.
pub fn build_router(state: SharedState) -> Router {
    let cors = cors_layer(state.config.cors_allowed_origins.as_deref());
    Router::new()
        .route("/health", get(health))
        .route("/v1/realtime/token", get(mint_token))
        .route("/v1/realtime/ws", get(bridge_ws))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health(State(state): State<SharedState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "live_sessions": state.sessions.len(),
    }))
}

fn cors_layer(allowed_origins: Option<&str>) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);
    match allowed_origins {
        None => base,
        Some("*") => base.allow_origin(Any),
        Some(list) => {
            let origins: Vec<HeaderValue> = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .filter_map(|origin| match origin.parse::<HeaderValue>() {
                    Ok(value) => Some(value),
                    Err(_) => {
                        warn!(origin, "invalid CORS origin, skipped");
                        None
                    }
                })
                .collect();
            base.allow_origin(origins)
        }
    }
}
