//! Ephemeral credential endpoint.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::warn;

use crate::errors::BridgeError;
use crate::state::SharedState;

/// `GET /v1/realtime/token`
///
/// Mints a short-lived client secret for the browser. The response never
/// contains the server's long-lived key.
pub async fn mint_token(State(state): State<SharedState>) -> Response {
    match state.broker.obtain().await {
        Ok(credential) => (StatusCode::OK, Json(credential)).into_response(),
        Err(e) => {
            warn!(code = e.code(), error = %e, "credential minting failed");
            let status = match &e {
                BridgeError::UpstreamAuth(_) => StatusCode::BAD_GATEWAY,
                BridgeError::TransientNetwork(_) => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (
                status,
                Json(json!({
                    "error": e.code(),
                    "message": e.to_string(),
                })),
            )
                .into_response()
        }
    }
}
