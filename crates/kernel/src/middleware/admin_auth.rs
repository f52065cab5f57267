//! Admin API token authentication middleware.
//!
//! Requires `Authorization: Bearer <token>` matching the configured admin
//! token. The comparison is constant-time.

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::state::AppState;

/// Reject requests without the admin bearer token.
pub async fn require_admin_token(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected) = state.admin_api_token() else {
        return unauthorized("admin API is disabled");
    };

    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let Some(presented) = presented else {
        return unauthorized("missing bearer token");
    };

    if !bool::from(presented.as_bytes().ct_eq(expected.as_bytes())) {
        debug!(path = %request.uri().path(), "rejected admin request with wrong token");
        return unauthorized("invalid token");
    }

    next.run(request).await
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Bearer")],
        Json(json!({ "error": message })),
    )
        .into_response()
}
