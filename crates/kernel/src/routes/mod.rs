//! HTTP route handlers.

pub mod health;
pub mod plugin_admin;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the application router.
///
/// Admin routes are mounted only when an admin token is configured.
pub fn build_router(state: AppState) -> Router {
    let mut app = Router::new().merge(health::router());

    if state.admin_api_token().is_some() {
        app = app.merge(plugin_admin::router().layer(axum::middleware::from_fn_with_state(
            state.clone(),
            crate::middleware::require_admin_token,
        )));
    } else {
        tracing::warn!("ADMIN_API_TOKEN not set; plugin admin API is disabled");
    }

    app.layer(TraceLayer::new_for_http()).with_state(state)
}
