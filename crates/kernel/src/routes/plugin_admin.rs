//! Admin routes for plugin management.
//!
//! JSON API over the reconciler; every route requires the admin token.

use axum::extract::{Path, State};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Serialize;

use crate::error::{AppError, AppResult};
use crate::plugin::{DiscoveryIssue, PluginStatus, ReconcileReport};
use crate::state::AppState;

// =============================================================================
// Response bodies
// =============================================================================

#[derive(Debug, Serialize)]
struct PluginList {
    plugins: Vec<PluginStatus>,
}

#[derive(Debug, Serialize)]
struct Diagnostic {
    dir: String,
    error: String,
}

#[derive(Debug, Serialize)]
struct ReconcileResponse {
    registered: Vec<String>,
    upgrades_pending: Vec<String>,
    reappeared: Vec<String>,
    orphaned: Vec<String>,
    updated: Vec<String>,
    contended: Vec<String>,
    duplicates: Vec<Diagnostic>,
    issues: Vec<Diagnostic>,
    skipped: Vec<Diagnostic>,
}

impl Diagnostic {
    fn from_issue(issue: &DiscoveryIssue) -> Self {
        Self {
            dir: issue.dir.display().to_string(),
            error: issue.error.to_string(),
        }
    }
}

impl From<ReconcileReport> for ReconcileResponse {
    fn from(report: ReconcileReport) -> Self {
        Self {
            registered: report.registered,
            upgrades_pending: report.upgrades_pending,
            reappeared: report.reappeared,
            orphaned: report.orphaned,
            updated: report.updated,
            contended: report.contended,
            duplicates: report
                .duplicates
                .iter()
                .map(|d| Diagnostic {
                    dir: d.duplicate.display().to_string(),
                    error: d.to_string(),
                })
                .collect(),
            issues: report.issues.iter().map(Diagnostic::from_issue).collect(),
            skipped: report.skipped.iter().map(Diagnostic::from_issue).collect(),
        }
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// GET /admin/plugins
async fn list_plugins(State(state): State<AppState>) -> AppResult<Json<PluginList>> {
    let plugins = state.reconciler().statuses().await?;
    Ok(Json(PluginList { plugins }))
}

/// GET /admin/plugins/{id}
async fn plugin_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<PluginStatus>> {
    Ok(Json(state.reconciler().status(&id).await?))
}

/// POST /admin/plugins/reconcile
async fn reconcile(State(state): State<AppState>) -> AppResult<Json<ReconcileResponse>> {
    let report = state.reconciler().reconcile(state.plugins_dir()).await?;
    Ok(Json(report.into()))
}

/// POST /admin/plugins/{id}/enable
async fn enable_plugin(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<PluginStatus>> {
    Ok(Json(state.reconciler().enable(&id).await?))
}

/// POST /admin/plugins/{id}/disable
async fn disable_plugin(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<PluginStatus>> {
    Ok(Json(state.reconciler().disable(&id).await?))
}

/// PUT /admin/plugins/{id}/config
///
/// The body is stored as-is; only the plugin interprets it.
async fn set_plugin_config(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(config): Json<serde_json::Value>,
) -> AppResult<Json<PluginStatus>> {
    if !config.is_object() {
        return Err(AppError::BadRequest(
            "plugin configuration must be a JSON object".to_string(),
        ));
    }
    Ok(Json(state.reconciler().set_config(&id, config).await?))
}

/// Create the plugin admin router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/admin/plugins", get(list_plugins))
        .route("/admin/plugins/reconcile", post(reconcile))
        .route("/admin/plugins/{id}", get(plugin_status))
        .route("/admin/plugins/{id}/enable", post(enable_plugin))
        .route("/admin/plugins/{id}/disable", post(disable_plugin))
        .route("/admin/plugins/{id}/config", put(set_plugin_config))
}
