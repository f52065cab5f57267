//! Application error types.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use crate::plugin::PluginError;

/// Application errors.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("internal server error")]
    Internal(#[from] anyhow::Error),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Plugin(#[from] PluginError),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Plugin(e) => match e {
                PluginError::NotFound(_) => StatusCode::NOT_FOUND,
                PluginError::Orphaned(_)
                | PluginError::NotDiscovered(_)
                | PluginError::Claimed(_)
                | PluginError::DuplicatePluginId(_) => StatusCode::CONFLICT,
                PluginError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
                PluginError::Store(_) | PluginError::Discovery(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
                PluginError::ManifestMissing { .. }
                | PluginError::ManifestParse { .. }
                | PluginError::ManifestValidation { .. }
                | PluginError::Load(_)
                | PluginError::Migration(_)
                | PluginError::Invoke(_) => StatusCode::UNPROCESSABLE_ENTITY,
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Storage failures stay in the logs; plugin failures are operator-facing
        let message = match &self {
            AppError::Internal(e) => {
                tracing::error!(error = %e, "internal server error");
                "internal server error".to_string()
            }
            AppError::Plugin(PluginError::Store(e)) => {
                tracing::error!(error = %e, "plugin registry error");
                "internal server error".to_string()
            }
            AppError::Plugin(e @ PluginError::Discovery(_)) => {
                tracing::error!(error = %e, "plugin discovery error");
                "internal server error".to_string()
            }
            _ => self.to_string(),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Result type alias using AppError.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plugin_errors_map_to_http_statuses() {
        let cases = [
            (PluginError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (PluginError::Orphaned("x".into()), StatusCode::CONFLICT),
            (PluginError::Claimed("x".into()), StatusCode::CONFLICT),
            (PluginError::ShuttingDown, StatusCode::SERVICE_UNAVAILABLE),
            (
                PluginError::Store(anyhow::anyhow!("connection reset")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                PluginError::Discovery("task panicked".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (error, expected) in cases {
            assert_eq!(AppError::from(error).status_code(), expected);
        }
    }

    #[test]
    fn load_failures_are_unprocessable() {
        let error = AppError::from(PluginError::Load(crate::plugin::LoadError::Timeout {
            plugin: "spinner".into(),
            budget: "1000 fuel".into(),
        }));
        assert_eq!(error.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(error.to_string().contains("spinner"));
    }
}
