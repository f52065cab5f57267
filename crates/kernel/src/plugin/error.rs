//! Plugin system error types with clear, actionable messages.
//!
//! All errors include the plugin identifier (or the directory it was read
//! from) so operators can find the offending package without digging
//! through logs.

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the plugin runtime and its reconciler.
#[derive(Debug, Error)]
pub enum PluginError {
    /// Plugin directory has no manifest. Discovery reports it as skipped.
    #[error("plugin directory '{path}': no plugin.info.toml manifest found")]
    ManifestMissing { path: String },

    /// Manifest could not be read or is not a well-formed TOML document.
    #[error("plugin directory '{path}': failed to parse manifest: {details}")]
    ManifestParse { path: String, details: String },

    /// Manifest is well-formed but violates the plugin contract.
    #[error("plugin directory '{path}': {source}")]
    ManifestValidation {
        path: String,
        source: ManifestValidationError,
    },

    /// Two plugin directories declare the same identifier.
    #[error(transparent)]
    DuplicatePluginId(#[from] DuplicatePluginIdError),

    /// The backend could not be loaded.
    #[error(transparent)]
    Load(#[from] LoadError),

    /// A declared migration failed.
    #[error(transparent)]
    Migration(#[from] MigrationError),

    /// A lifecycle hook failed.
    #[error(transparent)]
    Invoke(#[from] InvokeError),

    /// No registry record exists for the identifier.
    #[error("plugin '{0}' is not registered")]
    NotFound(String),

    /// The registry record exists but the plugin is gone from disk.
    #[error("plugin '{0}' is orphaned: its directory is no longer present on disk")]
    Orphaned(String),

    /// The plugin has a record but was not seen by the last discovery pass.
    #[error("plugin '{0}' was not found by the last discovery pass; run reconcile first")]
    NotDiscovered(String),

    /// Another host process holds the per-plugin registry claim.
    #[error("plugin '{0}': another host process is changing this plugin, try again shortly")]
    Claimed(String),

    /// The runtime is shutting down and no longer accepts load requests.
    #[error("plugin runtime is shutting down")]
    ShuttingDown,

    /// The discovery walk could not run to completion.
    #[error("plugin discovery failed: {0}")]
    Discovery(String),

    /// Registry or ledger storage failure.
    #[error("plugin registry storage error: {0:#}")]
    Store(#[from] anyhow::Error),
}

/// A single violated manifest field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldViolation {
    /// Field path, e.g. `version` or `migrations[1].id`.
    pub field: String,
    pub message: String,
}

impl FieldViolation {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "'{}' {}", self.field, self.message)
    }
}

/// Every contract violation found in one manifest.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid manifest: {}", join_violations(.violations))]
pub struct ManifestValidationError {
    pub violations: Vec<FieldViolation>,
}

impl ManifestValidationError {
    /// Names of the violated fields, deduplicated and sorted.
    pub fn fields(&self) -> std::collections::BTreeSet<&str> {
        self.violations.iter().map(|v| v.field.as_str()).collect()
    }
}

fn join_violations(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// A second directory declared an identifier that is already taken.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "duplicate plugin id '{id}': declared by {} and again by {}; the second directory is ignored",
    .first.display(),
    .duplicate.display()
)]
pub struct DuplicatePluginIdError {
    pub id: String,
    /// Directory that won (first in discovery order).
    pub first: PathBuf,
    /// Directory that was rejected.
    pub duplicate: PathBuf,
}

/// Failures while loading a plugin backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("plugin '{plugin}': entrypoint not found at {path}")]
    EntrypointNotFound { plugin: String, path: String },

    #[error("plugin '{plugin}': entrypoint failed: {details}")]
    EntrypointExecution { plugin: String, details: String },

    #[error("plugin '{plugin}': load exceeded its {budget} budget and was abandoned")]
    Timeout { plugin: String, budget: String },

    #[error("plugin '{plugin}': requires host API {required}, this host provides {host}")]
    IncompatibleHostVersion {
        plugin: String,
        required: String,
        host: String,
    },
}

impl LoadError {
    /// Identifier of the plugin that failed to load.
    pub fn plugin(&self) -> &str {
        match self {
            Self::EntrypointNotFound { plugin, .. }
            | Self::EntrypointExecution { plugin, .. }
            | Self::Timeout { plugin, .. }
            | Self::IncompatibleHostVersion { plugin, .. } => plugin,
        }
    }
}

/// Failures while calling into a loaded backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvokeError {
    #[error("plugin '{plugin}': '{export}' trapped: {details}")]
    Trap {
        plugin: String,
        export: String,
        details: String,
    },

    #[error("plugin '{plugin}': '{export}' returned failure code {code}")]
    Failed {
        plugin: String,
        export: String,
        code: i32,
    },

    #[error("plugin '{plugin}': '{export}' exceeded its {budget} budget")]
    Timeout {
        plugin: String,
        export: String,
        budget: String,
    },

    #[error("plugin '{plugin}': no migration '{migration}' was resolved at load")]
    UnknownMigration { plugin: String, migration: String },
}

/// A migration in a plugin's sequence failed; later ones did not run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("plugin '{plugin}': migration '{migration}' failed: {details}")]
pub struct MigrationError {
    pub plugin: String,
    pub migration: String,
    pub details: String,
    /// Migrations from the same batch that were applied and recorded first.
    pub applied: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_lists_every_field() {
        let err = ManifestValidationError {
            violations: vec![
                FieldViolation::new("id", "is required"),
                FieldViolation::new("version", "must be a semantic version"),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("'id' is required"));
        assert!(msg.contains("'version' must be a semantic version"));
        assert_eq!(
            err.fields().into_iter().collect::<Vec<_>>(),
            vec!["id", "version"]
        );
    }

    #[test]
    fn duplicate_error_names_both_directories() {
        let err = DuplicatePluginIdError {
            id: "cache-warmer".into(),
            first: PathBuf::from("/plugins/a"),
            duplicate: PathBuf::from("/plugins/b"),
        };
        let msg = err.to_string();
        assert!(msg.contains("/plugins/a"));
        assert!(msg.contains("/plugins/b"));
        assert!(msg.contains("cache-warmer"));
    }

    #[test]
    fn load_error_carries_plugin_id() {
        let err = LoadError::IncompatibleHostVersion {
            plugin: "billing-sync".into(),
            required: "^2".into(),
            host: "1.4.0".into(),
        };
        assert_eq!(err.plugin(), "billing-sync");
        assert!(err.to_string().contains("^2"));
    }
}
