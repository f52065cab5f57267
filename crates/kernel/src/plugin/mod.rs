//! Plugin system for Hostdesk.
//!
//! This module handles:
//! - Validating `plugin.info.toml` manifests
//! - Discovering plugin packages on disk
//! - Loading WASM backends in isolated, fuel-metered stores
//! - Applying plugin migrations exactly once
//! - Reconciling lifecycle state against the persistent registry

pub mod cli;
mod discovery;
mod error;
mod host;
mod lifecycle;
mod manifest;
mod migration;
mod reconciler;
mod runtime;
pub mod store;

pub use discovery::{DiscoveredPlugin, Discovery, DiscoveryIssue, discover, read_manifest};
pub use error::{
    DuplicatePluginIdError, FieldViolation, InvokeError, LoadError, ManifestValidationError,
    MigrationError, PluginError,
};
pub use host::PluginState;
pub use lifecycle::{LifecycleState, PluginStatus};
pub use manifest::{
    KNOWN_CAPABILITIES, MANIFEST_FILE, ManifestDocumentError, MigrationDecl, PluginManifest,
    validate,
};
pub use migration::{MigrationExecutor, apply_pending, pending_migrations};
pub use reconciler::{PluginReconciler, ReconcileReport, ReconcilerConfig, StartupReport};
pub use runtime::{BackendHandle, HostApiVersion, HostCompatibility, PluginRuntime, RuntimeConfig};
pub use store::{
    LedgerEntry, MemoryRegistryStore, MigrationLedger, PgRegistryStore, PluginRecord,
    RegistryStore,
};
