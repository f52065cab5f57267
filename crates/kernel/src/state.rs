//! Application state shared across all handlers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::{info, warn};

use crate::config::Config;
use crate::db;
use crate::plugin::{
    HostApiVersion, MemoryRegistryStore, PgRegistryStore, PluginReconciler, PluginRuntime,
    RegistryStore,
};

/// Shared application state.
///
/// Wrapped in Arc internally so Clone is cheap.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    /// PostgreSQL connection pool, when the registry is persistent.
    db: Option<PgPool>,

    /// Path to plugins directory on disk.
    plugins_dir: PathBuf,

    /// Plugin lifecycle orchestrator.
    reconciler: Arc<PluginReconciler>,

    /// Bearer token for the admin API.
    admin_api_token: Option<String>,
}

impl AppState {
    /// Create new application state with the registry the config selects.
    pub async fn new(config: &Config) -> Result<Self> {
        let (store, db): (Arc<dyn RegistryStore>, Option<PgPool>) = match &config.database_url {
            Some(url) => {
                let pool = db::create_pool(url, config.database_max_connections)
                    .await
                    .context("failed to create database pool")?;
                info!("using PostgreSQL plugin registry");
                (
                    Arc::new(PgRegistryStore::new(pool.clone())) as Arc<dyn RegistryStore>,
                    Some(pool),
                )
            }
            None => {
                warn!("DATABASE_URL not set; plugin registry is in memory and will not persist");
                (Arc::new(MemoryRegistryStore::new()) as Arc<dyn RegistryStore>, None)
            }
        };

        let runtime = PluginRuntime::new(
            config.runtime_config(),
            Arc::new(HostApiVersion(config.host_api_version.clone())),
        )
        .context("failed to create plugin runtime")?;

        let reconciler = PluginReconciler::new(store, Arc::new(runtime), config.reconciler_config());

        Ok(Self::from_parts(
            Arc::new(reconciler),
            config.plugins_dir.clone(),
            db,
            config.admin_api_token.clone(),
        ))
    }

    /// Assemble state from already-built parts.
    pub fn from_parts(
        reconciler: Arc<PluginReconciler>,
        plugins_dir: PathBuf,
        db: Option<PgPool>,
        admin_api_token: Option<String>,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                db,
                plugins_dir,
                reconciler,
                admin_api_token,
            }),
        }
    }

    /// Get the database pool, if the registry is persistent.
    pub fn db(&self) -> Option<&PgPool> {
        self.inner.db.as_ref()
    }

    /// Get the plugins directory path.
    pub fn plugins_dir(&self) -> &Path {
        &self.inner.plugins_dir
    }

    /// Get the plugin reconciler.
    pub fn reconciler(&self) -> &Arc<PluginReconciler> {
        &self.inner.reconciler
    }

    /// Get the admin API token.
    pub fn admin_api_token(&self) -> Option<&str> {
        self.inner.admin_api_token.as_deref()
    }

    /// Check if PostgreSQL is healthy. An in-memory registry is always healthy.
    pub async fn postgres_healthy(&self) -> bool {
        match &self.inner.db {
            Some(pool) => db::check_health(pool).await,
            None => true,
        }
    }
}
