//! PostgreSQL-backed registry store.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{LedgerEntry, MigrationLedger, PluginRecord, RegistryStore};

const SCHEMA: &str = include_str!("../../../migrations/0001_plugin_registry.sql");

const RECORD_COLUMNS: &str = "id, name, version, available_version, enabled, status, last_error, \
     config, claimed_by, claimed_at, created_at, updated_at";

/// Create the registry and ledger tables if they do not exist.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    sqlx::raw_sql(SCHEMA)
        .execute(pool)
        .await
        .context("failed to create plugin registry schema")?;
    Ok(())
}

/// Database row for `plugin_registry`.
#[derive(sqlx::FromRow)]
struct PluginRow {
    id: String,
    name: String,
    version: String,
    available_version: Option<String>,
    enabled: bool,
    status: String,
    last_error: Option<String>,
    config: serde_json::Value,
    claimed_by: Option<Uuid>,
    claimed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PluginRow> for PluginRecord {
    type Error = anyhow::Error;

    fn try_from(row: PluginRow) -> Result<Self> {
        let status = row
            .status
            .parse()
            .map_err(anyhow::Error::msg)
            .with_context(|| format!("plugin '{}' has a corrupt status column", row.id))?;

        Ok(Self {
            id: row.id,
            name: row.name,
            version: row.version,
            available_version: row.available_version,
            enabled: row.enabled,
            status,
            last_error: row.last_error,
            config: row.config,
            claimed_by: row.claimed_by,
            claimed_at: row.claimed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Database row for `plugin_migration_ledger`.
#[derive(sqlx::FromRow)]
struct LedgerRow {
    plugin_id: String,
    migration_id: String,
    applied_at: DateTime<Utc>,
}

impl From<LedgerRow> for LedgerEntry {
    fn from(row: LedgerRow) -> Self {
        Self {
            plugin_id: row.plugin_id,
            migration_id: row.migration_id,
            applied_at: row.applied_at,
        }
    }
}

/// Registry store shared by every host process pointed at the same database.
#[derive(Clone)]
pub struct PgRegistryStore {
    pool: PgPool,
}

impl PgRegistryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl MigrationLedger for PgRegistryStore {
    async fn applied_migrations(&self, plugin_id: &str) -> Result<Vec<LedgerEntry>> {
        let rows: Vec<LedgerRow> = sqlx::query_as(
            "SELECT plugin_id, migration_id, applied_at FROM plugin_migration_ledger \
             WHERE plugin_id = $1 ORDER BY seq",
        )
        .bind(plugin_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to read migration ledger")?;

        Ok(rows.into_iter().map(LedgerEntry::from).collect())
    }

    async fn record_migration(&self, plugin_id: &str, migration_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO plugin_migration_ledger (plugin_id, migration_id, applied_at) \
             VALUES ($1, $2, $3) ON CONFLICT (plugin_id, migration_id) DO NOTHING",
        )
        .bind(plugin_id)
        .bind(migration_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("failed to record migration")?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl RegistryStore for PgRegistryStore {
    async fn get(&self, id: &str) -> Result<Option<PluginRecord>> {
        let row: Option<PluginRow> = sqlx::query_as(&format!(
            "SELECT {RECORD_COLUMNS} FROM plugin_registry WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch plugin record")?;

        row.map(PluginRecord::try_from).transpose()
    }

    async fn list(&self) -> Result<Vec<PluginRecord>> {
        let rows: Vec<PluginRow> = sqlx::query_as(&format!(
            "SELECT {RECORD_COLUMNS} FROM plugin_registry ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await
        .context("failed to list plugin records")?;

        rows.into_iter().map(PluginRecord::try_from).collect()
    }

    async fn insert(&self, record: &PluginRecord) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO plugin_registry \
             (id, name, version, available_version, enabled, status, last_error, config, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&record.id)
        .bind(&record.name)
        .bind(&record.version)
        .bind(&record.available_version)
        .bind(record.enabled)
        .bind(record.status.as_str())
        .bind(&record.last_error)
        .bind(&record.config)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .context("failed to insert plugin record")?;

        Ok(result.rows_affected() == 1)
    }

    async fn update(
        &self,
        record: &PluginRecord,
        expected_updated_at: DateTime<Utc>,
        owner: Uuid,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE plugin_registry SET name = $2, version = $3, available_version = $4, \
             enabled = $5, status = $6, last_error = $7, config = $8, updated_at = $9 \
             WHERE id = $1 AND updated_at = $10 \
             AND (claimed_by IS NULL OR claimed_by = $11)",
        )
        .bind(&record.id)
        .bind(&record.name)
        .bind(&record.version)
        .bind(&record.available_version)
        .bind(record.enabled)
        .bind(record.status.as_str())
        .bind(&record.last_error)
        .bind(&record.config)
        .bind(record.updated_at)
        .bind(expected_updated_at)
        .bind(owner)
        .execute(&self.pool)
        .await
        .context("failed to update plugin record")?;

        Ok(result.rows_affected() == 1)
    }

    async fn try_claim(&self, id: &str, owner: Uuid, stale_after: Duration) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE plugin_registry SET claimed_by = $2, claimed_at = now() \
             WHERE id = $1 AND (claimed_by IS NULL OR claimed_by = $2 \
             OR claimed_at < now() - make_interval(secs => $3))",
        )
        .bind(id)
        .bind(owner)
        .bind(stale_after.as_secs_f64())
        .execute(&self.pool)
        .await
        .context("failed to claim plugin record")?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_claim(&self, id: &str, owner: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE plugin_registry SET claimed_by = NULL, claimed_at = NULL \
             WHERE id = $1 AND claimed_by = $2",
        )
        .bind(id)
        .bind(owner)
        .execute(&self.pool)
        .await
        .context("failed to release plugin claim")?;

        Ok(())
    }
}
