//! Persistence for plugin registry records and the migration ledger.
//!
//! The reconciler is the only caller that writes through these traits.

mod memory;
mod postgres;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::lifecycle::LifecycleState;

pub use memory::MemoryRegistryStore;
pub use postgres::{PgRegistryStore, ensure_schema};

/// Current time at the microsecond precision the database keeps, so a
/// timestamp read back compares equal to the one written.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// One plugin's persisted registry row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginRecord {
    pub id: String,
    pub name: String,
    /// Installed version (the one whose migrations have been applied).
    pub version: String,
    /// Version last seen on disk, when it differs from `version`.
    pub available_version: Option<String>,
    pub enabled: bool,
    /// Persisted lifecycle state. Never a transient state.
    pub status: LifecycleState,
    pub last_error: Option<String>,
    /// Opaque plugin configuration; never interpreted by the runtime.
    pub config: serde_json::Value,
    pub claimed_by: Option<Uuid>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PluginRecord {
    /// A freshly discovered plugin: registered and disabled.
    pub fn registered(id: &str, name: &str, version: &str) -> Self {
        let now = now();
        Self {
            id: id.to_string(),
            name: name.to_string(),
            version: version.to_string(),
            available_version: None,
            enabled: false,
            status: LifecycleState::Disabled,
            last_error: None,
            config: serde_json::Value::Object(serde_json::Map::new()),
            claimed_by: None,
            claimed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the mutable registry fields match, ignoring timestamps and
    /// claim bookkeeping.
    pub fn same_state(&self, other: &PluginRecord) -> bool {
        self.name == other.name
            && self.version == other.version
            && self.available_version == other.available_version
            && self.enabled == other.enabled
            && self.status == other.status
            && self.last_error == other.last_error
            && self.config == other.config
    }
}

/// One applied migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    pub plugin_id: String,
    pub migration_id: String,
    pub applied_at: DateTime<Utc>,
}

/// Append-only record of applied migrations.
#[async_trait]
pub trait MigrationLedger: Send + Sync {
    /// Entries for one plugin in the order they were recorded.
    async fn applied_migrations(&self, plugin_id: &str) -> Result<Vec<LedgerEntry>>;

    /// Record a migration. Returns `false` when the entry already exists.
    async fn record_migration(&self, plugin_id: &str, migration_id: &str) -> Result<bool>;
}

/// Registry of plugin records.
#[async_trait]
pub trait RegistryStore: MigrationLedger {
    async fn get(&self, id: &str) -> Result<Option<PluginRecord>>;

    /// All records ordered by id.
    async fn list(&self) -> Result<Vec<PluginRecord>>;

    /// Insert a new record. Returns `false` when the id already exists.
    async fn insert(&self, record: &PluginRecord) -> Result<bool>;

    /// Overwrite a record's mutable fields, optimistically.
    ///
    /// Writes only while the stored row still carries `expected_updated_at`
    /// and no owner other than `owner` holds its claim. Returns `false` when
    /// either check fails or the record is gone. Claim columns are left alone.
    async fn update(
        &self,
        record: &PluginRecord,
        expected_updated_at: DateTime<Utc>,
        owner: Uuid,
    ) -> Result<bool>;

    /// Take the cross-process claim on a record.
    ///
    /// Succeeds when the record is unclaimed, already claimed by `owner`, or
    /// claimed longer ago than `stale_after`.
    async fn try_claim(&self, id: &str, owner: Uuid, stale_after: Duration) -> Result<bool>;

    /// Release a claim held by `owner`. A claim held by someone else is
    /// left in place.
    async fn release_claim(&self, id: &str, owner: Uuid) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_records_start_disabled_with_empty_config() {
        let record = PluginRecord::registered("billing-sync", "Billing Sync", "1.0.0");
        assert!(!record.enabled);
        assert_eq!(record.status, LifecycleState::Disabled);
        assert_eq!(record.config, serde_json::json!({}));
        assert!(record.claimed_by.is_none());
    }

    #[test]
    fn same_state_ignores_timestamps() {
        let a = PluginRecord::registered("x", "X", "1.0.0");
        let mut b = a.clone();
        b.updated_at = a.updated_at + chrono::Duration::seconds(30);
        b.claimed_by = Some(Uuid::new_v4());
        assert!(a.same_state(&b));

        b.available_version = Some("1.1.0".into());
        assert!(!a.same_state(&b));
    }
}
