//! In-process registry store for tests and runs without a database.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use super::{LedgerEntry, MigrationLedger, PluginRecord, RegistryStore};

/// Registry and ledger held in memory.
///
/// The ledger enforces `(plugin_id, migration_id)` uniqueness the same way
/// the database's primary key does.
#[derive(Debug, Default)]
pub struct MemoryRegistryStore {
    records: Mutex<BTreeMap<String, PluginRecord>>,
    ledger: Mutex<Vec<LedgerEntry>>,
    writes: AtomicU64,
}

impl MemoryRegistryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of record inserts, record updates and ledger inserts so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// The whole ledger in insertion order.
    pub fn ledger_entries(&self) -> Vec<LedgerEntry> {
        self.ledger.lock().clone()
    }

    fn wrote(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl MigrationLedger for MemoryRegistryStore {
    async fn applied_migrations(&self, plugin_id: &str) -> Result<Vec<LedgerEntry>> {
        Ok(self
            .ledger
            .lock()
            .iter()
            .filter(|e| e.plugin_id == plugin_id)
            .cloned()
            .collect())
    }

    async fn record_migration(&self, plugin_id: &str, migration_id: &str) -> Result<bool> {
        let mut ledger = self.ledger.lock();
        if ledger
            .iter()
            .any(|e| e.plugin_id == plugin_id && e.migration_id == migration_id)
        {
            return Ok(false);
        }
        ledger.push(LedgerEntry {
            plugin_id: plugin_id.to_string(),
            migration_id: migration_id.to_string(),
            applied_at: Utc::now(),
        });
        self.wrote();
        Ok(true)
    }
}

#[async_trait]
impl RegistryStore for MemoryRegistryStore {
    async fn get(&self, id: &str) -> Result<Option<PluginRecord>> {
        Ok(self.records.lock().get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<PluginRecord>> {
        Ok(self.records.lock().values().cloned().collect())
    }

    async fn insert(&self, record: &PluginRecord) -> Result<bool> {
        let mut records = self.records.lock();
        if records.contains_key(&record.id) {
            return Ok(false);
        }
        records.insert(record.id.clone(), record.clone());
        self.wrote();
        Ok(true)
    }

    async fn update(
        &self,
        record: &PluginRecord,
        expected_updated_at: DateTime<Utc>,
        owner: Uuid,
    ) -> Result<bool> {
        let mut records = self.records.lock();
        let Some(existing) = records.get_mut(&record.id) else {
            return Ok(false);
        };
        if existing.updated_at != expected_updated_at
            || existing.claimed_by.is_some_and(|holder| holder != owner)
        {
            return Ok(false);
        }
        let claimed_by = existing.claimed_by;
        let claimed_at = existing.claimed_at;
        *existing = PluginRecord {
            claimed_by,
            claimed_at,
            ..record.clone()
        };
        self.wrote();
        Ok(true)
    }

    async fn try_claim(&self, id: &str, owner: Uuid, stale_after: Duration) -> Result<bool> {
        let mut records = self.records.lock();
        let Some(record) = records.get_mut(id) else {
            return Ok(false);
        };

        let now = Utc::now();
        let stale = record.claimed_at.is_none_or(|at| {
            (now - at)
                .to_std()
                .is_ok_and(|held_for| held_for >= stale_after)
        });
        let claimable = match record.claimed_by {
            None => true,
            Some(holder) => holder == owner || stale,
        };

        if claimable {
            record.claimed_by = Some(owner);
            record.claimed_at = Some(now);
        }
        Ok(claimable)
    }

    async fn release_claim(&self, id: &str, owner: Uuid) -> Result<()> {
        if let Some(record) = self.records.lock().get_mut(id) {
            if record.claimed_by == Some(owner) {
                record.claimed_by = None;
                record.claimed_at = None;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::plugin::lifecycle::LifecycleState;

    #[tokio::test]
    async fn insert_is_first_writer_wins() {
        let store = MemoryRegistryStore::new();
        let record = PluginRecord::registered("a", "A", "1.0.0");

        assert!(store.insert(&record).await.unwrap());
        assert!(!store.insert(&record).await.unwrap());
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn update_preserves_claim_columns() {
        let store = MemoryRegistryStore::new();
        let owner = Uuid::new_v4();
        let record = PluginRecord::registered("a", "A", "1.0.0");
        store.insert(&record).await.unwrap();
        assert!(store.try_claim("a", owner, Duration::from_secs(60)).await.unwrap());

        let mut changed = record.clone();
        changed.status = LifecycleState::Enabled;
        changed.updated_at = record.updated_at + chrono::Duration::seconds(1);
        assert!(store.update(&changed, record.updated_at, owner).await.unwrap());

        let stored = store.get("a").await.unwrap().unwrap();
        assert_eq!(stored.status, LifecycleState::Enabled);
        assert_eq!(stored.updated_at, changed.updated_at);
        assert_eq!(stored.claimed_by, Some(owner));
    }

    #[tokio::test]
    async fn update_from_stale_read_is_rejected() {
        let store = MemoryRegistryStore::new();
        let owner = Uuid::new_v4();
        let stale = PluginRecord::registered("a", "A", "1.0.0");
        store.insert(&stale).await.unwrap();

        let mut enabled = stale.clone();
        enabled.status = LifecycleState::Enabled;
        enabled.enabled = true;
        enabled.updated_at = stale.updated_at + chrono::Duration::seconds(1);
        assert!(store.update(&enabled, stale.updated_at, owner).await.unwrap());

        // A writer still holding the first read loses.
        let mut late = stale.clone();
        late.available_version = Some("1.1.0".into());
        assert!(!store.update(&late, stale.updated_at, owner).await.unwrap());

        let stored = store.get("a").await.unwrap().unwrap();
        assert!(stored.same_state(&enabled));
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test]
    async fn update_under_foreign_claim_is_rejected() {
        let store = MemoryRegistryStore::new();
        let (holder, other) = (Uuid::new_v4(), Uuid::new_v4());
        let record = PluginRecord::registered("a", "A", "1.0.0");
        store.insert(&record).await.unwrap();
        assert!(store.try_claim("a", holder, Duration::from_secs(60)).await.unwrap());

        let mut changed = record.clone();
        changed.enabled = true;
        assert!(!store.update(&changed, record.updated_at, other).await.unwrap());
        assert!(store.update(&changed, record.updated_at, holder).await.unwrap());
    }

    #[tokio::test]
    async fn update_of_missing_record_writes_nothing() {
        let store = MemoryRegistryStore::new();
        let record = PluginRecord::registered("ghost", "Ghost", "1.0.0");
        assert!(!store.update(&record, record.updated_at, Uuid::new_v4()).await.unwrap());
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn claims_exclude_other_owners_until_stale() {
        let store = MemoryRegistryStore::new();
        store
            .insert(&PluginRecord::registered("a", "A", "1.0.0"))
            .await
            .unwrap();
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());
        let minute = Duration::from_secs(60);

        assert!(store.try_claim("a", first, minute).await.unwrap());
        assert!(store.try_claim("a", first, minute).await.unwrap());
        assert!(!store.try_claim("a", second, minute).await.unwrap());
        // A zero staleness window lets anyone take over.
        assert!(store.try_claim("a", second, Duration::ZERO).await.unwrap());

        store.release_claim("a", first).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().unwrap().claimed_by, Some(second));
        store.release_claim("a", second).await.unwrap();
        assert!(store.try_claim("a", first, minute).await.unwrap());
    }

    #[tokio::test]
    async fn ledger_rejects_duplicates() {
        let store = MemoryRegistryStore::new();
        assert!(store.record_migration("p", "m1").await.unwrap());
        assert!(!store.record_migration("p", "m1").await.unwrap());
        assert!(store.record_migration("q", "m1").await.unwrap());
        assert_eq!(store.applied_migrations("p").await.unwrap().len(), 1);
        assert_eq!(store.ledger_entries().len(), 2);
    }
}
