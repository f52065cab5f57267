//! PostgreSQL registry store tests.
//!
//! Skipped unless DATABASE_URL points at a scratch database.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use hostdesk_kernel::db;
use hostdesk_kernel::plugin::store::now;
use hostdesk_kernel::plugin::{
    LifecycleState, MigrationLedger, PgRegistryStore, PluginRecord, RegistryStore,
};
use uuid::Uuid;

async fn store() -> Option<PgRegistryStore> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set; skipping PostgreSQL store test");
        return None;
    };
    let pool = db::create_pool(&url, 2).await.expect("failed to connect");
    Some(PgRegistryStore::new(pool))
}

fn unique_id(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::now_v7().simple())
}

#[tokio::test]
async fn insert_is_first_writer_wins() {
    let Some(store) = store().await else { return };
    let id = unique_id("insert");

    let record = PluginRecord::registered(&id, "First", "1.0.0");
    assert!(store.insert(&record).await.unwrap());
    let second = PluginRecord::registered(&id, "Second", "2.0.0");
    assert!(!store.insert(&second).await.unwrap());

    let stored = store.get(&id).await.unwrap().unwrap();
    assert_eq!(stored.name, "First");
    assert_eq!(stored.status, LifecycleState::Disabled);
    assert_eq!(stored.config, serde_json::json!({}));
}

#[tokio::test]
async fn update_round_trips_lifecycle_fields() {
    let Some(store) = store().await else { return };
    let id = unique_id("update");
    store
        .insert(&PluginRecord::registered(&id, "Updater", "1.0.0"))
        .await
        .unwrap();

    let owner = Uuid::new_v4();
    let read = store.get(&id).await.unwrap().unwrap();
    let mut record = read.clone();
    record.status = LifecycleState::Degraded;
    record.enabled = true;
    record.available_version = Some("1.1.0".into());
    record.last_error = Some("migration 'm3' failed".into());
    record.config = serde_json::json!({ "region": "eu" });
    record.updated_at = now();
    assert!(store.update(&record, read.updated_at, owner).await.unwrap());

    let stored = store.get(&id).await.unwrap().unwrap();
    assert!(stored.same_state(&record));
    assert_eq!(stored.updated_at, record.updated_at);

    let missing = PluginRecord::registered(&unique_id("missing"), "Missing", "1.0.0");
    assert!(
        !store
            .update(&missing, missing.updated_at, owner)
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn update_is_rejected_for_stale_reads_and_foreign_claims() {
    let Some(store) = store().await else { return };
    let id = unique_id("optimistic");
    store
        .insert(&PluginRecord::registered(&id, "Raced", "1.0.0"))
        .await
        .unwrap();
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

    let stale = store.get(&id).await.unwrap().unwrap();
    let mut enabled = stale.clone();
    enabled.enabled = true;
    enabled.status = LifecycleState::Enabled;
    enabled.updated_at = now();
    assert!(store.update(&enabled, stale.updated_at, a).await.unwrap());

    // A write computed from the read before the enable loses.
    let mut overwrite = stale.clone();
    overwrite.available_version = Some("1.1.0".into());
    overwrite.updated_at = now();
    assert!(!store.update(&overwrite, stale.updated_at, b).await.unwrap());
    assert!(store.get(&id).await.unwrap().unwrap().enabled);

    // A current read still loses while another owner holds the claim.
    assert!(store.try_claim(&id, a, Duration::from_secs(300)).await.unwrap());
    let mut overwrite = enabled.clone();
    overwrite.enabled = false;
    overwrite.updated_at = now();
    assert!(!store.update(&overwrite, enabled.updated_at, b).await.unwrap());
    assert!(store.update(&overwrite, enabled.updated_at, a).await.unwrap());
}

#[tokio::test]
async fn claims_exclude_other_owners_until_stale() {
    let Some(store) = store().await else { return };
    let id = unique_id("claim");
    store
        .insert(&PluginRecord::registered(&id, "Claimed", "1.0.0"))
        .await
        .unwrap();
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    let window = Duration::from_secs(300);

    assert!(store.try_claim(&id, a, window).await.unwrap());
    assert!(store.try_claim(&id, a, window).await.unwrap());
    assert!(!store.try_claim(&id, b, window).await.unwrap());

    // Releasing someone else's claim is a no-op.
    store.release_claim(&id, b).await.unwrap();
    assert!(!store.try_claim(&id, b, window).await.unwrap());

    store.release_claim(&id, a).await.unwrap();
    assert!(store.try_claim(&id, b, window).await.unwrap());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(
        store
            .try_claim(&id, a, Duration::from_millis(1))
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn ledger_records_each_migration_once() {
    let Some(store) = store().await else { return };
    let id = unique_id("ledger");

    assert!(store.record_migration(&id, "m1").await.unwrap());
    assert!(store.record_migration(&id, "m2").await.unwrap());
    assert!(!store.record_migration(&id, "m1").await.unwrap());

    let applied: Vec<String> = store
        .applied_migrations(&id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.migration_id)
        .collect();
    assert_eq!(applied, vec!["m1", "m2"]);
    assert!(store.applied_migrations(&unique_id("other")).await.unwrap().is_empty());
}
