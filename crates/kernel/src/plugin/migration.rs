//! Plugin migration runner.
//!
//! Computes which of a plugin's declared migrations are missing from the
//! ledger, runs them strictly in declared order through the loaded backend,
//! and records each one in the ledger as soon as it succeeds. A failure
//! stops the sequence; everything recorded before it stays recorded.

use std::collections::HashSet;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::error::{InvokeError, MigrationError, PluginError};
use super::manifest::MigrationDecl;
use super::store::MigrationLedger;

/// Something that can run a plugin's migration logic by id.
#[async_trait]
pub trait MigrationExecutor: Send + Sync {
    async fn run_migration(&self, migration_id: &str) -> Result<(), InvokeError>;
}

/// Declared migrations not yet in the ledger, in declared order.
pub fn pending_migrations<'a>(
    declared: &'a [MigrationDecl],
    applied: &HashSet<&str>,
) -> Vec<&'a MigrationDecl> {
    declared
        .iter()
        .filter(|m| !applied.contains(m.id.as_str()))
        .collect()
}

/// Run pending migrations for a single plugin.
///
/// Returns the ids applied by this call, in order. With nothing pending
/// this is a no-op returning an empty list.
pub async fn apply_pending<E, L>(
    plugin_id: &str,
    declared: &[MigrationDecl],
    executor: &E,
    ledger: &L,
) -> Result<Vec<String>, PluginError>
where
    E: MigrationExecutor + ?Sized,
    L: MigrationLedger + ?Sized,
{
    if declared.is_empty() {
        return Ok(Vec::new());
    }

    let ledger_entries = ledger.applied_migrations(plugin_id).await?;
    let applied_set: HashSet<&str> = ledger_entries
        .iter()
        .map(|e| e.migration_id.as_str())
        .collect();

    let pending = pending_migrations(declared, &applied_set);
    if pending.is_empty() {
        debug!(plugin = plugin_id, "no pending migrations");
        return Ok(Vec::new());
    }

    info!(
        plugin = plugin_id,
        count = pending.len(),
        "running pending migrations"
    );

    let mut newly_applied = Vec::with_capacity(pending.len());

    for migration in pending {
        let failure = |details: String, applied: &Vec<String>| MigrationError {
            plugin: plugin_id.to_string(),
            migration: migration.id.clone(),
            details,
            applied: applied.clone(),
        };

        if let Err(e) = executor.run_migration(&migration.id).await {
            warn!(
                plugin = plugin_id,
                migration = %migration.id,
                error = %e,
                "migration failed, halting sequence"
            );
            return Err(failure(e.to_string(), &newly_applied).into());
        }

        // Record immediately so a crash replays at most the next migration.
        match ledger.record_migration(plugin_id, &migration.id).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(failure(
                    "ledger already has this migration; another writer applied it concurrently"
                        .to_string(),
                    &newly_applied,
                )
                .into());
            }
            Err(e) => {
                return Err(failure(
                    format!("migration ran but could not be recorded: {e:#}"),
                    &newly_applied,
                )
                .into());
            }
        }

        debug!(plugin = plugin_id, migration = %migration.id, "applied migration");
        newly_applied.push(migration.id.clone());
    }

    info!(
        plugin = plugin_id,
        count = newly_applied.len(),
        "migrations applied successfully"
    );

    Ok(newly_applied)
}
