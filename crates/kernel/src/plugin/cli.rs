//! CLI command implementations for plugin management.
//!
//! Each command runs a reconciliation pass first so it works on the current
//! state of the plugins directory. Handles loaded by a CLI process live
//! only as long as that process and are detached, not disabled, when it
//! exits; a running server keeps its own.

use std::path::Path;

use anyhow::Result;

use super::reconciler::{PluginReconciler, ReconcileReport};

/// List discovered plugins next to their registry status.
pub async fn cmd_plugin_list(reconciler: &PluginReconciler, plugins_dir: &Path) -> Result<()> {
    let discovery = reconciler.list_discoverable(plugins_dir).await?;
    let statuses = reconciler.overview(&discovery).await?;

    if statuses.is_empty() && discovery.issues.is_empty() {
        println!("No plugins found.");
        return Ok(());
    }

    println!(
        "{:<24} {:<12} {:<18} {:<10} {:<10}",
        "PLUGIN", "ON DISK", "STATUS", "INSTALLED", "MIGRATIONS"
    );
    println!("{}", "-".repeat(78));

    for status in &statuses {
        let on_disk = discovery.plugins.iter().find(|p| p.id() == status.id);
        let installed = if status.installed_version.is_empty() {
            "-"
        } else {
            status.installed_version.as_str()
        };
        match on_disk {
            Some(plugin) => println!(
                "{:<24} {:<12} {:<18} {:<10} {}",
                status.id,
                plugin.manifest.version.to_string(),
                status.state.as_str(),
                installed,
                plugin.manifest.migrations.len()
            ),
            None => println!(
                "{:<24} {:<12} {:<18} {:<10} ? (not on disk)",
                status.id,
                "-",
                status.state.as_str(),
                installed
            ),
        }
    }

    for issue in &discovery.issues {
        println!("invalid: {}: {}", issue.dir.display(), issue.error);
    }

    Ok(())
}

/// Run one reconciliation pass and print what changed.
pub async fn cmd_plugin_reconcile(
    reconciler: &PluginReconciler,
    plugins_dir: &Path,
) -> Result<()> {
    let report = reconciler.reconcile(plugins_dir).await?;
    print_report(&report);
    Ok(())
}

/// Enable a plugin in this process and persist the result.
pub async fn cmd_plugin_enable(
    reconciler: &PluginReconciler,
    plugins_dir: &Path,
    id: &str,
) -> Result<()> {
    reconciler.reconcile(plugins_dir).await?;
    let status = reconciler.enable(id).await?;
    println!("Plugin '{}' v{} enabled.", status.id, status.installed_version);
    println!("Note: its enable hook ran in this CLI process only and it stays enabled.");
    println!("A running server loads it on its next restart.");
    Ok(())
}

/// Disable a plugin.
pub async fn cmd_plugin_disable(
    reconciler: &PluginReconciler,
    plugins_dir: &Path,
    id: &str,
) -> Result<()> {
    reconciler.reconcile(plugins_dir).await?;
    let status = reconciler.disable(id).await?;
    println!("Plugin '{}' {}.", status.id, status.state);
    Ok(())
}

/// Show one plugin's status.
pub async fn cmd_plugin_status(
    reconciler: &PluginReconciler,
    plugins_dir: &Path,
    id: &str,
) -> Result<()> {
    reconciler.reconcile(plugins_dir).await?;
    let status = reconciler.status(id).await?;

    println!("plugin:     {}", status.id);
    println!("name:       {}", status.name);
    println!("state:      {}", status.state);
    println!("enabled:    {}", status.enabled);
    println!("installed:  {}", status.installed_version);
    if let Some(available) = &status.available_version {
        println!("available:  {available} (upgrade pending)");
    }
    if let Some(error) = &status.last_error {
        println!("last error: {error}");
    }
    Ok(())
}

/// Show which declared migrations are applied and which are pending.
pub async fn cmd_plugin_migrate_status(
    reconciler: &PluginReconciler,
    plugins_dir: &Path,
    id: &str,
) -> Result<()> {
    let discovery = reconciler.list_discoverable(plugins_dir).await?;
    let applied = reconciler.applied_migrations(id).await?;

    let Some(plugin) = discovery.plugins.iter().find(|p| p.id() == id) else {
        println!("Plugin '{id}' is not on disk; {} ledger entries kept.", applied.len());
        for entry in &applied {
            println!("  applied  {}  {}", entry.migration_id, entry.applied_at.to_rfc3339());
        }
        return Ok(());
    };

    if plugin.manifest.migrations.is_empty() {
        println!("Plugin '{id}' declares no migrations.");
        return Ok(());
    }

    for decl in &plugin.manifest.migrations {
        match applied.iter().find(|e| e.migration_id == decl.id) {
            Some(entry) => println!("  applied  {}  {}", decl.id, entry.applied_at.to_rfc3339()),
            None => println!("  pending  {}", decl.id),
        }
    }
    Ok(())
}

fn print_report(report: &ReconcileReport) {
    if report.is_noop()
        && report.duplicates.is_empty()
        && report.issues.is_empty()
        && report.contended.is_empty()
    {
        println!("Registry is up to date.");
        return;
    }
    for id in &report.registered {
        println!("registered: {id}");
    }
    for id in &report.upgrades_pending {
        println!("upgrade pending: {id}");
    }
    for id in &report.reappeared {
        println!("reappeared: {id}");
    }
    for id in &report.orphaned {
        println!("orphaned: {id}");
    }
    for id in &report.contended {
        println!("busy (claimed by another process): {id}");
    }
    for duplicate in &report.duplicates {
        println!("duplicate: {duplicate}");
    }
    for issue in &report.issues {
        println!("invalid: {}: {}", issue.dir.display(), issue.error);
    }
}
