//! Plugin registry reconciler.
//!
//! Merges what discovery sees on disk with the persisted registry and drives
//! each plugin through its lifecycle. This is the only writer of registry
//! records and of the migration ledger, and the only owner of loaded
//! backend handles.
//!
//! Every mutation of one plugin id runs under that id's in-process lock and
//! the record's persisted claim, so host processes sharing a database
//! serialize too. Record writes are optimistic: a write made from a read
//! that another process has since superseded is rejected by the store.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::discovery::{self, DiscoveredPlugin, Discovery, DiscoveryIssue};
use super::error::{DuplicatePluginIdError, PluginError};
use super::lifecycle::{LifecycleState, PluginStatus};
use super::migration;
use super::runtime::{BackendHandle, PluginRuntime};
use super::store::{self, LedgerEntry, PluginRecord, RegistryStore};

/// Times a reconcile write is recomputed when its row keeps changing underneath.
const SYNC_ATTEMPTS: usize = 3;

/// Tunables for the reconciler.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Loads (and the migrations that follow) allowed to run at once.
    pub max_concurrent_loads: usize,
    /// Age after which another process's claim on a record may be taken over.
    pub claim_stale_after: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_loads: 4,
            claim_stale_after: Duration::from_secs(300),
        }
    }
}

/// What one reconciliation pass changed.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Ids seen for the first time, now registered and disabled.
    pub registered: Vec<String>,
    /// Ids whose on-disk version differs from the installed one.
    pub upgrades_pending: Vec<String>,
    /// Orphaned ids whose directory came back.
    pub reappeared: Vec<String>,
    /// Ids whose directory disappeared.
    pub orphaned: Vec<String>,
    /// Existing records rewritten by this pass.
    pub updated: Vec<String>,
    /// Later directories declaring an id that was already taken.
    pub duplicates: Vec<DuplicatePluginIdError>,
    /// Ids left untouched because another host process held them.
    pub contended: Vec<String>,
    /// Directories with unusable manifests.
    pub issues: Vec<DiscoveryIssue>,
    /// Directories without a manifest.
    pub skipped: Vec<DiscoveryIssue>,
}

impl ReconcileReport {
    /// Whether the pass wrote nothing to the registry.
    pub fn is_noop(&self) -> bool {
        self.registered.is_empty() && self.updated.is_empty() && self.orphaned.is_empty()
    }
}

/// Outcome of bringing previously enabled plugins back up at startup.
#[derive(Debug, Default)]
pub struct StartupReport {
    pub enabled: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Result of syncing one record against what this pass expects of it.
enum Synced {
    Missing,
    Unchanged,
    Written { before: PluginRecord, after: PluginRecord },
    Contended,
}

/// Holds a plugin's in-memory transient state; removing it on drop puts the
/// plugin back to its persisted state when an enable is abandoned.
struct TransientGuard<'a> {
    states: &'a DashMap<String, LifecycleState>,
    id: String,
}

impl<'a> TransientGuard<'a> {
    fn enter(states: &'a DashMap<String, LifecycleState>, id: &str, state: LifecycleState) -> Self {
        states.insert(id.to_string(), state);
        Self {
            states,
            id: id.to_string(),
        }
    }

    fn advance(&self, state: LifecycleState) {
        self.states.insert(self.id.clone(), state);
    }
}

impl Drop for TransientGuard<'_> {
    fn drop(&mut self) {
        self.states.remove(&self.id);
    }
}

/// Orchestrates discovery, loading and migration against the registry.
pub struct PluginReconciler {
    store: Arc<dyn RegistryStore>,
    runtime: Arc<PluginRuntime>,
    handles: DashMap<String, Arc<BackendHandle>>,
    transient: DashMap<String, LifecycleState>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    /// Winning directory per id from the last reconciliation pass.
    snapshot: RwLock<BTreeMap<String, DiscoveredPlugin>>,
    load_permits: Arc<Semaphore>,
    owner: Uuid,
    claim_stale_after: Duration,
}

impl PluginReconciler {
    pub fn new(
        store: Arc<dyn RegistryStore>,
        runtime: Arc<PluginRuntime>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            runtime,
            handles: DashMap::new(),
            transient: DashMap::new(),
            locks: DashMap::new(),
            snapshot: RwLock::new(BTreeMap::new()),
            load_permits: Arc::new(Semaphore::new(config.max_concurrent_loads.max(1))),
            owner: Uuid::now_v7(),
            claim_stale_after: config.claim_stale_after,
        }
    }

    pub fn runtime(&self) -> &Arc<PluginRuntime> {
        &self.runtime
    }

    pub fn store(&self) -> &Arc<dyn RegistryStore> {
        &self.store
    }

    /// Identifier this process uses when claiming records.
    pub fn owner(&self) -> Uuid {
        self.owner
    }

    /// Ids with a loaded backend handle, sorted.
    pub fn loaded_plugins(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.handles.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Discover plugins without touching the registry.
    ///
    /// The directory walk runs on a blocking thread.
    pub async fn list_discoverable(&self, root: &Path) -> Result<Discovery, PluginError> {
        let root = root.to_path_buf();
        tokio::task::spawn_blocking(move || discovery::discover(&root))
            .await
            .map_err(|e| PluginError::Discovery(e.to_string()))
    }

    /// Registry statuses merged with the given discovery pass.
    ///
    /// Plugins on disk without a record yet are listed as `Discovered`.
    pub async fn overview(&self, discovery: &Discovery) -> Result<Vec<PluginStatus>, PluginError> {
        let mut statuses: BTreeMap<String, PluginStatus> = self
            .statuses()
            .await?
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect();

        for plugin in &discovery.plugins {
            statuses
                .entry(plugin.id().to_string())
                .or_insert_with(|| PluginStatus {
                    id: plugin.id().to_string(),
                    name: plugin.manifest.name.clone(),
                    state: LifecycleState::Discovered,
                    enabled: false,
                    installed_version: String::new(),
                    available_version: Some(plugin.manifest.version.to_string()),
                    last_error: None,
                    loaded: false,
                });
        }
        Ok(statuses.into_values().collect())
    }

    /// Run a full discovery and registry sync pass.
    ///
    /// Registers new ids as disabled, flags version changes as pending
    /// upgrades, orphans ids that disappeared and restores reappearing ones.
    /// Only records whose fields change are written, so a second pass over
    /// an unchanged tree writes nothing.
    pub async fn reconcile(&self, root: &Path) -> Result<ReconcileReport, PluginError> {
        let discovered = self.list_discoverable(root).await?;
        let mut report = ReconcileReport {
            issues: discovered.issues,
            skipped: discovered.skipped,
            ..ReconcileReport::default()
        };

        let mut winners: BTreeMap<String, DiscoveredPlugin> = BTreeMap::new();
        for plugin in discovered.plugins {
            if let Some(first) = winners.get(plugin.id()) {
                let duplicate = DuplicatePluginIdError {
                    id: plugin.id().to_string(),
                    first: first.dir.clone(),
                    duplicate: plugin.dir.clone(),
                };
                error!(error = %duplicate, "duplicate plugin id");
                report.duplicates.push(duplicate);
                continue;
            }
            winners.insert(plugin.id().to_string(), plugin);
        }

        *self.snapshot.write() = winners.clone();

        for (id, plugin) in &winners {
            let lock = self.lock_for(id);
            let _serial = lock.lock().await;
            self.sync_discovered(id, plugin, &mut report).await?;
        }

        for record in self.store.list().await? {
            if winners.contains_key(&record.id) || record.status == LifecycleState::Orphaned {
                continue;
            }
            let lock = self.lock_for(&record.id);
            let _serial = lock.lock().await;
            self.orphan(&record.id, &mut report).await?;
        }

        info!(
            registered = report.registered.len(),
            updated = report.updated.len(),
            orphaned = report.orphaned.len(),
            contended = report.contended.len(),
            duplicates = report.duplicates.len(),
            issues = report.issues.len(),
            "plugin reconciliation complete"
        );

        Ok(report)
    }

    async fn sync_discovered(
        &self,
        id: &str,
        plugin: &DiscoveredPlugin,
        report: &mut ReconcileReport,
    ) -> Result<(), PluginError> {
        let manifest = &plugin.manifest;
        let disk_version = manifest.version.to_string();

        if self.store.get(id).await?.is_none() {
            let record = PluginRecord::registered(id, &manifest.name, &disk_version);
            if self.store.insert(&record).await? {
                info!(plugin = %id, version = %disk_version, "registered new plugin");
                report.registered.push(id.to_string());
                return Ok(());
            }
            // Another host registered it first; sync against its row.
        }

        let synced = self
            .sync_record(id, |record| {
                let mut next = record.clone();
                next.available_version =
                    (disk_version != record.version).then(|| disk_version.clone());
                if record.status == LifecycleState::Orphaned {
                    next.status = LifecycleState::Disabled;
                    next.enabled = false;
                }
                next
            })
            .await?;

        match synced {
            Synced::Written { before, after } => {
                if before.status == LifecycleState::Orphaned {
                    info!(plugin = %id, "orphaned plugin reappeared on disk");
                    report.reappeared.push(id.to_string());
                }
                if after.available_version.is_some()
                    && after.available_version != before.available_version
                {
                    info!(
                        plugin = %id,
                        installed = %after.version,
                        available = ?after.available_version,
                        "plugin upgrade pending"
                    );
                    report.upgrades_pending.push(id.to_string());
                }
                report.updated.push(id.to_string());
            }
            Synced::Contended => report.contended.push(id.to_string()),
            Synced::Missing | Synced::Unchanged => {}
        }
        Ok(())
    }

    async fn orphan(&self, id: &str, report: &mut ReconcileReport) -> Result<(), PluginError> {
        // The directory is gone, so nothing may keep running from it.
        self.retire_handle(id).await;

        let synced = self
            .sync_record(id, |record| {
                let mut next = record.clone();
                if record.status != LifecycleState::Orphaned {
                    next.enabled = false;
                    next.status = LifecycleState::Orphaned;
                    next.available_version = None;
                }
                next
            })
            .await?;

        match synced {
            Synced::Written { .. } => {
                warn!(plugin = %id, "plugin directory disappeared, record orphaned");
                report.orphaned.push(id.to_string());
            }
            Synced::Contended => report.contended.push(id.to_string()),
            Synced::Missing | Synced::Unchanged => {}
        }
        Ok(())
    }

    /// Bring one record in line with `change`.
    ///
    /// An unchanged record costs one read and no claim. Otherwise the change
    /// is recomputed from a fresh read under the persisted claim and written
    /// optimistically, re-reading when the row moved in between.
    async fn sync_record(
        &self,
        id: &str,
        change: impl Fn(&PluginRecord) -> PluginRecord,
    ) -> Result<Synced, PluginError> {
        let Some(record) = self.store.get(id).await? else {
            return Ok(Synced::Missing);
        };
        if change(&record).same_state(&record) {
            return Ok(Synced::Unchanged);
        }

        if !self
            .store
            .try_claim(id, self.owner, self.claim_stale_after)
            .await?
        {
            info!(plugin = %id, "plugin record is claimed by another host process, skipping");
            return Ok(Synced::Contended);
        }

        let mut outcome = Ok(Synced::Contended);
        for _ in 0..SYNC_ATTEMPTS {
            let current = match self.store.get(id).await {
                Ok(Some(current)) => current,
                Ok(None) => {
                    outcome = Ok(Synced::Missing);
                    break;
                }
                Err(e) => {
                    outcome = Err(e.into());
                    break;
                }
            };
            let next = change(&current);
            match self.persist(&current, next).await {
                Ok((after, true)) => {
                    outcome = Ok(Synced::Written {
                        before: current,
                        after,
                    });
                    break;
                }
                Ok((_, false)) => {
                    outcome = Ok(Synced::Unchanged);
                    break;
                }
                Err(PluginError::Claimed(_)) => {
                    debug!(plugin = %id, "plugin record changed underneath, re-reading");
                }
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }
        self.release(id).await;

        if matches!(outcome, Ok(Synced::Contended)) {
            warn!(plugin = %id, "plugin record kept changing during reconciliation, skipped");
        }
        outcome
    }

    /// Enable a plugin: load its backend, apply pending migrations, run its
    /// enable hook.
    ///
    /// Failures are persisted as `LoadFailed` or `Degraded` with the error
    /// retrievable through [`status`](Self::status), and also returned.
    pub async fn enable(&self, id: &str) -> Result<PluginStatus, PluginError> {
        if self.load_permits.is_closed() {
            return Err(PluginError::ShuttingDown);
        }

        let lock = self.lock_for(id);
        let _serial = lock.lock().await;

        let record = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| PluginError::NotFound(id.to_string()))?;
        if record.status == LifecycleState::Orphaned {
            return Err(PluginError::Orphaned(id.to_string()));
        }
        let discovered = self.snapshot.read().get(id).cloned();
        let Some(plugin) = discovered else {
            return Err(PluginError::NotDiscovered(id.to_string()));
        };

        if record.status == LifecycleState::Enabled
            && record.available_version.is_none()
            && self.handles.contains_key(id)
        {
            debug!(plugin = %id, "plugin already enabled");
            return Ok(self.status_of(&record));
        }

        self.claim(id).await?;
        let result = match self.read_claimed(id).await {
            Ok(record) if record.status == LifecycleState::Orphaned => {
                Err(PluginError::Orphaned(id.to_string()))
            }
            Ok(record) => self.enable_claimed(record, &plugin).await,
            Err(e) => Err(e),
        };
        self.release(id).await;
        result
    }

    async fn enable_claimed(
        &self,
        record: PluginRecord,
        plugin: &DiscoveredPlugin,
    ) -> Result<PluginStatus, PluginError> {
        let id = record.id.as_str();
        let manifest = &plugin.manifest;
        let transient = TransientGuard::enter(&self.transient, id, LifecycleState::Enabling);

        // Retire the running version before loading its replacement.
        self.retire_handle(id).await;

        let _permit = Arc::clone(&self.load_permits)
            .acquire_owned()
            .await
            .map_err(|_| PluginError::ShuttingDown)?;

        info!(plugin = %id, version = %manifest.version, "enabling plugin");

        let handle = match self.runtime.load(plugin, &record.config).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(plugin = %id, error = %e, "plugin failed to load");
                let mut next = record.clone();
                next.status = LifecycleState::LoadFailed;
                next.enabled = false;
                next.last_error = Some(e.to_string());
                self.persist(&record, next).await?;
                return Err(e.into());
            }
        };
        transient.advance(LifecycleState::Loaded);

        transient.advance(LifecycleState::MigrationPending);
        if let Err(e) =
            migration::apply_pending(id, &manifest.migrations, &*handle, &*self.store).await
        {
            warn!(plugin = %id, error = %e, "plugin degraded by failed migration");
            let mut next = record.clone();
            next.status = LifecycleState::Degraded;
            next.enabled = true;
            next.last_error = Some(e.to_string());
            self.persist(&record, next).await?;
            return Err(e);
        }

        // Migrations are complete, so the new version is installed either way.
        let mut next = record.clone();
        next.name = manifest.name.clone();
        next.version = manifest.version.to_string();
        next.available_version = None;
        next.enabled = true;

        if let Err(e) = handle.enable().await {
            warn!(plugin = %id, error = %e, "plugin enable hook failed");
            next.status = LifecycleState::Degraded;
            next.last_error = Some(e.to_string());
            self.persist(&record, next).await?;
            return Err(e.into());
        }

        next.status = LifecycleState::Enabled;
        next.last_error = None;
        let stored = match self.persist(&record, next).await {
            Ok((stored, _)) => stored,
            Err(e) => {
                // Never leave a backend enabled that the registry does not record.
                if let Err(hook) = handle.disable().await {
                    warn!(plugin = %id, error = %hook, "plugin disable hook failed");
                }
                return Err(e);
            }
        };
        self.handles.insert(id.to_string(), handle);
        drop(transient);

        info!(plugin = %id, version = %stored.version, "plugin enabled");
        Ok(self.status_of(&stored))
    }

    /// Disable a plugin. The disable hook is best-effort; the transition
    /// happens even if it fails.
    pub async fn disable(&self, id: &str) -> Result<PluginStatus, PluginError> {
        let lock = self.lock_for(id);
        let _serial = lock.lock().await;

        let record = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| PluginError::NotFound(id.to_string()))?;
        if record.status == LifecycleState::Orphaned {
            return Ok(self.status_of(&record));
        }

        self.claim(id).await?;
        let result = self.disable_claimed(id).await;
        self.release(id).await;
        result
    }

    async fn disable_claimed(&self, id: &str) -> Result<PluginStatus, PluginError> {
        let record = self.read_claimed(id).await?;
        self.retire_handle(id).await;
        if record.status == LifecycleState::Orphaned {
            return Ok(self.status_of(&record));
        }

        let mut next = record.clone();
        next.enabled = false;
        next.status = LifecycleState::Disabled;
        next.last_error = None;
        let (stored, _) = self.persist(&record, next).await?;

        info!(plugin = %id, "plugin disabled");
        Ok(self.status_of(&stored))
    }

    /// Replace a plugin's opaque configuration. The backend sees it on its
    /// next load.
    pub async fn set_config(
        &self,
        id: &str,
        config: serde_json::Value,
    ) -> Result<PluginStatus, PluginError> {
        let lock = self.lock_for(id);
        let _serial = lock.lock().await;

        if self.store.get(id).await?.is_none() {
            return Err(PluginError::NotFound(id.to_string()));
        }

        self.claim(id).await?;
        let result = self.set_config_claimed(id, config).await;
        self.release(id).await;
        result
    }

    async fn set_config_claimed(
        &self,
        id: &str,
        config: serde_json::Value,
    ) -> Result<PluginStatus, PluginError> {
        let record = self.read_claimed(id).await?;
        let mut next = record.clone();
        next.config = config;
        let (stored, _) = self.persist(&record, next).await?;
        Ok(self.status_of(&stored))
    }

    /// Current status of one plugin.
    pub async fn status(&self, id: &str) -> Result<PluginStatus, PluginError> {
        let record = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| PluginError::NotFound(id.to_string()))?;
        Ok(self.status_of(&record))
    }

    /// Status of every registered plugin, ordered by id.
    pub async fn statuses(&self) -> Result<Vec<PluginStatus>, PluginError> {
        let records = self.store.list().await?;
        Ok(records.iter().map(|r| self.status_of(r)).collect())
    }

    /// Ledger entries for one plugin, in application order.
    pub async fn applied_migrations(&self, id: &str) -> Result<Vec<LedgerEntry>, PluginError> {
        Ok(self.store.applied_migrations(id).await?)
    }

    /// Load every plugin whose record says enabled, with bounded concurrency.
    ///
    /// Call after [`reconcile`](Self::reconcile) so the discovery snapshot
    /// is populated.
    pub async fn start_enabled(self: &Arc<Self>) -> Result<StartupReport, PluginError> {
        let records = self.store.list().await?;
        let mut tasks = JoinSet::new();

        for record in records.into_iter().filter(|r| r.enabled) {
            let reconciler = Arc::clone(self);
            tasks.spawn(async move {
                let result = reconciler.enable(&record.id).await;
                (record.id, result)
            });
        }

        let mut report = StartupReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, Ok(_))) => report.enabled.push(id),
                Ok((id, Err(e))) => {
                    error!(plugin = %id, error = %e, "plugin failed to start");
                    report.failed.push((id, e.to_string()));
                }
                Err(e) => error!(error = %e, "plugin startup task panicked"),
            }
        }
        report.enabled.sort();
        report.failed.sort();

        info!(
            enabled = report.enabled.len(),
            failed = report.failed.len(),
            "enabled plugins started"
        );
        Ok(report)
    }

    /// Stop accepting loads and run the disable hook of every loaded plugin.
    ///
    /// Records keep `enabled = true` so the next start brings them back.
    pub async fn shutdown(&self) {
        self.load_permits.close();
        for id in self.loaded_plugins() {
            let lock = self.lock_for(&id);
            let _serial = lock.lock().await;
            self.retire_handle(&id).await;
        }
        info!("plugin runtime shut down");
    }

    /// Stop accepting loads and drop every handle without running disable
    /// hooks.
    ///
    /// For short-lived processes such as the CLI: the plugins they enabled
    /// stay enabled in the registry and in whatever the hooks set up.
    pub async fn detach(&self) {
        self.load_permits.close();
        for id in self.loaded_plugins() {
            let lock = self.lock_for(&id);
            let _serial = lock.lock().await;
            self.handles.remove(&id);
        }
        debug!("plugin handles detached");
    }

    fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(id.to_string()).or_default().value())
    }

    async fn claim(&self, id: &str) -> Result<(), PluginError> {
        if self
            .store
            .try_claim(id, self.owner, self.claim_stale_after)
            .await?
        {
            Ok(())
        } else {
            warn!(plugin = %id, "plugin record is claimed by another host process");
            Err(PluginError::Claimed(id.to_string()))
        }
    }

    async fn release(&self, id: &str) {
        if let Err(e) = self.store.release_claim(id, self.owner).await {
            warn!(plugin = %id, error = %e, "failed to release plugin claim");
        }
    }

    /// Re-read a record once this process holds its claim.
    async fn read_claimed(&self, id: &str) -> Result<PluginRecord, PluginError> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| PluginError::NotFound(id.to_string()))
    }

    /// Drop a loaded handle, running its disable hook first.
    async fn retire_handle(&self, id: &str) {
        let Some((_, handle)) = self.handles.remove(id) else {
            return;
        };
        if let Err(e) = handle.disable().await {
            warn!(plugin = %id, error = %e, "plugin disable hook failed, releasing anyway");
        }
        debug!(plugin = %id, "released backend handle");
    }

    /// Write `next` if it differs from `current`, the record it was derived
    /// from. Returns the stored record and whether a write happened.
    ///
    /// Fails with `Claimed` when the row no longer matches `current` or
    /// another process holds its claim.
    async fn persist(
        &self,
        current: &PluginRecord,
        mut next: PluginRecord,
    ) -> Result<(PluginRecord, bool), PluginError> {
        if current.same_state(&next) {
            return Ok((next, false));
        }
        next.updated_at = store::now();
        if !self
            .store
            .update(&next, current.updated_at, self.owner)
            .await?
        {
            warn!(plugin = %next.id, "plugin record changed underneath, write rejected");
            return Err(PluginError::Claimed(next.id));
        }
        Ok((next, true))
    }

    fn status_of(&self, record: &PluginRecord) -> PluginStatus {
        let state = self
            .transient
            .get(&record.id)
            .map(|s| *s.value())
            .unwrap_or(record.status);

        PluginStatus {
            id: record.id.clone(),
            name: record.name.clone(),
            state,
            enabled: record.enabled,
            installed_version: record.version.clone(),
            available_version: record.available_version.clone(),
            last_error: record.last_error.clone(),
            loaded: self.handles.contains_key(&record.id),
        }
    }
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn transient_state_is_cleared_on_drop() {
        let states = DashMap::new();
        {
            let guard = TransientGuard::enter(&states, "p", LifecycleState::Enabling);
            guard.advance(LifecycleState::MigrationPending);
            assert_eq!(*states.get("p").unwrap(), LifecycleState::MigrationPending);
        }
        assert!(states.get("p").is_none());
    }

    #[test]
    fn report_with_only_diagnostics_is_a_noop() {
        let report = ReconcileReport {
            skipped: vec![DiscoveryIssue {
                dir: std::path::PathBuf::from("/plugins/stray"),
                error: PluginError::ManifestMissing {
                    path: "/plugins/stray".into(),
                },
            }],
            contended: vec!["busy".into()],
            ..ReconcileReport::default()
        };
        assert!(report.is_noop());

        let report = ReconcileReport {
            orphaned: vec!["gone".into()],
            ..ReconcileReport::default()
        };
        assert!(!report.is_noop());
    }
}
