//! WASM plugin runtime: the backend loader.
//!
//! Compiles a plugin's entrypoint module and instantiates it in its own
//! store with a fuel budget, memory limits and only the host imports its
//! capabilities grant. Loading and every call run on a blocking thread under
//! a wall-clock deadline, enforced both by the awaiting task and by epoch
//! interruption inside the engine, so a trap, a panic, a spin or a hang in
//! plugin code comes back as a [`LoadError`] or [`InvokeError`] value instead
//! of reaching the host.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use semver::{Version, VersionReq};
use tracing::{debug, info, warn};
use wasmtime::{Engine, Instance, Linker, Module, Store, StoreLimitsBuilder, Trap, TypedFunc};

use super::discovery::DiscoveredPlugin;
use super::error::{InvokeError, LoadError};
use super::host::{self, PluginState};
use super::migration::MigrationExecutor;

/// Export called after a successful enable.
pub const ENABLE_EXPORT: &str = "tap-enable";
/// Export called when a plugin is disabled or retired.
pub const DISABLE_EXPORT: &str = "tap-disable";
/// Optional reactor-style initializer, run once at load.
pub const INITIALIZE_EXPORT: &str = "_initialize";

/// Granularity of wall-clock deadlines inside running plugin code.
const EPOCH_TICK: Duration = Duration::from_millis(10);

/// Configuration for the plugin runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Fuel granted to instantiation and to each individual call.
    pub fuel: u64,
    /// Maximum memory pages per instance (64KB per page).
    pub max_memory_pages: u64,
    /// Wall-clock bound for a whole load.
    pub load_timeout: Duration,
    /// Wall-clock bound for each hook or migration call.
    pub call_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            fuel: 500_000_000,
            max_memory_pages: 1024, // 64MB max per instance
            load_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Host contract version check, supplied by the surrounding application.
pub trait HostCompatibility: Send + Sync {
    /// Version of the host API this process implements.
    fn host_version(&self) -> &Version;

    fn satisfies(&self, requirement: &VersionReq) -> bool {
        requirement.matches(self.host_version())
    }
}

/// Host compatibility backed by a single configured version.
#[derive(Debug, Clone)]
pub struct HostApiVersion(pub Version);

impl HostCompatibility for HostApiVersion {
    fn host_version(&self) -> &Version {
        &self.0
    }
}

/// Loads plugin backends in isolation.
pub struct PluginRuntime {
    engine: Engine,
    config: RuntimeConfig,
    host: Arc<dyn HostCompatibility>,
    loads: AtomicU64,
    ticker: Arc<EpochTicker>,
}

impl PluginRuntime {
    /// Create a new plugin runtime with the given configuration.
    pub fn new(config: RuntimeConfig, host: Arc<dyn HostCompatibility>) -> Result<Self> {
        let engine = create_engine()?;
        let ticker = Arc::new(EpochTicker::start(&engine)?);

        Ok(Self {
            engine,
            config,
            host,
            loads: AtomicU64::new(0),
            ticker,
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Version of the host API plugins are checked against.
    pub fn host_version(&self) -> &Version {
        self.host.host_version()
    }

    /// Number of load attempts that reached plugin code.
    pub fn loads_attempted(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    /// Load a plugin backend.
    ///
    /// `plugin_config` is the registry's opaque payload; it is handed to the
    /// plugin through the `config` capability and never inspected here.
    pub async fn load(
        &self,
        plugin: &DiscoveredPlugin,
        plugin_config: &serde_json::Value,
    ) -> Result<Arc<BackendHandle>, LoadError> {
        let plugin_id = plugin.id().to_string();

        if let Some(required) = &plugin.manifest.host_api {
            if !self.host.satisfies(required) {
                return Err(LoadError::IncompatibleHostVersion {
                    plugin: plugin_id,
                    required: required.to_string(),
                    host: self.host.host_version().to_string(),
                });
            }
        }

        let entrypoint = plugin.entrypoint_path();
        if !entrypoint.is_file() {
            return Err(LoadError::EntrypointNotFound {
                plugin: plugin_id,
                path: entrypoint.display().to_string(),
            });
        }

        self.loads.fetch_add(1, Ordering::Relaxed);
        debug!(plugin = %plugin_id, entrypoint = %entrypoint.display(), "loading plugin backend");

        let engine = self.engine.clone();
        let config = self.config.clone();
        let plugin = plugin.clone();
        let payload = serde_json::to_vec(plugin_config).unwrap_or_default();
        let ticker = Arc::clone(&self.ticker);

        let task = tokio::task::spawn_blocking(move || {
            instantiate(&engine, &config, &plugin, payload, ticker)
        });

        match tokio::time::timeout(self.config.load_timeout, task).await {
            Err(_) => {
                warn!(plugin = %plugin_id, "plugin load timed out, abandoning");
                Err(LoadError::Timeout {
                    plugin: plugin_id,
                    budget: format!("{:?} wall-clock", self.config.load_timeout),
                })
            }
            Ok(Err(join_error)) => Err(LoadError::EntrypointExecution {
                plugin: plugin_id,
                details: format!("load panicked: {}", panic_message(join_error)),
            }),
            Ok(Ok(Ok(handle))) => {
                info!(
                    plugin = %handle.plugin_id,
                    version = %handle.version,
                    migrations = handle.migration_count(),
                    "plugin backend loaded"
                );
                Ok(Arc::new(handle))
            }
            Ok(Ok(Err(e))) => Err(e),
        }
    }
}

/// Creates a Wasmtime Engine with fuel metering and epoch interruption
/// enabled.
fn create_engine() -> Result<Engine> {
    let mut wasmtime_config = wasmtime::Config::new();
    wasmtime_config.consume_fuel(true);
    wasmtime_config.epoch_interruption(true);
    wasmtime_config.cranelift_opt_level(wasmtime::OptLevel::Speed);

    Engine::new(&wasmtime_config)
        .map_err(anyhow::Error::from)
        .context("failed to create wasmtime engine")
}

/// Advances the engine epoch every [`EPOCH_TICK`] until dropped.
///
/// Shared by the runtime, in-flight loads and loaded handles, so a call the
/// host stopped waiting for still reaches its deadline after the runtime
/// itself is gone.
struct EpochTicker {
    stop: Arc<AtomicBool>,
}

impl EpochTicker {
    fn start(engine: &Engine) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let engine = engine.clone();
        let stopped = Arc::clone(&stop);
        std::thread::Builder::new()
            .name("plugin-epoch".into())
            .spawn(move || {
                while !stopped.load(Ordering::Relaxed) {
                    std::thread::sleep(EPOCH_TICK);
                    engine.increment_epoch();
                }
            })
            .context("failed to start plugin epoch ticker")?;
        Ok(Self { stop })
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

/// Epoch ticks covering `budget`, rounded up.
fn epoch_ticks(budget: Duration) -> u64 {
    let ticks = budget.as_millis() / EPOCH_TICK.as_millis();
    u64::try_from(ticks).unwrap_or(u64::MAX).saturating_add(1)
}

/// Compile, link and instantiate one plugin. Runs on a blocking thread.
fn instantiate(
    engine: &Engine,
    config: &RuntimeConfig,
    plugin: &DiscoveredPlugin,
    payload: Vec<u8>,
    ticker: Arc<EpochTicker>,
) -> Result<BackendHandle, LoadError> {
    let manifest = &plugin.manifest;
    let plugin_id = manifest.id.clone();
    let failed = |details: String| LoadError::EntrypointExecution {
        plugin: plugin_id.clone(),
        details,
    };

    let module = Module::from_file(engine, plugin.entrypoint_path())
        .map_err(|e| failed(format!("failed to compile module: {e:#}")))?;

    let mut linker: Linker<PluginState> = Linker::new(engine);
    host::register_for_capabilities(&mut linker, &manifest.capabilities)
        .map_err(|e| failed(format!("failed to link host functions: {e:#}")))?;

    let memory_bytes = usize::try_from(config.max_memory_pages.saturating_mul(65536))
        .unwrap_or(usize::MAX);
    let limits = StoreLimitsBuilder::new()
        .memory_size(memory_bytes)
        .instances(1)
        .build();
    let mut store = Store::new(engine, PluginState::new(&plugin_id, payload, limits));
    store.limiter(|state| &mut state.limits);
    store
        .set_fuel(config.fuel)
        .map_err(|e| failed(format!("failed to set fuel: {e:#}")))?;
    store.set_epoch_deadline(epoch_ticks(config.load_timeout));
    store.epoch_deadline_trap();

    let instance = linker
        .instantiate(&mut store, &module)
        .map_err(|e| classify_load_failure(&store, &plugin_id, "instantiation", &e, config))?;

    if instance.get_export(&mut store, INITIALIZE_EXPORT).is_some() {
        let init = instance
            .get_typed_func::<(), ()>(&mut store, INITIALIZE_EXPORT)
            .map_err(|e| failed(format!("'{INITIALIZE_EXPORT}' has the wrong signature: {e:#}")))?;
        init.call(&mut store, ())
            .map_err(|e| classify_load_failure(&store, &plugin_id, INITIALIZE_EXPORT, &e, config))?;
    }

    let enable = resolve_hook(&instance, &mut store, ENABLE_EXPORT).map_err(failed)?;
    let disable = resolve_hook(&instance, &mut store, DISABLE_EXPORT).map_err(failed)?;

    let mut migrations = HashMap::with_capacity(manifest.migrations.len());
    for decl in &manifest.migrations {
        let func = instance
            .get_typed_func::<(), i32>(&mut store, &decl.export)
            .map_err(|e| {
                failed(format!(
                    "migration '{}' needs export '{}' of type () -> i32: {e:#}",
                    decl.id, decl.export
                ))
            })?;
        migrations.insert(decl.id.clone(), func);
    }

    Ok(BackendHandle {
        plugin_id,
        version: manifest.version.clone(),
        capabilities: manifest.capabilities.clone(),
        fuel: config.fuel,
        call_timeout: config.call_timeout,
        inner: Arc::new(Mutex::new(HandleInner {
            store,
            enable,
            disable,
            migrations,
            _ticker: ticker,
        })),
    })
}

/// Resolve an optional lifecycle export; present-but-mistyped is an error.
fn resolve_hook(
    instance: &Instance,
    store: &mut Store<PluginState>,
    name: &str,
) -> Result<Option<TypedFunc<(), i32>>, String> {
    if instance.get_export(&mut *store, name).is_none() {
        return Ok(None);
    }
    instance
        .get_typed_func::<(), i32>(&mut *store, name)
        .map(Some)
        .map_err(|e| format!("'{name}' must have type () -> i32: {e:#}"))
}

fn out_of_fuel(store: &Store<PluginState>, error: &wasmtime::Error) -> bool {
    matches!(error.downcast_ref::<Trap>(), Some(Trap::OutOfFuel))
        || store.get_fuel().is_ok_and(|fuel| fuel == 0)
}

fn interrupted(error: &wasmtime::Error) -> bool {
    matches!(error.downcast_ref::<Trap>(), Some(Trap::Interrupt))
}

fn classify_load_failure(
    store: &Store<PluginState>,
    plugin_id: &str,
    phase: &str,
    error: &wasmtime::Error,
    config: &RuntimeConfig,
) -> LoadError {
    if interrupted(error) {
        LoadError::Timeout {
            plugin: plugin_id.to_string(),
            budget: format!("{:?} wall-clock", config.load_timeout),
        }
    } else if out_of_fuel(store, error) {
        LoadError::Timeout {
            plugin: plugin_id.to_string(),
            budget: format!("{} fuel", config.fuel),
        }
    } else {
        LoadError::EntrypointExecution {
            plugin: plugin_id.to_string(),
            details: format!("{phase} failed: {error:#}"),
        }
    }
}

fn panic_message(error: tokio::task::JoinError) -> String {
    match error.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string()),
        Err(e) => e.to_string(),
    }
}

/// Which export a handle call targets.
#[derive(Debug, Clone)]
enum Call {
    Enable,
    Disable,
    Migration(String),
}

struct HandleInner {
    store: Store<PluginState>,
    enable: Option<TypedFunc<(), i32>>,
    disable: Option<TypedFunc<(), i32>>,
    migrations: HashMap<String, TypedFunc<(), i32>>,
    _ticker: Arc<EpochTicker>,
}

/// The capability-scoped surface of a loaded plugin.
///
/// Exposes the lifecycle hooks and the resolved migrations, nothing else.
pub struct BackendHandle {
    plugin_id: String,
    version: Version,
    capabilities: BTreeSet<String>,
    fuel: u64,
    call_timeout: Duration,
    inner: Arc<Mutex<HandleInner>>,
}

impl fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendHandle")
            .field("plugin_id", &self.plugin_id)
            .field("version", &self.version)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

impl BackendHandle {
    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn capabilities(&self) -> &BTreeSet<String> {
        &self.capabilities
    }

    /// Whether a migration was resolved at load.
    pub fn has_migration(&self, migration_id: &str) -> bool {
        self.inner.lock().migrations.contains_key(migration_id)
    }

    pub fn migration_count(&self) -> usize {
        self.inner.lock().migrations.len()
    }

    /// Run the plugin's enable hook, if it has one.
    pub async fn enable(&self) -> Result<(), InvokeError> {
        self.invoke(Call::Enable).await
    }

    /// Run the plugin's disable hook, if it has one.
    pub async fn disable(&self) -> Result<(), InvokeError> {
        self.invoke(Call::Disable).await
    }

    /// Run one resolved migration.
    pub async fn run_migration(&self, migration_id: &str) -> Result<(), InvokeError> {
        self.invoke(Call::Migration(migration_id.to_string())).await
    }

    async fn invoke(&self, call: Call) -> Result<(), InvokeError> {
        let export = match &call {
            Call::Enable => ENABLE_EXPORT.to_string(),
            Call::Disable => DISABLE_EXPORT.to_string(),
            Call::Migration(id) => format!("migration {id}"),
        };
        let inner = Arc::clone(&self.inner);
        let plugin_id = self.plugin_id.clone();
        let fuel = self.fuel;
        let deadline = self.call_timeout;

        let task = tokio::task::spawn_blocking(move || {
            let mut inner = inner.lock();
            inner.call(&plugin_id, &call, fuel, deadline)
        });

        match tokio::time::timeout(self.call_timeout, task).await {
            Err(_) => Err(InvokeError::Timeout {
                plugin: self.plugin_id.clone(),
                export,
                budget: format!("{:?} wall-clock", self.call_timeout),
            }),
            Ok(Err(join_error)) => Err(InvokeError::Trap {
                plugin: self.plugin_id.clone(),
                export,
                details: format!("panicked: {}", panic_message(join_error)),
            }),
            Ok(Ok(result)) => result,
        }
    }
}

impl HandleInner {
    fn call(
        &mut self,
        plugin_id: &str,
        call: &Call,
        fuel: u64,
        deadline: Duration,
    ) -> Result<(), InvokeError> {
        let (export, func) = match call {
            Call::Enable => (ENABLE_EXPORT.to_string(), self.enable.clone()),
            Call::Disable => (DISABLE_EXPORT.to_string(), self.disable.clone()),
            Call::Migration(id) => match self.migrations.get(id) {
                Some(func) => (format!("migration {id}"), Some(func.clone())),
                None => {
                    return Err(InvokeError::UnknownMigration {
                        plugin: plugin_id.to_string(),
                        migration: id.clone(),
                    });
                }
            },
        };

        // Missing lifecycle hooks are no-ops.
        let Some(func) = func else {
            return Ok(());
        };

        if let Err(e) = self.store.set_fuel(fuel) {
            return Err(InvokeError::Trap {
                plugin: plugin_id.to_string(),
                export,
                details: format!("failed to set fuel: {e:#}"),
            });
        }
        self.store.set_epoch_deadline(epoch_ticks(deadline));

        match func.call(&mut self.store, ()) {
            Ok(0) => Ok(()),
            Ok(code) => Err(InvokeError::Failed {
                plugin: plugin_id.to_string(),
                export,
                code,
            }),
            Err(e) if interrupted(&e) => Err(InvokeError::Timeout {
                plugin: plugin_id.to_string(),
                export,
                budget: format!("{deadline:?} wall-clock"),
            }),
            Err(e) if out_of_fuel(&self.store, &e) => Err(InvokeError::Timeout {
                plugin: plugin_id.to_string(),
                export,
                budget: format!("{fuel} fuel"),
            }),
            Err(e) => Err(InvokeError::Trap {
                plugin: plugin_id.to_string(),
                export,
                details: format!("{e:#}"),
            }),
        }
    }
}

#[async_trait]
impl MigrationExecutor for BackendHandle {
    async fn run_migration(&self, migration_id: &str) -> Result<(), InvokeError> {
        BackendHandle::run_migration(self, migration_id).await
    }
}
