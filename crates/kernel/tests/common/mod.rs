#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Common test utilities for integration tests.
//!
//! Every test gets its own plugins tree, in-memory registry and reconciler,
//! wired together exactly as the server wires them.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, header};
use axum::response::Response;
use http_body_util::BodyExt;
use semver::Version;
use tower::ServiceExt;

use hostdesk_kernel::plugin::{
    HostApiVersion, MemoryRegistryStore, PluginReconciler, PluginRuntime, ReconcilerConfig,
    RegistryStore, RuntimeConfig,
};
use hostdesk_kernel::routes;
use hostdesk_kernel::state::AppState;
use hostdesk_test_utils::PluginTree;

/// Host API version the test runtime implements.
pub const HOST_API: Version = Version::new(1, 4, 0);

/// Admin token used by router tests.
pub const ADMIN_TOKEN: &str = "test-admin-token";

/// A plugins tree plus the registry and reconciler operating on it.
pub struct Harness {
    pub tree: PluginTree,
    pub store: Arc<MemoryRegistryStore>,
    pub reconciler: Arc<PluginReconciler>,
    runtime_config: RuntimeConfig,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_tree(PluginTree::new())
    }

    pub fn with_tree(tree: PluginTree) -> Self {
        Self::build(tree, test_runtime_config())
    }

    /// A harness whose runtime uses `config` instead of the test defaults.
    pub fn with_runtime_config(config: RuntimeConfig) -> Self {
        Self::build(PluginTree::new(), config)
    }

    fn build(tree: PluginTree, runtime_config: RuntimeConfig) -> Self {
        let store = Arc::new(MemoryRegistryStore::new());
        let reconciler = reconciler_for(store.clone(), runtime_config.clone());
        Self {
            tree,
            store,
            reconciler,
            runtime_config,
        }
    }

    /// A second reconciler over the same registry, as after a restart or
    /// from another host process.
    pub fn restart(&self) -> Arc<PluginReconciler> {
        reconciler_for(self.store.clone(), self.runtime_config.clone())
    }

    pub async fn reconcile(&self) -> hostdesk_kernel::plugin::ReconcileReport {
        self.reconciler.reconcile(self.tree.path()).await.unwrap()
    }

    /// Migration ids recorded for a plugin, in application order.
    pub async fn ledger(&self, plugin: &str) -> Vec<String> {
        self.reconciler
            .applied_migrations(plugin)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.migration_id)
            .collect()
    }

    /// Router over this harness with the admin API enabled.
    pub fn router(&self) -> Router {
        let state = AppState::from_parts(
            Arc::clone(&self.reconciler),
            self.tree.path().to_path_buf(),
            None,
            Some(ADMIN_TOKEN.to_string()),
        );
        routes::build_router(state)
    }
}

pub fn test_runtime_config() -> RuntimeConfig {
    RuntimeConfig {
        fuel: 5_000_000,
        load_timeout: Duration::from_secs(10),
        call_timeout: Duration::from_secs(10),
        ..RuntimeConfig::default()
    }
}

/// A reconciler over any registry store, wired like the server's.
pub fn reconciler_for(
    store: Arc<dyn RegistryStore>,
    runtime_config: RuntimeConfig,
) -> Arc<PluginReconciler> {
    let runtime = PluginRuntime::new(runtime_config, Arc::new(HostApiVersion(HOST_API)))
        .expect("failed to create plugin runtime");
    Arc::new(PluginReconciler::new(
        store,
        Arc::new(runtime),
        ReconcilerConfig {
            max_concurrent_loads: 2,
            claim_stale_after: Duration::from_secs(300),
        },
    ))
}

/// Send a request to the router, optionally with the admin token.
pub async fn send(
    router: &Router,
    method: &str,
    uri: &str,
    body: Option<serde_json::Value>,
    authorized: bool,
) -> Response {
    let mut builder = Request::builder().method(method).uri(uri);
    if authorized {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {ADMIN_TOKEN}"));
    }
    let request = match body {
        Some(json) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    router.clone().oneshot(request).await.unwrap()
}

/// Read a response body as JSON.
pub async fn json_body(response: Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
