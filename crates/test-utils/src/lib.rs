//! Hostdesk test utilities.
//!
//! Helpers for integration testing: throwaway plugin trees on disk with
//! generated manifests and WebAssembly text modules, so the kernel's real
//! discovery, loader and reconciler run against them.

// Test fixtures fail loudly; there is no caller to propagate to.
#![allow(clippy::expect_used)]

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// A temporary plugins root directory, removed on drop.
pub struct PluginTree {
    root: TempDir,
}

impl Default for PluginTree {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginTree {
    /// Create an empty plugins root.
    pub fn new() -> Self {
        Self {
            root: TempDir::new().expect("failed to create temporary plugins root"),
        }
    }

    /// Path of the plugins root.
    pub fn path(&self) -> &Path {
        self.root.path()
    }

    /// Start building a plugin in the subdirectory `dir`.
    ///
    /// The plugin id defaults to the directory name.
    pub fn plugin(&self, dir: &str) -> PluginFixture<'_> {
        PluginFixture {
            tree: self,
            dir: dir.to_string(),
            id: dir.to_string(),
            name: None,
            version: "1.0.0".to_string(),
            entrypoint: "plugin.wat".to_string(),
            capabilities: Vec::new(),
            host_api: None,
            migrations: Vec::new(),
            failing: Vec::new(),
            module: None,
            write_module: true,
        }
    }

    /// Write a manifest with arbitrary contents into `dir`.
    pub fn raw_manifest(&self, dir: &str, contents: &str) -> PathBuf {
        let path = self.path().join(dir);
        fs::create_dir_all(&path).expect("failed to create plugin dir");
        fs::write(path.join("plugin.info.toml"), contents).expect("failed to write manifest");
        path
    }

    /// Create an empty subdirectory (a stray directory without a manifest).
    pub fn empty_dir(&self, dir: &str) -> PathBuf {
        let path = self.path().join(dir);
        fs::create_dir_all(&path).expect("failed to create directory");
        path
    }

    /// Create a plain file directly under the root.
    pub fn file(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.path().join(name);
        fs::write(&path, contents).expect("failed to write file");
        path
    }

    /// Replace the entrypoint module of an existing plugin directory.
    pub fn replace_module(&self, dir: &str, module: &str) {
        fs::write(self.path().join(dir).join("plugin.wat"), module)
            .expect("failed to replace module");
    }

    /// Delete a plugin directory.
    pub fn remove(&self, dir: &str) {
        fs::remove_dir_all(self.path().join(dir)).expect("failed to remove plugin dir");
    }
}

/// Builder for one plugin directory.
pub struct PluginFixture<'a> {
    tree: &'a PluginTree,
    dir: String,
    id: String,
    name: Option<String>,
    version: String,
    entrypoint: String,
    capabilities: Vec<String>,
    host_api: Option<String>,
    migrations: Vec<String>,
    failing: Vec<String>,
    module: Option<String>,
    write_module: bool,
}

impl PluginFixture<'_> {
    /// Override the plugin id (defaults to the directory name).
    pub fn id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    /// Point the manifest at a different entrypoint path.
    pub fn entrypoint(mut self, entrypoint: &str) -> Self {
        self.entrypoint = entrypoint.to_string();
        self
    }

    pub fn capabilities(mut self, capabilities: &[&str]) -> Self {
        self.capabilities = capabilities.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn host_api(mut self, requirement: &str) -> Self {
        self.host_api = Some(requirement.to_string());
        self
    }

    /// Declare migrations; the generated module implements each one.
    pub fn migrations(mut self, ids: &[&str]) -> Self {
        self.migrations = ids.iter().map(|m| m.to_string()).collect();
        self
    }

    /// Make the generated module fail these migrations.
    pub fn failing_migrations(mut self, ids: &[&str]) -> Self {
        self.failing = ids.iter().map(|m| m.to_string()).collect();
        self
    }

    /// Use a hand-written module instead of the generated one.
    pub fn module(mut self, wat: &str) -> Self {
        self.module = Some(wat.to_string());
        self
    }

    /// Do not write any module file (entrypoint missing).
    pub fn without_module(mut self) -> Self {
        self.write_module = false;
        self
    }

    /// Write the manifest (and module) to disk, returning the plugin dir.
    pub fn write(self) -> PathBuf {
        let dir = self.tree.path().join(&self.dir);
        fs::create_dir_all(&dir).expect("failed to create plugin dir");

        fs::write(dir.join("plugin.info.toml"), self.manifest())
            .expect("failed to write manifest");

        if self.write_module {
            let migrations: Vec<&str> = self.migrations.iter().map(String::as_str).collect();
            let failing: Vec<&str> = self.failing.iter().map(String::as_str).collect();
            let module = self
                .module
                .clone()
                .unwrap_or_else(|| wat::lifecycle_module(&migrations, &failing));
            let path = dir.join(&self.entrypoint);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).expect("failed to create module dir");
            }
            fs::write(path, module).expect("failed to write module");
        }

        dir
    }

    fn manifest(&self) -> String {
        let name = self.name.clone().unwrap_or_else(|| self.id.clone());
        let mut out = format!(
            "id = {:?}\nname = {:?}\nversion = {:?}\nentrypoint = {:?}\n",
            self.id, name, self.version, self.entrypoint
        );
        if let Some(req) = &self.host_api {
            out.push_str(&format!("host_api = {req:?}\n"));
        }
        if !self.capabilities.is_empty() {
            let list: Vec<String> = self.capabilities.iter().map(|c| format!("{c:?}")).collect();
            out.push_str(&format!("capabilities = [{}]\n", list.join(", ")));
        }
        for migration in &self.migrations {
            out.push_str(&format!("\n[[migrations]]\nid = {migration:?}\n"));
        }
        out
    }
}

/// WebAssembly text modules used as plugin entrypoints.
pub mod wat {
    /// A well-behaved plugin: `tap-enable` and `tap-disable` succeed, and one
    /// `migrate-{id}` export per migration returns 0, or 1 for the ids in
    /// `failing`. Every migration also fails if it runs twice on the same
    /// instance.
    pub fn lifecycle_module(migrations: &[&str], failing: &[&str]) -> String {
        let mut out = String::from("(module\n");
        out.push_str("  (func (export \"tap-enable\") (result i32) i32.const 0)\n");
        out.push_str("  (func (export \"tap-disable\") (result i32) i32.const 0)\n");
        for (index, id) in migrations.iter().enumerate() {
            let code = if failing.contains(id) { 1 } else { 0 };
            out.push_str(&format!(
                "  (global $ran{index} (mut i32) (i32.const 0))\n  \
                 (func (export \"migrate-{id}\") (result i32)\n    \
                 (if (global.get $ran{index}) (then (return (i32.const 99))))\n    \
                 (global.set $ran{index} (i32.const 1))\n    \
                 i32.const {code})\n"
            ));
        }
        out.push_str(")\n");
        out
    }

    /// Traps while the module initializes.
    pub const TRAP_ON_START: &str = r#"(module
  (func $init unreachable)
  (start $init))
"#;

    /// Never finishes initializing; only a fuel or wall-clock budget stops it.
    pub const SPIN_ON_START: &str = r#"(module
  (func $init (loop $forever (br $forever)))
  (start $init))
"#;

    /// Enables fine, but migration `m1` never returns.
    pub const SPIN_IN_MIGRATION: &str = r#"(module
  (func (export "tap-enable") (result i32) i32.const 0)
  (func (export "migrate-m1") (result i32)
    (loop $forever (br $forever))
    i32.const 0))
"#;

    /// Enables fine but reports failure from its disable hook.
    pub const FAILING_DISABLE: &str = r#"(module
  (func (export "tap-enable") (result i32) i32.const 0)
  (func (export "tap-disable") (result i32) i32.const 3))
"#;

    /// Fails its enable hook.
    pub const FAILING_ENABLE: &str = r#"(module
  (func (export "tap-enable") (result i32) i32.const 7))
"#;

    /// Not a module at all.
    pub const GARBAGE: &str = "(module (func $broken (result i32) i32.const))";

    /// Imports the config host functions; `tap-enable` succeeds only when
    /// the plugin's configuration payload is exactly `expected_len` bytes.
    pub fn config_check(expected_len: usize) -> String {
        format!(
            r#"(module
  (import "hostdesk:kernel/config" "config-len" (func $config_len (result i32)))
  (func (export "tap-enable") (result i32)
    (i32.ne (call $config_len) (i32.const {expected_len}))))
"#
        )
    }

    /// Imports the logging host function and logs from `_initialize`.
    pub const LOGS_ON_INIT: &str = r#"(module
  (import "hostdesk:kernel/logging" "log" (func $log (param i32 i32 i32 i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "info")
  (data (i32.const 16) "warming caches")
  (func (export "_initialize")
    (call $log (i32.const 0) (i32.const 4) (i32.const 16) (i32.const 14))))
"#;
}
