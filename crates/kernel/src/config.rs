//! Configuration loaded from environment variables.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use semver::Version;

use crate::plugin::{ReconcilerConfig, RuntimeConfig};

/// Plugin contract version implemented by this host.
pub const DEFAULT_HOST_API_VERSION: &str = "1.0.0";

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server port (default: 3000).
    pub port: u16,

    /// PostgreSQL connection URL. When None, the registry lives in memory
    /// and is lost on exit.
    pub database_url: Option<String>,

    /// Maximum database connections in pool (default: 10).
    pub database_max_connections: u32,

    /// Path to plugins directory (default: ./plugins).
    pub plugins_dir: PathBuf,

    /// Host API version plugins are checked against (default: 1.0.0).
    pub host_api_version: Version,

    /// Wall-clock budget for loading one plugin (default: 10000ms).
    pub plugin_load_timeout: Duration,

    /// Wall-clock budget for one hook or migration call (default: 30000ms).
    pub plugin_call_timeout: Duration,

    /// Fuel per load and per call (default: 500000000).
    pub plugin_fuel: u64,

    /// Plugin loads allowed to run at once (default: 4).
    pub plugin_max_concurrent_loads: usize,

    /// Seconds after which another process's registry claim is stale (default: 300).
    pub plugin_claim_stale_after: Duration,

    /// Bearer token required by the admin API. When None, admin routes are
    /// not mounted.
    pub admin_api_token: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let port = var("PORT", "3000")
            .parse()
            .context("PORT must be a valid u16")?;

        let database_url = lookup("DATABASE_URL").filter(|url| !url.is_empty());

        let database_max_connections = var("DATABASE_MAX_CONNECTIONS", "10")
            .parse()
            .context("DATABASE_MAX_CONNECTIONS must be a valid u32")?;

        let plugins_dir = PathBuf::from(var("PLUGINS_DIR", "./plugins"));

        let host_api_version = var("HOST_API_VERSION", DEFAULT_HOST_API_VERSION)
            .parse()
            .context("HOST_API_VERSION must be a semantic version")?;

        let plugin_load_timeout = Duration::from_millis(
            var("PLUGIN_LOAD_TIMEOUT_MS", "10000")
                .parse()
                .context("PLUGIN_LOAD_TIMEOUT_MS must be a number of milliseconds")?,
        );

        let plugin_call_timeout = Duration::from_millis(
            var("PLUGIN_CALL_TIMEOUT_MS", "30000")
                .parse()
                .context("PLUGIN_CALL_TIMEOUT_MS must be a number of milliseconds")?,
        );

        let plugin_fuel = var("PLUGIN_FUEL", "500000000")
            .parse()
            .context("PLUGIN_FUEL must be a valid u64")?;

        let plugin_max_concurrent_loads: usize = var("PLUGIN_MAX_CONCURRENT_LOADS", "4")
            .parse()
            .context("PLUGIN_MAX_CONCURRENT_LOADS must be a positive integer")?;
        if plugin_max_concurrent_loads == 0 {
            anyhow::bail!("PLUGIN_MAX_CONCURRENT_LOADS must be at least 1");
        }

        let plugin_claim_stale_after = Duration::from_secs(
            var("PLUGIN_CLAIM_STALE_SECS", "300")
                .parse()
                .context("PLUGIN_CLAIM_STALE_SECS must be a number of seconds")?,
        );

        let admin_api_token = lookup("ADMIN_API_TOKEN").filter(|t| !t.is_empty());

        Ok(Self {
            port,
            database_url,
            database_max_connections,
            plugins_dir,
            host_api_version,
            plugin_load_timeout,
            plugin_call_timeout,
            plugin_fuel,
            plugin_max_concurrent_loads,
            plugin_claim_stale_after,
            admin_api_token,
        })
    }

    /// Backend loader settings.
    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            fuel: self.plugin_fuel,
            load_timeout: self.plugin_load_timeout,
            call_timeout: self.plugin_call_timeout,
            ..RuntimeConfig::default()
        }
    }

    /// Reconciler settings.
    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            max_concurrent_loads: self.plugin_max_concurrent_loads,
            claim_stale_after: self.plugin_claim_stale_after,
        }
    }
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_need_no_variables() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.port, 3000);
        assert!(config.database_url.is_none());
        assert_eq!(config.plugins_dir, PathBuf::from("./plugins"));
        assert_eq!(config.plugin_max_concurrent_loads, 4);
        assert_eq!(config.plugin_load_timeout, Duration::from_secs(10));
        assert!(config.admin_api_token.is_none());
    }

    #[test]
    fn plugin_settings_flow_into_runtime_config() {
        let config = config_from(&[
            ("HOST_API_VERSION", "1.4.0"),
            ("PLUGIN_FUEL", "1000"),
            ("PLUGIN_LOAD_TIMEOUT_MS", "250"),
            ("PLUGIN_MAX_CONCURRENT_LOADS", "2"),
        ])
        .unwrap();

        assert_eq!(config.host_api_version, Version::new(1, 4, 0));
        let runtime = config.runtime_config();
        assert_eq!(runtime.fuel, 1000);
        assert_eq!(runtime.load_timeout, Duration::from_millis(250));
        assert_eq!(config.reconciler_config().max_concurrent_loads, 2);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(config_from(&[("PORT", "not-a-port")]).is_err());
        assert!(config_from(&[("HOST_API_VERSION", "1.x")]).is_err());
        assert!(config_from(&[("PLUGIN_MAX_CONCURRENT_LOADS", "0")]).is_err());
    }

    #[test]
    fn empty_database_url_means_in_memory() {
        let config = config_from(&[("DATABASE_URL", "")]).unwrap();
        assert!(config.database_url.is_none());
    }
}
