//! Read-only discovery of plugin packages on disk.
//!
//! Walks the immediate subdirectories of the plugins root in file-name
//! order, reads each `plugin.info.toml`, and validates it. Nothing here
//! writes to the registry or executes plugin code, so it is safe to call
//! speculatively (admin listing, CLI) at any time.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::error::PluginError;
use super::manifest::{MANIFEST_FILE, ManifestDocumentError, PluginManifest};

/// A plugin directory paired with its validated manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPlugin {
    pub dir: PathBuf,
    pub manifest: PluginManifest,
}

impl DiscoveredPlugin {
    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    /// Absolute location of the entrypoint module.
    pub fn entrypoint_path(&self) -> PathBuf {
        self.dir.join(&self.manifest.entrypoint)
    }
}

/// A directory whose manifest is missing or could not be used.
#[derive(Debug)]
pub struct DiscoveryIssue {
    pub dir: PathBuf,
    pub error: PluginError,
}

/// Result of one discovery pass.
#[derive(Debug, Default)]
pub struct Discovery {
    /// Valid plugins in directory-name order. May contain duplicate ids;
    /// the reconciler decides which directory wins.
    pub plugins: Vec<DiscoveredPlugin>,
    /// Directories with an unreadable, malformed or invalid manifest.
    pub issues: Vec<DiscoveryIssue>,
    /// Directories without a manifest at all, each as `ManifestMissing`.
    pub skipped: Vec<DiscoveryIssue>,
}

/// Discover plugins under `root`.
///
/// A missing root yields an empty result rather than an error; a fresh
/// install has no plugins directory.
pub fn discover(root: &Path) -> Discovery {
    let mut discovery = Discovery::default();

    if !root.exists() {
        info!(?root, "plugins directory does not exist, nothing to discover");
        return discovery;
    }

    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(root = %root.display(), error = %e, "failed to read plugins directory");
            return discovery;
        }
    };

    let mut dirs: Vec<_> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .collect();

    // Sort for deterministic discovery order
    dirs.sort_by_key(|e| e.file_name());

    for entry in dirs {
        let dir = entry.path();
        match read_manifest(&dir) {
            Ok(Some(manifest)) => {
                debug!(plugin = %manifest.id, version = %manifest.version, dir = %dir.display(), "discovered plugin");
                discovery.plugins.push(DiscoveredPlugin { dir, manifest });
            }
            Ok(None) => {
                debug!(dir = %dir.display(), "no {MANIFEST_FILE} found, skipping");
                let error = PluginError::ManifestMissing {
                    path: dir.display().to_string(),
                };
                discovery.skipped.push(DiscoveryIssue { dir, error });
            }
            Err(error) => {
                warn!(dir = %dir.display(), error = %error, "skipping plugin with unusable manifest");
                discovery.issues.push(DiscoveryIssue { dir, error });
            }
        }
    }

    discovery
}

/// Read and validate the manifest in one plugin directory.
///
/// Returns `Ok(None)` when the directory has no manifest.
pub fn read_manifest(dir: &Path) -> Result<Option<PluginManifest>, PluginError> {
    let path = dir.join(MANIFEST_FILE);
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(PluginError::ManifestParse {
                path: dir.display().to_string(),
                details: format!("failed to read {}: {e}", path.display()),
            });
        }
    };

    match PluginManifest::parse_str(&content) {
        Ok(manifest) => Ok(Some(manifest)),
        Err(ManifestDocumentError::Parse(e)) => Err(PluginError::ManifestParse {
            path: dir.display().to_string(),
            details: e.to_string(),
        }),
        Err(ManifestDocumentError::Invalid(source)) => Err(PluginError::ManifestValidation {
            path: dir.display().to_string(),
            source,
        }),
    }
}
