//! Parser and validator for plugin `plugin.info.toml` manifests.
//!
//! Each plugin directory carries one manifest declaring:
//! - id, name, version, optional description
//! - entrypoint (WebAssembly module, relative to the plugin directory)
//! - capabilities (which host surfaces the plugin may use)
//! - migrations (ordered, each resolved to a module export at load)
//!
//! Validation is a pure function over the parsed document and reports every
//! violated field at once.

use std::collections::{BTreeSet, HashSet};
use std::path::{Component, Path, PathBuf};

use semver::{Version, VersionReq};
use serde::Serialize;
use toml::{Table, Value};

use super::error::{FieldViolation, ManifestValidationError};

/// Manifest file name, relative to the plugin directory.
pub const MANIFEST_FILE: &str = "plugin.info.toml";

/// Longest identifier accepted for plugins and migrations (database key width).
pub const MAX_ID_LEN: usize = 64;

/// Capability tokens a plugin may declare.
pub const KNOWN_CAPABILITIES: &[&str] = &[
    // Host imports
    "log",
    "config",
    // Host surfaces consumed through the handle
    "routes",
    "admin-pages",
    "cron",
    "http-client",
    "billing-events",
];

/// A validated plugin manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginManifest {
    /// Globally unique, stable identifier.
    pub id: String,
    pub name: String,
    pub version: Version,
    /// Entrypoint module path, relative to the plugin directory.
    pub entrypoint: PathBuf,
    pub description: Option<String>,
    /// Host API versions this plugin can run against.
    pub host_api: Option<VersionReq>,
    pub capabilities: BTreeSet<String>,
    /// Migrations in the order they must run.
    pub migrations: Vec<MigrationDecl>,
}

/// One declared migration and the export implementing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationDecl {
    pub id: String,
    pub export: String,
}

impl MigrationDecl {
    /// A migration implemented by its default export.
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            export: Self::default_export(id),
        }
    }

    /// Export name used when a migration does not name one.
    pub fn default_export(id: &str) -> String {
        format!("migrate-{id}")
    }
}

impl PluginManifest {
    /// Parse and validate a manifest from TOML text.
    pub fn parse_str(content: &str) -> Result<Self, ManifestDocumentError> {
        let raw: Table = toml::from_str(content).map_err(ManifestDocumentError::Parse)?;
        validate(&raw).map_err(ManifestDocumentError::Invalid)
    }

    /// Whether the manifest declares a capability.
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    /// Serialize back into manifest TOML.
    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        let doc = ManifestDocument {
            id: &self.id,
            name: &self.name,
            version: self.version.to_string(),
            entrypoint: self.entrypoint.to_string_lossy().replace('\\', "/"),
            description: self.description.as_deref(),
            host_api: self.host_api.as_ref().map(ToString::to_string),
            capabilities: self.capabilities.iter().map(String::as_str).collect(),
            migrations: self
                .migrations
                .iter()
                .map(|m| MigrationDocument {
                    id: &m.id,
                    export: &m.export,
                })
                .collect(),
        };
        toml::to_string(&doc)
    }
}

/// Why a manifest document could not become a [`PluginManifest`].
#[derive(Debug)]
pub enum ManifestDocumentError {
    /// Not well-formed TOML.
    Parse(toml::de::Error),
    /// Well-formed, but contract-violating.
    Invalid(ManifestValidationError),
}

#[derive(Serialize)]
struct ManifestDocument<'a> {
    id: &'a str,
    name: &'a str,
    version: String,
    entrypoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    host_api: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    capabilities: Vec<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    migrations: Vec<MigrationDocument<'a>>,
}

#[derive(Serialize)]
struct MigrationDocument<'a> {
    id: &'a str,
    export: &'a str,
}

/// Validate a raw manifest document.
///
/// Unknown top-level keys are ignored so newer manifests still load on
/// older hosts; everything the contract names is checked.
pub fn validate(raw: &Table) -> Result<PluginManifest, ManifestValidationError> {
    let mut violations = Vec::new();

    let id = required_str(raw, "id", &mut violations).and_then(|id| {
        match check_identifier(id) {
            Ok(()) => Some(id.to_string()),
            Err(message) => {
                violations.push(FieldViolation::new("id", message));
                None
            }
        }
    });

    let name = required_str(raw, "name", &mut violations).map(str::to_string);

    let version = required_str(raw, "version", &mut violations).and_then(|v| {
        match Version::parse(v) {
            Ok(version) => Some(version),
            Err(e) => {
                violations.push(FieldViolation::new(
                    "version",
                    format!("must be a semantic version: {e}"),
                ));
                None
            }
        }
    });

    let entrypoint = required_str(raw, "entrypoint", &mut violations).and_then(|e| {
        match check_entrypoint(e) {
            Ok(path) => Some(path),
            Err(message) => {
                violations.push(FieldViolation::new("entrypoint", message));
                None
            }
        }
    });

    let description = optional_str(raw, "description", &mut violations);

    let host_api = optional_str(raw, "host_api", &mut violations).and_then(|req| {
        match VersionReq::parse(&req) {
            Ok(req) => Some(req),
            Err(e) => {
                violations.push(FieldViolation::new(
                    "host_api",
                    format!("must be a semantic version requirement: {e}"),
                ));
                None
            }
        }
    });

    let capabilities = parse_capabilities(raw, &mut violations);
    let migrations = parse_migrations(raw, &mut violations);

    match (id, name, version, entrypoint) {
        (Some(id), Some(name), Some(version), Some(entrypoint)) if violations.is_empty() => {
            Ok(PluginManifest {
                id,
                name,
                version,
                entrypoint,
                description,
                host_api,
                capabilities,
                migrations,
            })
        }
        _ => Err(ManifestValidationError { violations }),
    }
}

fn required_str<'a>(
    raw: &'a Table,
    field: &str,
    violations: &mut Vec<FieldViolation>,
) -> Option<&'a str> {
    match raw.get(field) {
        None => {
            violations.push(FieldViolation::new(field, "is required"));
            None
        }
        Some(Value::String(s)) if s.trim().is_empty() => {
            violations.push(FieldViolation::new(field, "must not be empty"));
            None
        }
        Some(Value::String(s)) => Some(s),
        Some(other) => {
            violations.push(FieldViolation::new(
                field,
                format!("must be a string, found {}", other.type_str()),
            ));
            None
        }
    }
}

fn optional_str(raw: &Table, field: &str, violations: &mut Vec<FieldViolation>) -> Option<String> {
    match raw.get(field) {
        None => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => {
            violations.push(FieldViolation::new(
                field,
                format!("must be a string, found {}", other.type_str()),
            ));
            None
        }
    }
}

/// Identifiers double as database keys and directory-safe names.
fn check_identifier(id: &str) -> Result<(), String> {
    if id.len() > MAX_ID_LEN {
        return Err(format!("must be at most {MAX_ID_LEN} characters"));
    }
    if let Some(bad) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(format!(
            "may only contain letters, digits, '-' and '_' (found {bad:?})"
        ));
    }
    Ok(())
}

fn check_entrypoint(entrypoint: &str) -> Result<PathBuf, String> {
    if entrypoint.contains('\\') {
        return Err("must use '/' as the path separator".to_string());
    }
    let path = Path::new(entrypoint);
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => {
                return Err("must not escape the plugin directory ('..')".to_string());
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err("must be relative to the plugin directory".to_string());
            }
        }
    }
    if path.file_name().is_none() {
        return Err("must name a file".to_string());
    }
    Ok(path.to_path_buf())
}

fn parse_capabilities(raw: &Table, violations: &mut Vec<FieldViolation>) -> BTreeSet<String> {
    let mut capabilities = BTreeSet::new();
    let Some(value) = raw.get("capabilities") else {
        return capabilities;
    };
    let Value::Array(items) = value else {
        violations.push(FieldViolation::new(
            "capabilities",
            format!("must be an array of strings, found {}", value.type_str()),
        ));
        return capabilities;
    };

    for (index, item) in items.iter().enumerate() {
        let field = format!("capabilities[{index}]");
        match item {
            Value::String(token) if !KNOWN_CAPABILITIES.contains(&token.as_str()) => {
                violations.push(FieldViolation::new(
                    field,
                    format!(
                        "unknown capability '{token}'. Known capabilities: {}",
                        KNOWN_CAPABILITIES.join(", ")
                    ),
                ));
            }
            Value::String(token) => {
                if !capabilities.insert(token.clone()) {
                    violations.push(FieldViolation::new(
                        field,
                        format!("duplicate capability '{token}'"),
                    ));
                }
            }
            other => violations.push(FieldViolation::new(
                field,
                format!("must be a string, found {}", other.type_str()),
            )),
        }
    }

    capabilities
}

fn parse_migrations(raw: &Table, violations: &mut Vec<FieldViolation>) -> Vec<MigrationDecl> {
    let mut migrations = Vec::new();
    let Some(value) = raw.get("migrations") else {
        return migrations;
    };
    let Value::Array(items) = value else {
        violations.push(FieldViolation::new(
            "migrations",
            format!("must be an array of tables, found {}", value.type_str()),
        ));
        return migrations;
    };

    let mut seen = HashSet::new();
    for (index, item) in items.iter().enumerate() {
        let Value::Table(entry) = item else {
            violations.push(FieldViolation::new(
                format!("migrations[{index}]"),
                format!("must be a table, found {}", item.type_str()),
            ));
            continue;
        };

        let id_field = format!("migrations[{index}].id");
        let id = match entry.get("id") {
            None => {
                violations.push(FieldViolation::new(&id_field, "is required"));
                None
            }
            Some(Value::String(id)) if id.is_empty() => {
                violations.push(FieldViolation::new(&id_field, "must not be empty"));
                None
            }
            Some(Value::String(id)) => match check_identifier(id) {
                Err(message) => {
                    violations.push(FieldViolation::new(&id_field, message));
                    None
                }
                Ok(()) if !seen.insert(id.clone()) => {
                    violations.push(FieldViolation::new(
                        &id_field,
                        format!("duplicate migration id '{id}'"),
                    ));
                    None
                }
                Ok(()) => Some(id.clone()),
            },
            Some(other) => {
                violations.push(FieldViolation::new(
                    &id_field,
                    format!("must be a string, found {}", other.type_str()),
                ));
                None
            }
        };

        let export_field = format!("migrations[{index}].export");
        let export = match entry.get("export") {
            None => None,
            Some(Value::String(export)) if export.trim().is_empty() => {
                violations.push(FieldViolation::new(&export_field, "must not be empty"));
                continue;
            }
            Some(Value::String(export)) => Some(export.clone()),
            Some(other) => {
                violations.push(FieldViolation::new(
                    &export_field,
                    format!("must be a string, found {}", other.type_str()),
                ));
                continue;
            }
        };

        if let Some(id) = id {
            let export = export.unwrap_or_else(|| MigrationDecl::default_export(&id));
            migrations.push(MigrationDecl { id, export });
        }
    }

    migrations
}
