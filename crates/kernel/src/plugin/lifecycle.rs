//! Plugin lifecycle states and the status view reported to operators.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Where a plugin is in its lifecycle.
///
/// `Enabling`, `Loaded` and `MigrationPending` are transient: they exist only
/// in memory while an enable is in flight and are never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Seen on disk, no registry record yet.
    Discovered,
    /// Registered, enabled=false.
    Disabled,
    Enabling,
    Loaded,
    MigrationPending,
    /// Running; the steady state of an enabled plugin.
    Enabled,
    /// Nominally enabled, but a migration or hook failed.
    Degraded,
    /// Registered, but its directory is gone.
    Orphaned,
    /// Enable was requested and the backend could not load.
    LoadFailed,
}

impl LifecycleState {
    pub const ALL: [LifecycleState; 9] = [
        Self::Discovered,
        Self::Disabled,
        Self::Enabling,
        Self::Loaded,
        Self::MigrationPending,
        Self::Enabled,
        Self::Degraded,
        Self::Orphaned,
        Self::LoadFailed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Disabled => "disabled",
            Self::Enabling => "enabling",
            Self::Loaded => "loaded",
            Self::MigrationPending => "migration_pending",
            Self::Enabled => "enabled",
            Self::Degraded => "degraded",
            Self::Orphaned => "orphaned",
            Self::LoadFailed => "load_failed",
        }
    }

    /// Whether this state only exists while an enable is in flight.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Enabling | Self::Loaded | Self::MigrationPending)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown plugin lifecycle state '{s}'"))
    }
}

/// Status of one plugin as seen by operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginStatus {
    pub id: String,
    pub name: String,
    pub state: LifecycleState,
    pub enabled: bool,
    pub installed_version: String,
    /// Version on disk when it differs from the installed one.
    pub available_version: Option<String>,
    pub last_error: Option<String>,
    /// Whether a backend handle is currently held.
    pub loaded: bool,
}

impl PluginStatus {
    pub fn upgrade_pending(&self) -> bool {
        self.available_version.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_round_trip_through_strings() {
        for state in LifecycleState::ALL {
            assert_eq!(state.as_str().parse::<LifecycleState>(), Ok(state));
        }
        assert!("running".parse::<LifecycleState>().is_err());
    }

    #[test]
    fn serde_matches_storage_names() {
        let json = serde_json::to_string(&LifecycleState::LoadFailed).unwrap_or_default();
        assert_eq!(json, "\"load_failed\"");
    }

    #[test]
    fn only_in_flight_states_are_transient() {
        let transient: Vec<_> = LifecycleState::ALL
            .into_iter()
            .filter(|s| s.is_transient())
            .collect();
        assert_eq!(
            transient,
            vec![
                LifecycleState::Enabling,
                LifecycleState::Loaded,
                LifecycleState::MigrationPending
            ]
        );
    }
}
