//! Settings types. Every struct uses `#[serde(rename_all = "camelCase",
//! default)]` so a partial JSON file deep-merges cleanly over defaults.

mod index;
mod providers;

pub use index::{ChunkStrategy, IndexConfig};
pub use providers::{ModelEndpoint, ProviderSettings};

use serde::{Deserialize, Serialize};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ArborSettings {
    pub index: IndexConfig,
    pub providers: ProviderSettings,
    pub storage: StorageSettings,
    pub telemetry: TelemetrySettings,
}

/// Where the tree store lives.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    /// Database path. Relative paths resolve against `~/.arbor`.
    pub db_path: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            db_path: "index.db".to_string(),
        }
    }
}

/// Logging settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TelemetrySettings {
    pub log_level: String,
    /// Persist warn+ log records into SQLite.
    pub log_to_sqlite: bool,
    /// Log database path. Relative paths resolve against `~/.arbor`.
    pub log_db_path: String,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_to_sqlite: false,
            log_db_path: "logs.db".to_string(),
        }
    }
}
