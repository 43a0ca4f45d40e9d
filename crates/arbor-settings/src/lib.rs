//! # arbor-settings
//!
//! Configuration for the arbor tree index, loaded from three layers (in
//! priority order):
//! 1. **Compiled defaults**: [`ArborSettings::default()`]
//! 2. **User file**: `~/.arbor/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `ARBOR_*` overrides (highest priority)

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    arbor_home, deep_merge, load_settings, load_settings_from_path, resolve_path, settings_path,
};
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_are_valid() {
        let settings = ArborSettings::default();
        settings.index.validate().unwrap();
        assert_eq!(settings.index.group_size, 5);
        assert_eq!(settings.telemetry.log_level, "info");
        assert!(!settings.telemetry.log_to_sqlite);
    }

    #[test]
    fn settings_serialize_camel_case() {
        let json = serde_json::to_value(ArborSettings::default()).unwrap();
        assert!(json["index"].get("targetChunkTokens").is_some());
        assert!(json["storage"].get("dbPath").is_some());
    }
}
