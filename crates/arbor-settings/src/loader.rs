//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ArborSettings::default()`]
//! 2. If `~/.arbor/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `ARBOR_*` environment variable overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::ArborSettings;

/// Root directory for arbor state (`~/.arbor`).
pub fn arbor_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".arbor")
}

/// Resolve the path to the settings file (`~/.arbor/settings.json`).
pub fn settings_path() -> PathBuf {
    arbor_home().join("settings.json")
}

/// Resolve a configured path: absolute paths pass through, relative ones
/// land under `~/.arbor`.
pub fn resolve_path(configured: &str) -> PathBuf {
    let p = PathBuf::from(configured);
    if p.is_absolute() {
        p
    } else {
        arbor_home().join(p)
    }
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<ArborSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON, or the merged index configuration is structurally
/// invalid, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<ArborSettings> {
    let mut settings = load_without_env(path)?;
    apply_env_overrides(&mut settings);
    settings.index.validate()?;
    Ok(settings)
}

fn load_without_env(path: &Path) -> Result<ArborSettings> {
    let defaults = serde_json::to_value(ArborSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are ignored with a warning (fall back to file/default).
pub fn apply_env_overrides(settings: &mut ArborSettings) {
    // ── Index settings ──────────────────────────────────────────────
    if let Some(v) = read_env_u64("ARBOR_TARGET_CHUNK_TOKENS", 1, 10_000_000) {
        settings.index.target_chunk_tokens = v;
    }
    if let Some(v) = read_env_u64("ARBOR_MAX_WINDOW_TOKENS", 1, 100_000_000) {
        settings.index.max_window_tokens = v;
    }
    if let Some(v) = read_env_usize("ARBOR_GROUP_SIZE", 2, 1_000) {
        settings.index.group_size = v;
    }
    if let Some(v) = read_env_usize("ARBOR_SUMMARY_CONCURRENCY", 1, 256) {
        settings.index.summary_concurrency = v;
    }
    if let Some(v) = read_env_string("ARBOR_STRATEGY") {
        match serde_json::from_value(Value::String(v.clone())) {
            Ok(strategy) => settings.index.strategy = strategy,
            Err(_) => tracing::warn!(key = "ARBOR_STRATEGY", value = %v, "invalid strategy env var, ignoring"),
        }
    }

    // ── Provider settings ───────────────────────────────────────────
    if let Some(v) = read_env_string("ARBOR_BASE_URL") {
        settings.providers.fast.base_url = v.clone();
        settings.providers.accurate.base_url = v;
    }
    if let Some(v) = read_env_string("ARBOR_FAST_MODEL") {
        settings.providers.fast.model = v;
    }
    if let Some(v) = read_env_string("ARBOR_ACCURATE_MODEL") {
        settings.providers.accurate.model = v;
    }

    // ── Storage / telemetry ─────────────────────────────────────────
    if let Some(v) = read_env_string("ARBOR_DB_PATH") {
        settings.storage.db_path = v;
    }
    if let Some(v) = read_env_string("ARBOR_LOG_LEVEL") {
        settings.telemetry.log_level = v;
    }
    if let Some(v) = read_env_bool("ARBOR_LOG_TO_SQLITE") {
        settings.telemetry.log_to_sqlite = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    let val = std::env::var(name).ok()?;
    let result = parse_usize_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
    }
    result
}
