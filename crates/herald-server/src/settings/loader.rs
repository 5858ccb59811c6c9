//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`HeraldSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply environment variable overrides (highest priority)
//! 4. Validate
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use super::HeraldSettings;
use super::errors::{Result, SettingsError};

/// Resolve the default settings path (`~/.herald/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".herald").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<HeraldSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON, or the result fails validation, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<HeraldSettings> {
    let mut settings = load_file(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

fn load_file(path: &Path) -> Result<HeraldSettings> {
    if !path.exists() {
        debug!(?path, "settings file not found, using defaults");
        return Ok(HeraldSettings::default());
    }

    debug!(?path, "loading settings from file");
    let content = std::fs::read_to_string(path).map_err(|e| SettingsError::file(path, e))?;
    let user: Value = serde_json::from_str(&content).map_err(|e| SettingsError::file(path, e))?;
    let defaults = serde_json::to_value(HeraldSettings::default())
        .map_err(|e| SettingsError::Invalid(e.to_string()))?;
    serde_json::from_value(deep_merge(defaults, user)).map_err(|e| SettingsError::file(path, e))
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
/// Each env var has strict parsing rules:
/// - Integers must be valid and within the specified range
/// - Booleans accept: `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`
/// - Invalid values are ignored with a warning (fall back to file/default)
pub fn apply_env_overrides(settings: &mut HeraldSettings) {
    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = read_env_string("HERALD_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read_env_u16("HERALD_PORT", 0, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = read_env_usize("HERALD_MAX_CONNECTIONS", 1, 1_000_000) {
        settings.server.max_connections = v;
    }

    // ── Broker ──────────────────────────────────────────────────────
    if let Some(v) = read_env_u64("HERALD_HEARTBEAT_INTERVAL_MS", 100, 3_600_000) {
        settings.broker.heartbeat_interval_ms = v;
    }
    if let Some(v) = read_env_usize("HERALD_MAX_HISTORY", 1, 1_000_000) {
        settings.broker.max_history_per_channel = v;
    }
    if let Some(v) = read_env_u64("HERALD_RETENTION_WINDOW_MS", 1000, 30 * 86_400_000) {
        settings.broker.retention_window_ms = v;
    }
    if let Some(v) = read_env_usize("HERALD_MAX_PAYLOAD_BYTES", 64, 64 * 1024 * 1024) {
        settings.broker.max_payload_bytes = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = read_env_string("HERALD_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_env_bool("HERALD_LOG_JSON") {
        settings.logging.json = v;
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

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
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

fn read_env_u16(name: &str, min: u16, max: u16) -> Option<u16> {
    let val = std::env::var(name).ok()?;
    let result = parse_u16_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::SettingsError;
    use herald_broker::channel::Priority;

    fn write_settings(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("settings.json");
        std::fs::write(&path, body).unwrap();
        path
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_simple_override() {
        let target = serde_json::json!({"a": 1, "b": 2});
        let source = serde_json::json!({"a": 10});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 10);
        assert_eq!(merged["b"], 2);
    }

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"server": {"host": "h", "port": 1}});
        let source = serde_json::json!({"server": {"port": 2}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["server"]["host"], "h");
        assert_eq!(merged["server"]["port"], 2);
    }

    #[test]
    fn merge_array_replace() {
        let target = serde_json::json!({"list": [1, 2, 3]});
        let source = serde_json::json!({"list": [9]});
        let merged = deep_merge(target, source);
        assert_eq!(merged["list"], serde_json::json!([9]));
    }

    #[test]
    fn merge_null_preserves_target() {
        let target = serde_json::json!({"a": 1});
        let source = serde_json::json!({"a": null});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 1);
    }

    #[test]
    fn merge_new_keys_added() {
        let target = serde_json::json!({"a": 1});
        let source = serde_json::json!({"b": 2});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
    }

    // ── file loading ────────────────────────────────────────────────

    #[test]
    fn load_missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_file(&dir.path().join("absent.json")).unwrap();
        assert_eq!(settings, HeraldSettings::default());
    }

    #[test]
    fn load_empty_json_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_settings(&dir, "{}");
        assert_eq!(load_file(&path).unwrap(), HeraldSettings::default());
    }

    #[test]
    fn load_partial_json_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_settings(
            &dir,
            r#"{"server": {"port": 9000}, "broker": {"maxHistoryPerChannel": 25}}"#,
        );
        let settings = load_file(&path).unwrap();
        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.broker.max_history_per_channel, 25);
        assert_eq!(settings.broker.heartbeat_interval_ms, 30_000);
    }

    #[test]
    fn load_preconfigured_channels() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_settings(
            &dir,
            r#"{"broker": {"channels": [
                {"name": "compliance-alerts", "priority": "critical", "retentionWindowMs": 86400000},
                {"name": "staffing"}
            ]}}"#,
        );
        let settings = load_file(&path).unwrap();
        let channels = &settings.broker.channels;
        assert_eq!(channels.len(), 2);
        assert_eq!(channels[0].priority, Priority::Critical);
        assert_eq!(channels[0].retention_window_ms, Some(86_400_000));
        assert_eq!(channels[1].priority, Priority::Medium);
        assert_eq!(channels[1].max_history, None);
    }

    #[test]
    fn load_invalid_json_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_settings(&dir, "{not json");
        assert!(matches!(load_file(&path), Err(SettingsError::File { .. })));
    }

    #[test]
    fn mistyped_field_reports_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_settings(&dir, r#"{"server": {"port": "high"}}"#);
        match load_file(&path) {
            Err(SettingsError::File { path: failed, .. }) => assert_eq!(failed, path),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unreadable_file_reports_the_file() {
        let dir = tempfile::tempdir().unwrap();
        // A directory exists but cannot be read as a file.
        let err = load_file(dir.path()).unwrap_err();
        assert!(err.to_string().contains(&dir.path().display().to_string()));
    }

    #[test]
    fn load_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_settings(&dir, r#"{"broker": {"heartbeatIntervalMs": 0}}"#);
        assert!(matches!(
            load_settings_from_path(&path),
            Err(SettingsError::Invalid(_))
        ));
    }

    #[test]
    fn load_rejects_bad_channel_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_settings(&dir, r#"{"broker": {"channels": [{"name": "has space"}]}}"#);
        assert!(matches!(
            load_settings_from_path(&path),
            Err(SettingsError::Invalid(_))
        ));
    }

    // ── parsing ─────────────────────────────────────────────────────

    #[test]
    fn parse_bool_variants() {
        for v in ["true", "1", "yes", "on", "TRUE", "On"] {
            assert_eq!(parse_bool(v), Some(true), "{v}");
        }
        for v in ["false", "0", "no", "off", "FALSE"] {
            assert_eq!(parse_bool(v), Some(false), "{v}");
        }
        assert_eq!(parse_bool("maybe"), None);
        assert_eq!(parse_bool(""), None);
    }

    #[test]
    fn parse_u16_range_bounds() {
        assert_eq!(parse_u16_range("8090", 1, 65535), Some(8090));
        assert_eq!(parse_u16_range("0", 1, 65535), None);
        assert_eq!(parse_u16_range("70000", 1, 65535), None);
        assert_eq!(parse_u16_range("abc", 1, 65535), None);
    }

    #[test]
    fn parse_u64_range_bounds() {
        assert_eq!(parse_u64_range("30000", 100, 3_600_000), Some(30_000));
        assert_eq!(parse_u64_range("99", 100, 3_600_000), None);
        assert_eq!(parse_u64_range("-5", 100, 3_600_000), None);
    }

    #[test]
    fn parse_usize_range_bounds() {
        assert_eq!(parse_usize_range("100", 1, 1000), Some(100));
        assert_eq!(parse_usize_range("0", 1, 1000), None);
        assert_eq!(parse_usize_range("1001", 1, 1000), None);
    }
}
