//! Settings loading with deep merge and environment variable overrides.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::Path;

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError, RESERVED_PATHS};
use crate::types::{LogFormat, SwitchboardSettings};

/// Load settings from `path` with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or an invalid merged result is
/// an error.
pub fn load_settings_from_path(path: &Path) -> Result<SwitchboardSettings> {
    let defaults = serde_json::to_value(SwitchboardSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: SwitchboardSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    validate(&settings)?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
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

/// Apply `SWITCHBOARD_*` environment overrides.
///
/// Invalid values are ignored with a warning.
pub fn apply_env_overrides(settings: &mut SwitchboardSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary lookup.
fn apply_overrides_from<F>(settings: &mut SwitchboardSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(v) = read("SWITCHBOARD_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read("SWITCHBOARD_PORT") {
        match v.parse::<u16>() {
            Ok(port) => settings.server.port = port,
            Err(_) => warn!(key = "SWITCHBOARD_PORT", value = %v, "invalid port env var, ignoring"),
        }
    }
    if let Some(v) = read("SWITCHBOARD_WS_PATH") {
        if v.starts_with('/') {
            settings.server.ws_path = v;
        } else {
            warn!(key = "SWITCHBOARD_WS_PATH", value = %v, "ws path must start with '/', ignoring");
        }
    }
    if let Some(v) = read("SWITCHBOARD_MAX_MESSAGE_SIZE") {
        match parse_usize_range(&v, 1, usize::MAX) {
            Some(n) => settings.server.max_message_size = n,
            None => warn!(key = "SWITCHBOARD_MAX_MESSAGE_SIZE", value = %v, "invalid size env var, ignoring"),
        }
    }
    if let Some(v) = read("SWITCHBOARD_LOG_LEVEL") {
        if is_level(&v) {
            settings.logging.level = v.to_lowercase();
        } else {
            warn!(key = "SWITCHBOARD_LOG_LEVEL", value = %v, "invalid log level env var, ignoring");
        }
    }
    if let Some(v) = read("SWITCHBOARD_LOG_JSON") {
        match parse_bool(&v) {
            Some(true) => settings.logging.format = LogFormat::Json,
            Some(false) => settings.logging.format = LogFormat::Pretty,
            None => warn!(key = "SWITCHBOARD_LOG_JSON", value = %v, "invalid boolean env var, ignoring"),
        }
    }
}

fn validate(settings: &SwitchboardSettings) -> Result<()> {
    let ws_path = &settings.server.ws_path;
    if !ws_path.starts_with('/') {
        return Err(SettingsError::RelativeWsPath(ws_path.clone()));
    }
    if RESERVED_PATHS.contains(&ws_path.as_str()) {
        return Err(SettingsError::ReservedWsPath(ws_path.clone()));
    }
    if settings.server.max_message_size == 0 {
        return Err(SettingsError::ZeroMessageSize);
    }
    if !is_level(&settings.logging.level) {
        return Err(SettingsError::UnknownLogLevel(settings.logging.level.clone()));
    }
    Ok(())
}

/// Whether `val` names a tracing level.
fn is_level(val: &str) -> bool {
    matches!(
        val.to_lowercase().as_str(),
        "trace" | "debug" | "info" | "warn" | "error"
    )
}

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

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn overrides(pairs: &[(&str, &str)]) -> SwitchboardSettings {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        let mut settings = SwitchboardSettings::default();
        apply_overrides_from(&mut settings, |name| env.get(name).cloned());
        settings
    }

    #[test]
    fn merge_nested_override() {
        let merged = deep_merge(
            json!({"server": {"host": "a", "port": 1}}),
            json!({"server": {"port": 2}}),
        );
        assert_eq!(merged, json!({"server": {"host": "a", "port": 2}}));
    }

    #[test]
    fn merge_null_preserves_target() {
        let merged = deep_merge(json!({"a": 1}), json!({"a": null}));
        assert_eq!(merged["a"], 1);
    }

    #[test]
    fn merge_array_replace() {
        let merged = deep_merge(json!({"list": [1, 2, 3]}), json!({"list": [9]}));
        assert_eq!(merged["list"], json!([9]));
    }

    #[test]
    fn merge_primitive_replaces_object() {
        let merged = deep_merge(json!({"a": {"b": 1}}), json!({"a": 5}));
        assert_eq!(merged["a"], 5);
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_from_path(&dir.path().join("absent.json")).unwrap();
        assert_eq!(settings.server.ws_path, "/ws");
    }

    #[test]
    fn load_partial_json_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"server":{"port":9100,"allowedOrigins":["https://app.example"]},"logging":{"level":"debug"}}"#,
        )
        .unwrap();
        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.server.port, 9100);
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.server.allowed_origins, vec!["https://app.example"]);
        assert_eq!(settings.logging.level, "debug");
    }

    #[test]
    fn load_invalid_json_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ nope").unwrap();
        let err = load_settings_from_path(&path).unwrap_err();
        assert!(matches!(err, SettingsError::Malformed(_)));
    }

    #[test]
    fn load_rejects_bad_ws_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server":{"wsPath":"ws"}}"#).unwrap();
        let err = load_settings_from_path(&path).unwrap_err();
        assert!(matches!(err, SettingsError::RelativeWsPath(p) if p == "ws"));
    }

    #[test]
    fn load_rejects_colliding_ws_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        for reserved in RESERVED_PATHS {
            std::fs::write(&path, format!(r#"{{"server":{{"wsPath":"{reserved}"}}}}"#)).unwrap();
            let err = load_settings_from_path(&path).unwrap_err();
            assert!(matches!(err, SettingsError::ReservedWsPath(p) if p == reserved));
        }
    }

    #[test]
    fn load_rejects_zero_size_and_unknown_level() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server":{"maxMessageSize":0}}"#).unwrap();
        assert!(matches!(
            load_settings_from_path(&path).unwrap_err(),
            SettingsError::ZeroMessageSize
        ));
        std::fs::write(&path, r#"{"logging":{"level":"loud"}}"#).unwrap();
        assert!(matches!(
            load_settings_from_path(&path).unwrap_err(),
            SettingsError::UnknownLogLevel(l) if l == "loud"
        ));
    }

    #[test]
    fn load_module_levels_as_object() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"logging":{"modules":{"switchboard_server":"debug","hyper":"warn"}}}"#,
        )
        .unwrap();
        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.logging.modules["switchboard_server"], "debug");
        assert_eq!(settings.logging.modules["hyper"], "warn");
    }

    #[test]
    fn env_overrides_apply() {
        let s = overrides(&[
            ("SWITCHBOARD_HOST", "0.0.0.0"),
            ("SWITCHBOARD_PORT", "7000"),
            ("SWITCHBOARD_WS_PATH", "/socket"),
            ("SWITCHBOARD_MAX_MESSAGE_SIZE", "4096"),
            ("SWITCHBOARD_LOG_LEVEL", "DEBUG"),
            ("SWITCHBOARD_LOG_JSON", "yes"),
        ]);
        assert_eq!(s.server.host, "0.0.0.0");
        assert_eq!(s.server.port, 7000);
        assert_eq!(s.server.ws_path, "/socket");
        assert_eq!(s.server.max_message_size, 4096);
        assert_eq!(s.logging.level, "debug");
        assert_eq!(s.logging.format, LogFormat::Json);
    }

    #[test]
    fn invalid_env_values_ignored() {
        let s = overrides(&[
            ("SWITCHBOARD_PORT", "70000"),
            ("SWITCHBOARD_WS_PATH", "no-slash"),
            ("SWITCHBOARD_MAX_MESSAGE_SIZE", "0"),
            ("SWITCHBOARD_LOG_LEVEL", "loud"),
            ("SWITCHBOARD_LOG_JSON", "maybe"),
            ("SWITCHBOARD_HOST", ""),
        ]);
        assert_eq!(s, SwitchboardSettings::default());
    }

    #[test]
    fn parse_bool_variants() {
        for v in ["true", "1", "YES", "on"] {
            assert_eq!(parse_bool(v), Some(true));
        }
        for v in ["false", "0", "No", "off"] {
            assert_eq!(parse_bool(v), Some(false));
        }
        assert_eq!(parse_bool("2"), None);
    }

    #[test]
    fn parse_usize_bounds() {
        assert_eq!(parse_usize_range("10", 1, 100), Some(10));
        assert_eq!(parse_usize_range("0", 1, 100), None);
        assert_eq!(parse_usize_range("-3", 1, 100), None);
    }
}
