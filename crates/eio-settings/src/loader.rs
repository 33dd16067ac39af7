//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`EioSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over defaults
//! 3. Apply `EIO_*` environment variable overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use eio_core::TransportKind;
use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::EioSettings;

/// Env var naming an explicit settings file.
pub const SETTINGS_PATH_ENV: &str = "EIO_SETTINGS";

/// Resolve the settings file: `$EIO_SETTINGS`, else `~/.eio/settings.json`.
pub fn settings_path() -> PathBuf {
    if let Some(explicit) = read_env_string(SETTINGS_PATH_ENV) {
        return PathBuf::from(explicit);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".eio").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<EioSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<EioSettings> {
    let mut settings = load_file(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Defaults deep-merged with the file at `path`, without env overrides.
pub fn load_file(path: &Path) -> Result<EioSettings> {
    let defaults = serde_json::to_value(EioSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let settings: EioSettings = serde_json::from_value(merged)?;
    validate(&settings)?;
    Ok(settings)
}

/// Reject values that deserialize but cannot drive the engine.
pub fn validate(settings: &EioSettings) -> Result<()> {
    if settings.engine.transports.is_empty() {
        return Err(SettingsError::Invalid {
            field: "engine.transports",
            reason: "at least one transport must be enabled".to_string(),
        });
    }
    if parse_mount_path(&settings.server.path).is_none() {
        return Err(SettingsError::Invalid {
            field: "server.path",
            reason: format!("{:?} must start with '/'", settings.server.path),
        });
    }
    if settings.engine.ping_interval_ms == 0 || settings.engine.upgrade_probe_interval_ms == 0 {
        return Err(SettingsError::Invalid {
            field: "engine",
            reason: "intervals must be non-zero".to_string(),
        });
    }
    Ok(())
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

/// Apply `EIO_*` environment variable overrides to loaded settings.
///
/// Invalid values are ignored with a warning.
pub fn apply_env_overrides(settings: &mut EioSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`, so tests need not touch the
/// process environment.
pub fn apply_overrides(settings: &mut EioSettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("EIO_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.parsed("EIO_PORT", |s| parse_in_range::<u16>(s, 0..=u16::MAX)) {
        settings.server.port = v;
    }
    if let Some(v) = env.parsed("EIO_PATH", parse_mount_path) {
        settings.server.path = v;
    }

    // ── Engine ──────────────────────────────────────────────────────
    if let Some(v) = env.parsed("EIO_PING_INTERVAL_MS", |s| parse_in_range(s, 100..=3_600_000)) {
        settings.engine.ping_interval_ms = v;
    }
    if let Some(v) = env.parsed("EIO_PING_TIMEOUT_MS", |s| parse_in_range(s, 100..=3_600_000)) {
        settings.engine.ping_timeout_ms = v;
    }
    if let Some(v) = env.parsed("EIO_UPGRADE_TIMEOUT_MS", |s| parse_in_range(s, 100..=600_000)) {
        settings.engine.upgrade_timeout_ms = v;
    }
    if let Some(v) = env.parsed("EIO_CLOSE_TIMEOUT_MS", |s| parse_in_range(s, 100..=600_000)) {
        settings.engine.close_timeout_ms = v;
    }
    if let Some(v) = env.parsed("EIO_UPGRADE_PROBE_INTERVAL_MS", |s| {
        parse_in_range(s, 10..=60_000)
    }) {
        settings.engine.upgrade_probe_interval_ms = v;
    }
    if let Some(v) = env.parsed("EIO_TRANSPORTS", parse_transports) {
        settings.engine.transports = v;
    }
    if let Some(v) = env.parsed("EIO_ALLOW_UPGRADES", parse_bool) {
        settings.engine.allow_upgrades = v;
    }
    if let Some(v) = env.raw("EIO_COOKIE") {
        settings.engine.cookie = (!v.is_empty()).then_some(v);
    }
    if let Some(v) = env.parsed("EIO_MAX_HTTP_BUFFER_SIZE", |s| {
        parse_in_range(s, 1024..=1_073_741_824)
    }) {
        settings.engine.max_http_buffer_size = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("EIO_LOG_LEVEL") {
        settings.logging.level = v;
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

/// Parse a number that must fall inside `range`.
pub fn parse_in_range<T>(val: &str, range: RangeInclusive<T>) -> Option<T>
where
    T: FromStr + PartialOrd,
{
    val.parse().ok().filter(|n| range.contains(n))
}

/// Parse a comma-separated, non-empty list of transport names.
pub fn parse_transports(val: &str) -> Option<Vec<TransportKind>> {
    let mut kinds = Vec::new();
    for name in val.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let kind: TransportKind = name.parse().ok()?;
        if !kinds.contains(&kind) {
            kinds.push(kind);
        }
    }
    (!kinds.is_empty()).then_some(kinds)
}

/// Parse a mount path: must start with `/`, trailing slashes dropped.
pub fn parse_mount_path(val: &str) -> Option<String> {
    if !val.starts_with('/') {
        return None;
    }
    let trimmed = val.trim_end_matches('/');
    Some(if trimmed.is_empty() { "/" } else { trimmed }.to_string())
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn raw(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
    }

    fn string(&self, name: &str) -> Option<String> {
        self.raw(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
        let val = self.raw(name)?;
        let result = parse(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid env var, ignoring");
        }
        result
    }
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn overrides(pairs: &[(&str, &str)]) -> EioSettings {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        let mut settings = EioSettings::default();
        apply_overrides(&mut settings, |name| vars.get(name).cloned());
        settings
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({
            "server": {"port": 3000, "host": "localhost"}
        });
        let source = serde_json::json!({
            "server": {"port": 9090}
        });
        let merged = deep_merge(target, source);
        assert_eq!(merged["server"]["port"], 9090);
        assert_eq!(merged["server"]["host"], "localhost");
    }

    #[test]
    fn merge_array_replace() {
        let target = serde_json::json!({"transports": ["polling", "websocket"]});
        let source = serde_json::json!({"transports": ["websocket"]});
        let merged = deep_merge(target, source);
        assert_eq!(merged["transports"], serde_json::json!(["websocket"]));
    }

    #[test]
    fn merge_null_preserves_target() {
        let target = serde_json::json!({"a": 1, "b": 2});
        let source = serde_json::json!({"a": null});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
    }

    #[test]
    fn merge_primitive_replaces_object() {
        let target = serde_json::json!({"a": {"nested": true}});
        let source = serde_json::json!({"a": 42});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 42);
    }

    #[test]
    fn merge_empty_source() {
        let target = serde_json::json!({"a": 1, "b": {"c": 2}});
        let merged = deep_merge(target.clone(), serde_json::json!({}));
        assert_eq!(merged, target);
    }

    // ── load_file ───────────────────────────────────────────────────

    #[test]
    fn load_missing_file_returns_defaults() {
        let settings = load_file(Path::new("/nonexistent/settings.json")).unwrap();
        assert_eq!(settings, EioSettings::default());
    }

    #[test]
    fn load_partial_json_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"server": {"port": 9090}, "engine": {"pingInterval": 5000}}"#,
        )
        .unwrap();

        let settings = load_file(&path).unwrap();
        assert_eq!(settings.server.port, 9090);
        assert_eq!(settings.server.path, "/engine.io");
        assert_eq!(settings.engine.ping_interval_ms, 5000);
        assert_eq!(settings.engine.ping_timeout_ms, 60_000);
    }

    #[test]
    fn load_transport_list_replaces_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"engine": {"transports": ["polling"]}}"#).unwrap();

        let settings = load_file(&path).unwrap();
        assert_eq!(settings.engine.transports, vec![TransportKind::Polling]);
    }

    #[test]
    fn load_invalid_json_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not valid json").unwrap();

        let result = load_file(&path);
        assert!(matches!(result.unwrap_err(), SettingsError::Json(_)));
    }

    #[test]
    fn load_unknown_transport_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"engine": {"transports": ["flashsocket"]}}"#).unwrap();

        assert!(matches!(load_file(&path).unwrap_err(), SettingsError::Json(_)));
    }

    #[test]
    fn load_empty_transport_list_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"engine": {"transports": []}}"#).unwrap();

        assert!(matches!(
            load_file(&path).unwrap_err(),
            SettingsError::Invalid {
                field: "engine.transports",
                ..
            }
        ));
    }

    #[test]
    fn load_relative_path_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server": {"path": "engine.io"}}"#).unwrap();

        assert!(matches!(
            load_file(&path).unwrap_err(),
            SettingsError::Invalid { field: "server.path", .. }
        ));
    }

    // ── overrides ───────────────────────────────────────────────────

    #[test]
    fn env_overrides_apply() {
        let settings = overrides(&[
            ("EIO_PORT", "8088"),
            ("EIO_PATH", "/rt/"),
            ("EIO_PING_INTERVAL_MS", "1000"),
            ("EIO_TRANSPORTS", "websocket"),
            ("EIO_ALLOW_UPGRADES", "off"),
            ("EIO_LOG_LEVEL", "debug"),
        ]);
        assert_eq!(settings.server.port, 8088);
        assert_eq!(settings.server.path, "/rt");
        assert_eq!(settings.engine.ping_interval_ms, 1000);
        assert_eq!(settings.engine.transports, vec![TransportKind::Websocket]);
        assert!(!settings.engine.allow_upgrades);
        assert_eq!(settings.logging.level, "debug");
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let settings = overrides(&[
            ("EIO_PORT", "99999"),
            ("EIO_PING_TIMEOUT_MS", "soon"),
            ("EIO_TRANSPORTS", "carrier-pigeon"),
            ("EIO_PATH", "no-slash"),
        ]);
        assert_eq!(settings, EioSettings::default());
    }

    #[test]
    fn empty_cookie_env_disables_cookie() {
        let settings = overrides(&[("EIO_COOKIE", "")]);
        assert!(settings.engine.cookie.is_none());

        let settings = overrides(&[("EIO_COOKIE", "eio")]);
        assert_eq!(settings.engine.cookie.as_deref(), Some("eio"));
    }

    // ── parsers ─────────────────────────────────────────────────────

    #[test]
    fn parse_bool_variants() {
        for val in &["true", "1", "yes", "on", "TRUE"] {
            assert_eq!(parse_bool(val), Some(true), "failed for {val}");
        }
        for val in &["false", "0", "no", "off", "Off"] {
            assert_eq!(parse_bool(val), Some(false), "failed for {val}");
        }
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_in_range::<u16>("9090", 1..=u16::MAX), Some(9090));
        assert_eq!(parse_in_range::<u16>("70000", 0..=u16::MAX), None);
        assert_eq!(parse_in_range::<u64>("500", 1000..=600_000), None);
        assert_eq!(parse_in_range::<usize>("2048", 1024..=4096), Some(2048));
        assert_eq!(parse_in_range::<usize>("x", 1024..=4096), None);
    }

    #[test]
    fn parse_transport_lists() {
        assert_eq!(
            parse_transports("polling, websocket,polling"),
            Some(vec![TransportKind::Polling, TransportKind::Websocket])
        );
        assert_eq!(parse_transports(""), None);
        assert_eq!(parse_transports("polling,smoke"), None);
    }

    #[test]
    fn parse_mount_paths() {
        assert_eq!(parse_mount_path("/engine.io/").as_deref(), Some("/engine.io"));
        assert_eq!(parse_mount_path("/").as_deref(), Some("/"));
        assert_eq!(parse_mount_path("engine.io"), None);
    }
}
