//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`CrosslineSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `CROSSLINE_*` environment overrides (highest priority)
//! 4. [`CrosslineSettings::validate`]
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::CrosslineSettings;

/// Resolve the default settings path (`~/.crossline/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".crossline").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<CrosslineSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON or an invalid merged value
/// is an error.
pub fn load_settings_from_path(path: &Path) -> Result<CrosslineSettings> {
    let defaults = serde_json::to_value(CrosslineSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: CrosslineSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
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

/// Apply `CROSSLINE_*` environment overrides.
///
/// Unset or empty variables are skipped; unparsable or out-of-range values
/// are logged and skipped.
pub fn apply_env_overrides(settings: &mut CrosslineSettings) {
    let identity = &mut settings.identity;
    override_from_env("CROSSLINE_SYSTEM_ID", &mut identity.system_id, nonblank);
    override_from_env("CROSSLINE_PEER_SYSTEM_ID", &mut identity.peer_system_id, nonblank);

    let server = &mut settings.server;
    override_from_env("CROSSLINE_HOST", &mut server.host, nonblank);
    override_from_env("CROSSLINE_PORT", &mut server.port, |v| parse_in_range(v, 1..=65_535));

    override_from_env("CROSSLINE_REQUEST_TIMEOUT_MS", &mut settings.session.request_timeout_ms, |v| {
        parse_in_range(v, 100..=600_000)
    });
    override_from_env("CROSSLINE_HISTORY_LIMIT", &mut settings.control.history_limit, |v| {
        parse_in_range(v, 1..=10_000)
    });
    override_from_env("CROSSLINE_PUSH_WORKERS", &mut settings.push.worker_concurrency, |v| {
        parse_in_range(v, 1..=1_024)
    });
    override_from_env("CROSSLINE_RETRANS_KEEP_DAYS", &mut settings.retrans.keep_days, |v| {
        parse_in_range(v, 0..=3_650)
    });

    override_from_env("CROSSLINE_LOG_LEVEL", &mut settings.logging.level, nonblank);
    override_from_env("CROSSLINE_LOG_JSON", &mut settings.logging.json, parse_bool);
}

/// Parse a flag: `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`, any case.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a number and keep it only if it lies in `range`.
pub fn parse_in_range<T>(val: &str, range: RangeInclusive<T>) -> Option<T>
where
    T: FromStr + PartialOrd,
{
    val.trim().parse().ok().filter(|n| range.contains(n))
}

fn nonblank(val: &str) -> Option<String> {
    let val = val.trim();
    (!val.is_empty()).then(|| val.to_owned())
}

fn override_from_env<T>(name: &str, slot: &mut T, parse: impl Fn(&str) -> Option<T>) {
    let Ok(raw) = std::env::var(name) else {
        return;
    };
    if raw.is_empty() {
        return;
    }
    match parse(&raw) {
        Some(value) => {
            debug!(key = name, "settings override from environment");
            *slot = value;
        }
        None => warn!(key = name, value = %raw, "invalid environment override, ignoring"),
    }
}
