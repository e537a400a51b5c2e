//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`FanoutSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over defaults
//! 3. Apply `FANOUT_*` environment variable overrides (highest priority)
//! 4. Validate cross-field constraints
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use fanout_core::logging::LogFormat;
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::{FanoutSettings, PresenceBackend};

/// Resolve the default settings path (`~/.fanout/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".fanout").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<FanoutSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with process env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<FanoutSettings> {
    load_settings_with_env(path, |name| std::env::var(name).ok())
}

/// Load settings from `path`, reading overrides through `env`.
pub fn load_settings_with_env(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> Result<FanoutSettings> {
    let malformed = |source: serde_json::Error| SettingsError::Malformed {
        path: path.to_path_buf(),
        source,
    };
    let defaults = serde_json::to_value(FanoutSettings::default()).map_err(malformed)?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let user: Value = serde_json::from_str(&content).map_err(malformed)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: FanoutSettings = serde_json::from_value(merged).map_err(malformed)?;
    apply_env_overrides(&mut settings, env);
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

/// Apply environment variable overrides.
///
/// Invalid values are ignored with a warning and the file/default value is
/// kept.
pub fn apply_env_overrides(settings: &mut FanoutSettings, env: impl Fn(&str) -> Option<String>) {
    let env = Env(env);

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("FANOUT_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u16("FANOUT_PORT", 1, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = env.string("FANOUT_ADVERTISE") {
        settings.server.advertise = Some(v);
    }
    if let Some(v) = env.usize("FANOUT_MAX_CONNECTIONS", 1, 1_000_000) {
        settings.server.max_connections = v;
    }
    if let Some(v) = env.u64("FANOUT_HEARTBEAT_INTERVAL", 1, 3_600) {
        settings.server.heartbeat_interval_secs = v;
    }
    if let Some(v) = env.u64("FANOUT_HEARTBEAT_TIMEOUT", 1, 3_600) {
        settings.server.heartbeat_timeout_secs = v;
    }

    // ── Presence ────────────────────────────────────────────────────
    if let Some(v) = env.string("FANOUT_PRESENCE_BACKEND") {
        match parse_backend(&v) {
            Some(b) => settings.presence.backend = b,
            None => warn!(key = "FANOUT_PRESENCE_BACKEND", value = %v, "invalid backend, ignoring"),
        }
    }
    if let Some(v) = env.string("FANOUT_PRESENCE_DB") {
        settings.presence.sqlite_path = v;
    }
    if let Some(v) = env.u64("FANOUT_LEASE_SECS", 0, 86_400) {
        settings.presence.lease_secs = v;
    }
    if let Some(v) = env.u64("FANOUT_RENEW_INTERVAL", 1, 86_400) {
        settings.presence.renew_interval_secs = v;
    }

    // ── Relay ───────────────────────────────────────────────────────
    if let Some(v) = env.u64("FANOUT_RELAY_TIMEOUT_MS", 10, 60_000) {
        settings.relay.timeout_ms = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("FANOUT_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.string("FANOUT_LOG_FORMAT") {
        match v.to_lowercase().as_str() {
            "json" => settings.logging.format = LogFormat::Json,
            "compact" => settings.logging.format = LogFormat::Compact,
            _ => warn!(key = "FANOUT_LOG_FORMAT", value = %v, "invalid log format, ignoring"),
        }
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a presence backend name (case-insensitive).
pub fn parse_backend(val: &str) -> Option<PresenceBackend> {
    match val.to_lowercase().as_str() {
        "memory" => Some(PresenceBackend::Memory),
        "sqlite" => Some(PresenceBackend::Sqlite),
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

// ── Env readers (thin wrappers) ─────────────────────────────────────────────

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.0)(name).filter(|v| !v.is_empty())
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        let val = (self.0)(name)?;
        let result = parse_u16_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid u16 env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.0)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        let val = (self.0)(name)?;
        let result = parse_usize_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid usize env var, ignoring");
        }
        result
    }
}
