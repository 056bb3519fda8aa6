//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ConvoSettings::default()`]
//! 2. If the settings file exists, deep-merge user values over defaults
//! 3. Apply `CONVO_*` environment overrides (highest priority)
//! 4. Validate cross-field constraints
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::ConvoSettings;

/// Resolve the settings file path.
///
/// `CONVO_SETTINGS_PATH` wins; otherwise `~/.convo/settings.json`.
pub fn settings_path() -> PathBuf {
    if let Some(explicit) = read_env_string("CONVO_SETTINGS_PATH") {
        return PathBuf::from(explicit);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".convo").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<ConvoSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or a value that fails
/// validation is an error.
pub fn load_settings_from_path(path: &Path) -> Result<ConvoSettings> {
    let defaults = serde_json::to_value(ConvoSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let user: Value = serde_json::from_str(&content).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: ConvoSettings = serde_json::from_value(merged)?;
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
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `CONVO_*` environment variable overrides.
///
/// Integers must parse and fall within range; booleans accept
/// `true`/`1`/`yes`/`on` and `false`/`0`/`no`/`off`. Invalid values are
/// logged and ignored.
pub fn apply_env_overrides(settings: &mut ConvoSettings) {
    // ── Database ────────────────────────────────────────────────────
    if let Some(v) = read_env_string("CONVO_DB_PATH") {
        settings.database.path = v;
    }
    if let Some(v) = read_env_u64("CONVO_DB_BUSY_TIMEOUT_MS", 0, 600_000) {
        settings.database.busy_timeout_ms = v;
    }

    // ── Payload ─────────────────────────────────────────────────────
    if let Some(v) = read_env_string("CONVO_TENANT") {
        settings.payload.tenant = v;
    }
    if let Some(v) = read_env_u64("CONVO_INLINE_THRESHOLD_BYTES", 0, 16_777_216) {
        settings.payload.inline_threshold_bytes = v;
    }
    if let Some(v) = read_env_u64("CONVO_FALLBACK_INLINE_MAX_BYTES", 0, 67_108_864) {
        settings.payload.fallback_inline_max_bytes = v;
    }
    if let Some(v) = read_env_string("CONVO_OBJECT_ROOT") {
        settings.payload.object_root = v;
    }
    if let Some(v) = read_env_bool("CONVO_REDACTION_ENABLED") {
        settings.payload.redaction.enabled = v;
    }

    // ── Preview ─────────────────────────────────────────────────────
    if let Some(v) = read_env_u64("CONVO_PREVIEW_LIMIT_BYTES", 64, 16_777_216) {
        settings.preview.preview_limit_bytes = v;
    }
    if let Some(v) = read_env_u64("CONVO_SUMMARIZE_THRESHOLD_BYTES", 1, 1_073_741_824) {
        settings.preview.summarize_threshold_bytes = v;
    }
    if let Some(v) = read_env_u32("CONVO_AGED_AFTER_STEPS", 1, 10_000) {
        settings.preview.aged_after_steps = v;
    }

    // ── Elicitation ─────────────────────────────────────────────────
    if let Some(v) = read_env_u32("CONVO_ELICITATION_MAX_ATTEMPTS", 1, 100) {
        settings.elicitation.max_attempts = v;
    }
    if let Some(v) = read_env_u64("CONVO_ELICITATION_TIMEOUT_MS", 1, 86_400_000) {
        settings.elicitation.default_timeout_ms = Some(v);
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = read_env_string("CONVO_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_env_bool("CONVO_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean (case-insensitive).
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u32` within a range.
pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers ─────────────────────────────────────────────────────────

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

fn read_env_u32(name: &str, min: u32, max: u32) -> Option<u32> {
    let val = std::env::var(name).ok()?;
    let result = parse_u32_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u32 env var, ignoring");
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

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
