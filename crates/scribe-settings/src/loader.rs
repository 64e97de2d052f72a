//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ScribeSettings::default()`]
//! 2. If `~/.scribe/settings.json` exists, deep-merge user values over defaults
//! 3. Apply environment variable overrides (highest priority)
//! 4. [`ScribeSettings::validate`]
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::ScribeSettings;

/// Resolve the path to the settings file (`~/.scribe/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".scribe").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<ScribeSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<ScribeSettings> {
    let defaults = serde_json::to_value(ScribeSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: ScribeSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate();
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

/// Apply `SCRIBE_*` environment overrides to loaded settings.
pub fn apply_env_overrides(settings: &mut ScribeSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`.
///
/// Empty values are treated as unset. Numbers outside their range and
/// unrecognized flags are ignored with a warning.
fn apply_overrides(settings: &mut ScribeSettings, lookup: impl Fn(&str) -> Option<String>) {
    let var = |name: &str| lookup(name).filter(|v| !v.is_empty());
    let number = |name: &str, range: RangeInclusive<u64>| {
        let raw = var(name)?;
        let parsed = parse_in_range(&raw, &range);
        if parsed.is_none() {
            warn!(key = name, value = %raw, min = range.start(), max = range.end(), "ignoring out-of-range env override");
        }
        parsed
    };
    let count = |name: &str, range: RangeInclusive<u64>| {
        number(name, range).and_then(|v| usize::try_from(v).ok())
    };

    if let Some(v) = count("SCRIBE_CACHE_MAX_SIZE", 1..=MAX_CACHE_ENTRIES) {
        settings.cache.max_size = v;
    }
    if let Some(v) = number("SCRIBE_CACHE_TTL_MS", 0..=30 * DAY_MS) {
        settings.cache.default_ttl_ms = v;
    }
    if let Some(v) = count("SCRIBE_RATE_MAX_CALLS", 1..=100_000) {
        settings.rate_limit.max_calls = v;
    }
    if let Some(v) = number("SCRIBE_RATE_WINDOW_MS", 1..=DAY_MS) {
        settings.rate_limit.window_ms = v;
    }
    if let Some(v) = count("SCRIBE_MAX_JOBS", 1..=1_000) {
        settings.jobs.max_concurrent_jobs = v;
    }
    if let Some(v) = var("SCRIBE_API_BASE_URL") {
        settings.api.base_url = v;
    }
    if let Some(v) = var("SCRIBE_API_KEY") {
        settings.api.api_key = Some(v);
    }
    if let Some(v) = number("SCRIBE_API_TIMEOUT_MS", 1_000..=3_600_000) {
        settings.api.timeout_ms = v;
    }
    if let Some(v) = var("SCRIBE_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(raw) = var("SCRIBE_LOG_JSON") {
        match parse_flag(&raw) {
            Some(v) => settings.logging.json = v,
            None => warn!(key = "SCRIBE_LOG_JSON", value = %raw, "ignoring unrecognized flag"),
        }
    }
}

const DAY_MS: u64 = 24 * 3_600_000;

const MAX_CACHE_ENTRIES: u64 = 1_000_000;

fn parse_in_range(raw: &str, range: &RangeInclusive<u64>) -> Option<u64> {
    raw.trim().parse().ok().filter(|n| range.contains(n))
}

/// `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`, case-insensitive.
fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
