//! Settings loading with environment variable overrides.
//!
//! Loading flow:
//! 1. Resolve the file path: explicit argument, else `TUICUB_RELAY_CONFIG`,
//!    else `relay.json` in the working directory
//! 2. If the file exists, parse it over compiled defaults (missing fields keep
//!    their defaults)
//! 3. Apply `TUICUB_*` environment variable overrides (highest priority)

use std::path::{Path, PathBuf};

use tracing::debug;
use tuicub_core::SharedSecret;

use crate::errors::Result;
use crate::types::{LogFormat, RelaySettings};

pub const CONFIG_ENV: &str = "TUICUB_RELAY_CONFIG";

/// Resolve the path to the settings file.
pub fn settings_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    std::env::var(CONFIG_ENV)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("relay.json"))
}

/// Load settings from the resolved path with env var overrides.
pub fn load_settings(explicit: Option<&Path>) -> Result<RelaySettings> {
    load_settings_from_path(&settings_path(explicit))
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON, or the result fails validation, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<RelaySettings> {
    let mut settings = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str::<RelaySettings>(&content)?
    } else {
        debug!(?path, "settings file not found, using defaults");
        RelaySettings::default()
    };

    apply_env_overrides(&mut settings, |name| std::env::var(name).ok());
    settings.validate()?;
    Ok(settings)
}

/// Apply `TUICUB_*` overrides read through `lookup`.
///
/// Invalid values are logged and ignored (falling back to file/default).
pub fn apply_env_overrides(settings: &mut RelaySettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    // ── Client listener ─────────────────────────────────────────────
    if let Some(v) = env.read_string("TUICUB_EVENTS_HOST") {
        settings.events.host = v;
    }
    if let Some(v) = env.read_u16("TUICUB_EVENTS_PORT", 0, 65535) {
        settings.events.port = v;
    }
    if let Some(v) = env.read_usize("TUICUB_QUEUE_CAPACITY", 1, 1_000_000) {
        settings.events.queue_capacity = v;
    }
    if let Some(v) = env.read_u64("TUICUB_IDLE_TIMEOUT_MS", 1_000, 86_400_000) {
        settings.events.idle_timeout_ms = v;
    }

    // ── Publisher listener ──────────────────────────────────────────
    if let Some(v) = env.read_string("TUICUB_MESSAGES_HOST") {
        settings.messages.host = v;
    }
    if let Some(v) = env.read_u16("TUICUB_MESSAGES_PORT", 0, 65535) {
        settings.messages.port = v;
    }
    if let Some(v) = env.read_string("TUICUB_MESSAGES_SECRET") {
        settings.messages.secret = SharedSecret::new(v);
    }

    // ── Disconnect callback ─────────────────────────────────────────
    if let Some(v) = env.read_string("TUICUB_API_URL") {
        settings.callback.base_url = v;
    }
    if let Some(v) = env.read_string("TUICUB_EVENTS_SECRET") {
        settings.callback.secret = SharedSecret::new(v);
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.read_string("TUICUB_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.read_string("TUICUB_LOG_FORMAT") {
        match parse_log_format(&v) {
            Some(format) => settings.logging.format = format,
            None => tracing::warn!(key = "TUICUB_LOG_FORMAT", value = %v, "invalid log format, ignoring"),
        }
    }
    if let Some(v) = env.read_string("TUICUB_LOG_FILE") {
        settings.logging.file = Some(PathBuf::from(v));
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

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

pub fn parse_log_format(val: &str) -> Option<LogFormat> {
    match val.to_lowercase().as_str() {
        "json" => Some(LogFormat::Json),
        "pretty" | "text" => Some(LogFormat::Pretty),
        _ => None,
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn read_string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn read_u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        let val = self.read_string(name)?;
        let result = parse_u16_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
        }
        result
    }

    fn read_u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = self.read_string(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }

    fn read_usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        let val = self.read_string(name)?;
        let result = parse_usize_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
        }
        result
    }
}
