//! Server configuration with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ServerConfig::default()`]
//! 2. If the given JSON file exists, deep-merge its values over the defaults
//! 3. Apply `RALLY_*` environment variable overrides (highest priority)

use std::ops::RangeInclusive;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the config file from disk.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    /// Failed to parse JSON in the config file.
    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Configuration for the Rally server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Maximum concurrent WebSocket connections; further upgrades get 503.
    pub max_connections: usize,
    /// Heartbeat probe interval in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Outbound frames queued per connection before new ones are dropped.
    pub send_queue_capacity: usize,
}

impl ServerConfig {
    /// Heartbeat interval as a [`Duration`].
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// `host:port` bind address.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 1024,
            heartbeat_interval_ms: 30_000,
            max_message_size: 16 * 1024 * 1024, // 16 MB
            send_queue_capacity: 1024,
        }
    }
}

/// Accepted `max_connections`, from the file or `RALLY_MAX_CONNECTIONS`.
pub const MAX_CONNECTIONS_RANGE: RangeInclusive<usize> = 1..=1_000_000;
/// Accepted `heartbeat_interval_ms`, from the file or `RALLY_HEARTBEAT_INTERVAL_MS`.
pub const HEARTBEAT_INTERVAL_MS_RANGE: RangeInclusive<u64> = 10..=3_600_000;
/// Accepted `max_message_size`, from the file or `RALLY_MAX_MESSAGE_SIZE`.
pub const MAX_MESSAGE_SIZE_RANGE: RangeInclusive<usize> = 1024..=1024 * 1024 * 1024;
/// Accepted `send_queue_capacity`; the outbound channel needs at least one slot.
pub const SEND_QUEUE_CAPACITY_RANGE: RangeInclusive<usize> = 1..=1_000_000;

/// Load configuration from `path` (if it exists) with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error. Numeric file
/// values outside their accepted range are replaced by the default with a
/// warning.
pub fn load_config(path: Option<&Path>) -> Result<ServerConfig, ConfigError> {
    let defaults = serde_json::to_value(ServerConfig::default())?;

    let merged = match path {
        Some(path) if path.exists() => {
            debug!(?path, "loading config from file");
            let content = std::fs::read_to_string(path)?;
            let user: Value = serde_json::from_str(&content)?;
            deep_merge(defaults, user)
        }
        Some(path) => {
            debug!(?path, "config file not found, using defaults");
            defaults
        }
        None => defaults,
    };

    let mut config: ServerConfig = serde_json::from_value(merged)?;
    reset_out_of_range(&mut config);
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Replace numeric fields outside their accepted range with the default.
pub fn reset_out_of_range(config: &mut ServerConfig) {
    let defaults = ServerConfig::default();
    reset_field(
        "max_connections",
        &mut config.max_connections,
        &MAX_CONNECTIONS_RANGE,
        defaults.max_connections,
    );
    reset_field(
        "heartbeat_interval_ms",
        &mut config.heartbeat_interval_ms,
        &HEARTBEAT_INTERVAL_MS_RANGE,
        defaults.heartbeat_interval_ms,
    );
    reset_field(
        "max_message_size",
        &mut config.max_message_size,
        &MAX_MESSAGE_SIZE_RANGE,
        defaults.max_message_size,
    );
    reset_field(
        "send_queue_capacity",
        &mut config.send_queue_capacity,
        &SEND_QUEUE_CAPACITY_RANGE,
        defaults.send_queue_capacity,
    );
}

fn reset_field<T>(key: &str, value: &mut T, range: &RangeInclusive<T>, default: T)
where
    T: PartialOrd + Copy + std::fmt::Display,
{
    if !range.contains(value) {
        warn!(
            key,
            value = %value,
            min = %range.start(),
            max = %range.end(),
            "config value out of range, using default"
        );
        *value = default;
    }
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

/// Apply `RALLY_*` environment variable overrides.
///
/// Integers must parse and fall within range; anything else is ignored with
/// a warning and the file/default value is kept.
pub fn apply_env_overrides(config: &mut ServerConfig) {
    if let Some(v) = read_env_string("RALLY_HOST") {
        config.host = v;
    }
    if let Some(v) = read_env_u16("RALLY_PORT", 0, 65535) {
        config.port = v;
    }
    if let Some(v) = read_env_usize(
        "RALLY_MAX_CONNECTIONS",
        *MAX_CONNECTIONS_RANGE.start(),
        *MAX_CONNECTIONS_RANGE.end(),
    ) {
        config.max_connections = v;
    }
    if let Some(v) = read_env_u64(
        "RALLY_HEARTBEAT_INTERVAL_MS",
        *HEARTBEAT_INTERVAL_MS_RANGE.start(),
        *HEARTBEAT_INTERVAL_MS_RANGE.end(),
    ) {
        config.heartbeat_interval_ms = v;
    }
    if let Some(v) = read_env_usize(
        "RALLY_MAX_MESSAGE_SIZE",
        *MAX_MESSAGE_SIZE_RANGE.start(),
        *MAX_MESSAGE_SIZE_RANGE.end(),
    ) {
        config.max_message_size = v;
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

fn read_env_u16(name: &str, min: u16, max: u16) -> Option<u16> {
    let val = std::env::var(name).ok()?;
    let result = parse_u16_range(&val, min, max);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid u16 env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    let val = std::env::var(name).ok()?;
    let result = parse_usize_range(&val, min, max);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid usize env var, ignoring");
    }
    result
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 0);
        assert_eq!(cfg.max_connections, 1024);
        assert_eq!(cfg.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(cfg.max_message_size, 16 * 1024 * 1024);
        assert_eq!(cfg.send_queue_capacity, 1024);
    }

    #[test]
    fn bind_addr_joins_host_and_port() {
        let cfg = ServerConfig {
            host: "0.0.0.0".into(),
            port: 8080,
            ..ServerConfig::default()
        };
        assert_eq!(cfg.bind_addr(), "0.0.0.0:8080");
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: ServerConfig = serde_json::from_str(r#"{"port":3000}"#).unwrap();
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.heartbeat_interval_ms, 30_000);
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn deep_merge_overrides_per_key() {
        let merged = deep_merge(
            json!({"host": "a", "port": 1, "nested": {"x": 1, "y": 2}}),
            json!({"port": 2, "nested": {"y": 3}}),
        );
        assert_eq!(merged, json!({"host": "a", "port": 2, "nested": {"x": 1, "y": 3}}));
    }

    #[test]
    fn deep_merge_skips_nulls() {
        let merged = deep_merge(json!({"host": "a"}), json!({"host": null}));
        assert_eq!(merged, json!({"host": "a"}));
    }

    #[test]
    fn deep_merge_replaces_arrays() {
        let merged = deep_merge(json!({"v": [1, 2]}), json!({"v": [3]}));
        assert_eq!(merged, json!({"v": [3]}));
    }

    // ── load_config ─────────────────────────────────────────────────

    #[test]
    fn load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config(Some(&dir.path().join("absent.json"))).unwrap();
        assert_eq!(cfg.max_connections, ServerConfig::default().max_connections);
    }

    #[test]
    fn load_merges_file_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rally.json");
        std::fs::write(&path, r#"{"max_connections": 8, "heartbeat_interval_ms": 500}"#).unwrap();
        let cfg = load_config(Some(&path)).unwrap();
        assert_eq!(cfg.max_connections, 8);
        assert_eq!(cfg.heartbeat_interval_ms, 500);
        assert_eq!(cfg.send_queue_capacity, 1024);
    }

    #[test]
    fn load_invalid_json_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rally.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(load_config(Some(&path)), Err(ConfigError::Json(_))));
    }

    #[test]
    fn load_resets_out_of_range_file_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rally.json");
        std::fs::write(
            &path,
            r#"{"heartbeat_interval_ms": 0, "send_queue_capacity": 0, "max_connections": 4}"#,
        )
        .unwrap();
        let cfg = load_config(Some(&path)).unwrap();
        assert_eq!(cfg.heartbeat_interval_ms, 30_000);
        assert_eq!(cfg.send_queue_capacity, 1024);
        assert_eq!(cfg.max_connections, 4);
    }

    #[test]
    fn reset_keeps_range_bounds() {
        let mut cfg = ServerConfig {
            heartbeat_interval_ms: 3_600_001,
            max_message_size: 1023,
            ..ServerConfig::default()
        };
        reset_out_of_range(&mut cfg);
        assert_eq!(cfg, ServerConfig::default());

        let mut cfg = ServerConfig {
            heartbeat_interval_ms: 10,
            max_message_size: 1024,
            ..ServerConfig::default()
        };
        reset_out_of_range(&mut cfg);
        assert_eq!(cfg.heartbeat_interval_ms, 10);
        assert_eq!(cfg.max_message_size, 1024);
    }

    // ── range parsing ───────────────────────────────────────────────

    #[test]
    fn parse_u16_bounds() {
        assert_eq!(parse_u16_range("9090", 0, 65535), Some(9090));
        assert_eq!(parse_u16_range("65536", 0, 65535), None);
        assert_eq!(parse_u16_range("abc", 0, 65535), None);
    }

    #[test]
    fn parse_u64_bounds() {
        assert_eq!(parse_u64_range("500", 10, 1000), Some(500));
        assert_eq!(parse_u64_range("5", 10, 1000), None);
    }

    #[test]
    fn parse_usize_bounds() {
        assert_eq!(parse_usize_range("1", 1, 10), Some(1));
        assert_eq!(parse_usize_range("0", 1, 10), None);
        assert_eq!(parse_usize_range("-1", 1, 10), None);
    }
}
