//! Server configuration and settings loading.
//!
//! Loading flow:
//! 1. Start with [`ServerConfig::default()`]
//! 2. If a settings file is given and exists, deep-merge it over the defaults
//! 3. Apply `SOCKROUTE_*` environment overrides (highest priority)
//!
//! Invalid environment values are ignored with a warning.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::websocket::actor::ActorConfig;
use crate::websocket::keepalive::{Disabled, IntervalProbe, KeepaliveStrategy};

/// Errors raised while loading settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// Failed to read the settings file from disk.
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    /// Failed to parse JSON in the settings file.
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// A settings value was invalid.
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

/// Configuration for the bridge server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Seconds between keepalive probes. `0` disables keepalive.
    pub keepalive_interval_secs: u64,
    /// Seconds a handler has to reply. `0` waits forever.
    pub reply_timeout_secs: u64,
    /// Per-connection read → handling channel capacity.
    pub inbound_capacity: usize,
    /// Per-connection handling → write channel capacity.
    pub outbound_capacity: usize,
    /// Seconds between registry sweeps for dead entries.
    pub prune_interval_secs: u64,
    /// Seconds to wait for tasks during graceful shutdown.
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            keepalive_interval_secs: 30,
            reply_timeout_secs: 30,
            inbound_capacity: 1,
            outbound_capacity: 16,
            prune_interval_secs: 60,
            shutdown_timeout_secs: 10,
        }
    }
}

impl ServerConfig {
    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.inbound_capacity == 0 {
            return Err(SettingsError::InvalidValue("inbound_capacity must be at least 1".into()));
        }
        if self.outbound_capacity == 0 {
            return Err(SettingsError::InvalidValue("outbound_capacity must be at least 1".into()));
        }
        if self.prune_interval_secs == 0 {
            return Err(SettingsError::InvalidValue("prune_interval_secs must be at least 1".into()));
        }
        Ok(())
    }

    /// `host:port` to bind.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Reply timeout, `None` when disabled.
    pub fn reply_timeout(&self) -> Option<Duration> {
        (self.reply_timeout_secs > 0).then(|| Duration::from_secs(self.reply_timeout_secs))
    }

    /// Registry sweep interval.
    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs.max(1))
    }

    /// Graceful shutdown budget.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Per-connection actor settings derived from this config.
    pub fn actor_config(&self) -> ActorConfig {
        let keepalive: Arc<dyn KeepaliveStrategy> =
            if self.keepalive_interval_secs == 0 {
                Arc::new(Disabled)
            } else {
                Arc::new(IntervalProbe::new(Duration::from_secs(self.keepalive_interval_secs)))
            };
        ActorConfig {
            keepalive,
            reply_timeout: self.reply_timeout(),
            inbound_capacity: self.inbound_capacity,
            outbound_capacity: self.outbound_capacity,
            ..ActorConfig::default()
        }
    }
}

/// Load config from an optional JSON file, then apply env overrides.
///
/// A missing file yields defaults; malformed JSON is an error.
pub fn load_config(path: Option<&Path>) -> Result<ServerConfig, SettingsError> {
    let defaults = serde_json::to_value(ServerConfig::default())?;

    let merged = match path {
        Some(path) if path.exists() => {
            debug!(?path, "loading settings from file");
            let content = std::fs::read_to_string(path)?;
            let user: Value = serde_json::from_str(&content)?;
            deep_merge(defaults, user)
        }
        Some(path) => {
            debug!(?path, "settings file not found, using defaults");
            defaults
        }
        None => defaults,
    };

    let mut config: ServerConfig = serde_json::from_value(merged)?;
    apply_env_overrides(&mut config);
    config.validate()?;
    Ok(config)
}

/// Recursive deep merge of two JSON values.
///
/// Objects merge per key, everything else is replaced by `source`. Nulls in
/// `source` are skipped.
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

/// Apply `SOCKROUTE_*` overrides from the process environment.
pub fn apply_env_overrides(config: &mut ServerConfig) {
    apply_overrides_from(config, |key| std::env::var(key).ok());
}

/// Apply overrides read through `lookup`.
pub fn apply_overrides_from(config: &mut ServerConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = read_string(&lookup, "SOCKROUTE_HOST") {
        config.host = v;
    }
    if let Some(v) = read_u16(&lookup, "SOCKROUTE_PORT", 0, 65535) {
        config.port = v;
    }
    if let Some(v) = read_u64(&lookup, "SOCKROUTE_KEEPALIVE_SECS", 0, 86_400) {
        config.keepalive_interval_secs = v;
    }
    if let Some(v) = read_u64(&lookup, "SOCKROUTE_REPLY_TIMEOUT_SECS", 0, 86_400) {
        config.reply_timeout_secs = v;
    }
}

fn read_string(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key).filter(|v| !v.trim().is_empty())
}

fn read_u64(lookup: &impl Fn(&str) -> Option<String>, key: &str, min: u64, max: u64) -> Option<u64> {
    let raw = read_string(lookup, key)?;
    match raw.trim().parse::<u64>() {
        Ok(v) if (min..=max).contains(&v) => Some(v),
        _ => {
            warn!(key, value = %raw, min, max, "ignoring invalid environment override");
            None
        }
    }
}

fn read_u16(lookup: &impl Fn(&str) -> Option<String>, key: &str, min: u16, max: u16) -> Option<u16> {
    read_u64(lookup, key, u64::from(min), u64::from(max)).and_then(|v| u16::try_from(v).ok())
}
