use serde::{Deserialize, Serialize};
use std::{collections::HashMap, time::Duration};

use crate::{
    error::{RateLimitError, Result},
    redis::RedisConfig,
};

/// Limiter variants the registry knows how to build
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimiterKind {
    /// In-process sliding-window log
    #[default]
    Local,
    /// Store-backed fixed window with cooldown lock
    Distributed,
}

impl LimiterKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LimiterKind::Local => "local",
            LimiterKind::Distributed => "distributed",
        }
    }
}

impl std::fmt::Display for LimiterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable per-limiter configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitRule {
    /// Length of the counting interval
    #[serde(rename = "window_ms", with = "duration_ms")]
    pub window: Duration,
    /// Admissions allowed per window. Zero or negative means unlimited.
    pub limit: i64,
    /// Redis address for the distributed variant. Several URLs may be
    /// separated by commas.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_url: Option<String>,
}

impl RateLimitRule {
    pub fn new(window: Duration, limit: i64) -> Self {
        Self {
            window,
            limit,
            store_url: None,
        }
    }

    pub fn with_store_url(mut self, url: impl Into<String>) -> Self {
        self.store_url = Some(url.into());
        self
    }

    /// A non-positive limit disables bookkeeping entirely.
    pub fn is_unlimited(&self) -> bool {
        self.limit <= 0
    }

    /// Window expressed in store-clock milliseconds
    pub fn window_ms(&self) -> i64 {
        i64::try_from(self.window.as_millis()).unwrap_or(i64::MAX)
    }

    /// Check the rule can drive a limiter of the given kind.
    pub fn validate(&self, kind: LimiterKind) -> Result<()> {
        if self.window.is_zero() {
            return Err(RateLimitError::Config(
                "Rate limit window must be positive".to_string(),
            ));
        }

        if kind == LimiterKind::Distributed {
            if self.window.subsec_nanos() % 1_000_000 != 0 {
                return Err(RateLimitError::Config(format!(
                    "Distributed window must be a whole number of milliseconds, got {:?}",
                    self.window
                )));
            }

            match self.store_url.as_deref().map(str::trim) {
                Some(url) if !url.is_empty() => {}
                _ => {
                    return Err(RateLimitError::Config(
                        "Distributed limiter requires a store_url".to_string(),
                    ))
                }
            }
        }

        Ok(())
    }
}

impl Default for RateLimitRule {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), 50)
    }
}

/// Settings consumed when building a registry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimiterSettings {
    #[serde(default)]
    pub default_rule: RateLimitRule,
    /// Per-key rules, used when `bind` is called without an explicit rule
    #[serde(default)]
    pub rules: HashMap<String, RateLimitRule>,
    #[serde(default)]
    pub redis: RedisSettings,
}

/// Redis connection knobs in file-friendly units
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisSettings {
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

fn default_connection_timeout_ms() -> u64 {
    5000
}

fn default_command_timeout_ms() -> u64 {
    1000
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            connection_timeout_ms: default_connection_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

impl From<&RedisSettings> for RedisConfig {
    fn from(settings: &RedisSettings) -> Self {
        RedisConfig {
            connection_timeout: Duration::from_millis(settings.connection_timeout_ms),
            command_timeout: Duration::from_millis(settings.command_timeout_ms),
        }
    }
}

/// Load settings from an optional file, then `RATELIMIT__*` environment
/// variables (e.g. `RATELIMIT__DEFAULT_RULE__LIMIT=10`).
pub fn load_settings(path: Option<&str>) -> Result<RateLimiterSettings> {
    let mut builder = config::Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(config::File::with_name(path).required(false));
    }

    let settings = builder
        .add_source(
            config::Environment::with_prefix("RATELIMIT")
                .prefix_separator("__")
                .separator("__"),
        )
        .build()?
        .try_deserialize()?;

    Ok(settings)
}

/// Load settings from YAML string
pub fn load_settings_from_yaml(yaml: &str) -> Result<RateLimiterSettings> {
    Ok(serde_yaml::from_str(yaml)?)
}

/// Load settings from YAML file
pub fn load_settings_from_file(path: &str) -> Result<RateLimiterSettings> {
    let content = std::fs::read_to_string(path)?;
    load_settings_from_yaml(&content)
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
