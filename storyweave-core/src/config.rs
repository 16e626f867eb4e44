use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub realtime: RealtimeConfig,
    pub logging: LoggingConfig,
}

/// Realtime collaboration channel settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Prefix prepended to the story ID to form the transport topic
    pub topic_prefix: String,
    pub heartbeat_interval_secs: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    /// Automatic retries before a session is marked failed
    pub max_reconnect_attempts: u32,
    /// Maximum concurrently open story channels per registry
    pub max_channels: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            topic_prefix: "story:".to_string(),
            heartbeat_interval_secs: 30,
            reconnect_base_delay_ms: 1000,
            reconnect_max_delay_ms: 30_000,
            max_reconnect_attempts: 5,
            max_channels: 10,
        }
    }
}

impl RealtimeConfig {
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    #[must_use]
    pub const fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    #[must_use]
    pub const fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    /// Transport topic for a story
    #[must_use]
    pub fn topic_for(&self, story_id: &str) -> String {
        format!("{}{}", self.topic_prefix, story_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // STORYWEAVE_REALTIME__MAX_CHANNELS, STORYWEAVE_LOGGING__LEVEL, ...
        builder = builder.add_source(
            Environment::with_prefix("STORYWEAVE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Check for values that would make the channel manager misbehave.
    ///
    /// Returns every problem found rather than stopping at the first one.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let realtime = &self.realtime;

        if realtime.topic_prefix.is_empty() {
            errors.push("realtime.topic_prefix must not be empty".to_string());
        }
        if realtime.heartbeat_interval_secs == 0 {
            errors.push("realtime.heartbeat_interval_secs must be greater than 0".to_string());
        }
        if realtime.reconnect_base_delay_ms == 0 {
            errors.push("realtime.reconnect_base_delay_ms must be greater than 0".to_string());
        }
        if realtime.reconnect_max_delay_ms < realtime.reconnect_base_delay_ms {
            errors.push(format!(
                "realtime.reconnect_max_delay_ms ({}) must not be below \
                 reconnect_base_delay_ms ({})",
                realtime.reconnect_max_delay_ms, realtime.reconnect_base_delay_ms
            ));
        }
        if realtime.max_channels == 0 {
            errors.push("realtime.max_channels must be greater than 0".to_string());
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got \"{}\"",
                self.logging.format
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
