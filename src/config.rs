use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::GateError;
use crate::log::parse_log_level;

#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct GateConfig {
    pub queue: QueueConfig,
    pub coordinator: CoordinatorConfig,
    pub limits: LimitsConfig,
    pub log: LogConfig,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    /// Re-check requests handed to the handler at once.
    pub batch_length: usize,
    pub workers: usize,
    /// Pause before failed re-checks are attempted again.
    pub retry_delay_ms: u64,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub channel_capacity: usize,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct LimitsConfig {
    /// Run titles and job names are cut to this many bytes.
    pub max_name_len: usize,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_length: 20,
            workers: 1,
            retry_delay_ms: 1000,
        }
    }
}

impl QueueConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            channel_capacity: crate::coordinator::CHANNEL_CAPACITY,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self { max_name_len: 255 }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

pub fn validate(config: &GateConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if config.queue.batch_length < 1 {
        errors.push("queue.batch_length must be >= 1".to_string());
    }

    if config.queue.workers < 1 {
        errors.push("queue.workers must be >= 1".to_string());
    }

    if config.coordinator.channel_capacity < 1 {
        errors.push("coordinator.channel_capacity must be >= 1".to_string());
    }

    // Shorter limits would cut most multi-byte names to nothing
    if config.limits.max_name_len < 4 {
        errors.push("limits.max_name_len must be >= 4".to_string());
    }

    if let Err(e) = parse_log_level(&config.log.level) {
        errors.push(format!("log.level: {}", e));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Load the config file at `path`, falling back to defaults when it does not exist.
pub fn load_config(path: &Path) -> Result<GateConfig, GateError> {
    if !path.exists() {
        return Ok(GateConfig::default());
    }

    let contents = std::fs::read_to_string(path)
        .map_err(|e| GateError::Config(format!("Failed to read {}: {}", path.display(), e)))?;

    let config: GateConfig = toml::from_str(&contents)
        .map_err(|e| GateError::Config(format!("Failed to parse {}: {}", path.display(), e)))?;

    validate(&config).map_err(|errors| {
        GateError::Config(format!(
            "Config validation failed:\n{}",
            errors
                .iter()
                .map(|e| format!("  - {}", e))
                .collect::<Vec<_>>()
                .join("\n")
        ))
    })?;

    Ok(config)
}
