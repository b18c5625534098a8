//! Configuration management for Starguard.
//!
//! Configuration is layered: built-in defaults, then an optional YAML file,
//! then `STARGUARD__*` environment variables (for example
//! `STARGUARD__COOLDOWNS__REACTION_ADD__CAPACITY=50`).

use serde::{Deserialize, Serialize};

use crate::error::{Result, StarguardError};
use crate::ratelimit::{CooldownRules, LimitConfig};

/// Main configuration for Starguard.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StarguardConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Cooldowns for each throttled event kind
    #[serde(default)]
    pub cooldowns: CooldownConfig,

    /// Rotation strategy overrides
    #[serde(default)]
    pub rotation: RotationConfig,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Cooldowns for each throttled event kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CooldownConfig {
    /// Reaction add/remove events, per guild
    #[serde(default = "default_reaction_add")]
    pub reaction_add: LimitConfig,

    /// Autostar evaluations, per channel
    #[serde(default = "default_autostar")]
    pub autostar: LimitConfig,

    /// Starboard message sends, per guild
    #[serde(default = "default_message_op")]
    pub message_send: LimitConfig,

    /// Starboard message edits, per guild
    #[serde(default = "default_message_op")]
    pub message_edit: LimitConfig,

    /// Starboard message deletes, per guild
    #[serde(default = "default_message_op")]
    pub message_delete: LimitConfig,

    /// Command cooldowns, per user and command
    #[serde(default)]
    pub commands: CooldownRules,

    /// Upper bound for user-configured per-starboard cooldown periods
    #[serde(default = "default_max_starboard_cooldown")]
    pub max_starboard_cooldown_secs: f64,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            reaction_add: default_reaction_add(),
            autostar: default_autostar(),
            message_send: default_message_op(),
            message_edit: default_message_op(),
            message_delete: default_message_op(),
            commands: CooldownRules::default(),
            max_starboard_cooldown_secs: default_max_starboard_cooldown(),
        }
    }
}

fn default_reaction_add() -> LimitConfig {
    LimitConfig::new(25, 5.0)
}

fn default_autostar() -> LimitConfig {
    LimitConfig::new(10, 10.0)
}

fn default_message_op() -> LimitConfig {
    LimitConfig::new(5, 5.0)
}

fn default_max_starboard_cooldown() -> f64 {
    600.0
}

/// How the command cooldown registry rotates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RotationStrategy {
    /// Background task, every twice the longest command period
    #[default]
    Scheduled,
    /// Checked on access
    Lazy,
}

/// Rotation configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RotationConfig {
    /// Strategy for the command cooldown registry. Every other registry
    /// rotates lazily.
    #[serde(default)]
    pub commands: RotationStrategy,
}

impl StarguardConfig {
    /// Load configuration from an optional file plus the environment.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("STARGUARD")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| StarguardError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Render the configuration as YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| StarguardError::Config(format!("Failed to render configuration: {}", e)))
    }
}
