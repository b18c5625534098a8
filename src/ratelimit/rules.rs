//! Command cooldown rules.
//!
//! Every command shares a default cooldown unless it has a named override.
//! Names are matched case-insensitively, the same way [`CommandKey`]
//! normalizes them.
//!
//! [`CommandKey`]: super::keys::CommandKey

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::counter::{Limit, LimitConfig};
use crate::error::{Result, StarguardError};

/// Cooldown rules as written in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CooldownRules {
    /// Cooldown applied to commands without an override
    #[serde(default = "default_command_limit")]
    pub default: LimitConfig,
    /// Per-command overrides, keyed by command name
    #[serde(default = "default_command_overrides")]
    pub commands: HashMap<String, LimitConfig>,
}

impl Default for CooldownRules {
    fn default() -> Self {
        Self {
            default: default_command_limit(),
            commands: default_command_overrides(),
        }
    }
}

fn default_command_limit() -> LimitConfig {
    LimitConfig::new(3, 10.0)
}

fn default_command_overrides() -> HashMap<String, LimitConfig> {
    HashMap::from([("refresh-roles".to_string(), LimitConfig::new(1, 600.0))])
}

impl CooldownRules {
    /// Parse rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| StarguardError::Config(format!("Failed to parse cooldown rules: {}", e)))
    }

    /// Validate every rule into a [`CommandLimits`] table.
    pub fn compile(&self) -> Result<CommandLimits> {
        let default = Limit::try_from(self.default)?;
        let overrides = self
            .commands
            .iter()
            .map(|(name, config)| {
                let limit = Limit::try_from(*config).map_err(|e| {
                    StarguardError::Config(format!("cooldown for command '{}': {}", name, e))
                })?;
                Ok((name.trim().to_ascii_lowercase(), limit))
            })
            .collect::<Result<HashMap<_, _>>>()?;

        info!(
            overrides = overrides.len(),
            default_capacity = default.capacity(),
            "Compiled command cooldown rules"
        );

        Ok(CommandLimits { default, overrides })
    }
}

/// Validated command cooldowns.
#[derive(Debug, Clone)]
pub struct CommandLimits {
    default: Limit,
    overrides: HashMap<String, Limit>,
}

impl CommandLimits {
    /// The limit for `command`, falling back to the default.
    pub fn find_limit(&self, command: &str) -> Limit {
        self.overrides
            .get(command)
            .or_else(|| self.overrides.get(command.trim().to_ascii_lowercase().as_str()))
            .copied()
            .unwrap_or(self.default)
    }

    /// Longest period of any rule. Scheduled rotation for command
    /// cooldowns runs at twice this.
    pub fn max_period(&self) -> Duration {
        self.overrides
            .values()
            .map(Limit::period)
            .fold(self.default.period(), Duration::max)
    }
}
