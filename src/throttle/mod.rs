//! Per-use-case throttles for the starboard's event handlers.
//!
//! [`StarboardThrottles`] owns one registry per use case and is built once
//! at startup. Handlers share it through an `Arc` instead of reaching for
//! process-wide statics, and no two features ever share a key space.

mod messages;

pub use messages::{MessageApi, ThrottledMessages};

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::{CooldownConfig, RotationStrategy, StarguardConfig};
use crate::error::{Result, StarguardError};
use crate::ratelimit::{
    Admission, ChannelId, CommandKey, CommandLimits, GuildId, Limit, RegistryStats, Rotation,
    StarboardId, UserId, VoteKey, WindowedLimiterRegistry,
};

/// A mutation of a starboard message on the chat platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageOp {
    Send,
    Edit,
    Delete,
}

/// Per-starboard vote cooldown, as stored in the starboard's settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StarboardCooldownConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_cooldown_capacity")]
    pub capacity: u32,
    #[serde(default = "default_cooldown_period")]
    pub period_secs: f64,
}

impl Default for StarboardCooldownConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            capacity: default_cooldown_capacity(),
            period_secs: default_cooldown_period(),
        }
    }
}

fn default_cooldown_capacity() -> u32 {
    5
}

fn default_cooldown_period() -> f64 {
    6.0
}

/// Validated per-starboard vote cooldown.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StarboardCooldown {
    limit: Option<Limit>,
}

impl StarboardCooldown {
    pub fn disabled() -> Self {
        Self { limit: None }
    }

    pub fn enabled(limit: Limit) -> Self {
        Self { limit: Some(limit) }
    }

    pub fn limit(&self) -> Option<Limit> {
        self.limit
    }
}

impl TryFrom<StarboardCooldownConfig> for StarboardCooldown {
    type Error = StarguardError;

    fn try_from(config: StarboardCooldownConfig) -> Result<Self> {
        if !config.enabled {
            return Ok(Self::disabled());
        }
        Ok(Self::enabled(Limit::from_secs_f64(config.capacity, config.period_secs)?))
    }
}

/// Validated limits for every throttled event kind.
#[derive(Debug, Clone)]
pub struct ThrottleLimits {
    pub reaction_add: Limit,
    pub autostar: Limit,
    pub message_send: Limit,
    pub message_edit: Limit,
    pub message_delete: Limit,
    pub commands: CommandLimits,
    pub max_starboard_cooldown: Duration,
}

impl ThrottleLimits {
    pub fn from_config(config: &CooldownConfig) -> Result<Self> {
        let max_starboard_cooldown = Duration::try_from_secs_f64(config.max_starboard_cooldown_secs)
            .ok()
            .filter(|period| !period.is_zero())
            .ok_or_else(|| {
                StarguardError::Config(format!(
                    "max_starboard_cooldown_secs must be positive, got {}",
                    config.max_starboard_cooldown_secs
                ))
            })?;

        Ok(Self {
            reaction_add: Limit::try_from(config.reaction_add)?,
            autostar: Limit::try_from(config.autostar)?,
            message_send: Limit::try_from(config.message_send)?,
            message_edit: Limit::try_from(config.message_edit)?,
            message_delete: Limit::try_from(config.message_delete)?,
            commands: config.commands.compile()?,
            max_starboard_cooldown,
        })
    }

    pub fn message(&self, op: MessageOp) -> Limit {
        match op {
            MessageOp::Send => self.message_send,
            MessageOp::Edit => self.message_edit,
            MessageOp::Delete => self.message_delete,
        }
    }
}

/// Every admission-control registry the bot uses.
pub struct StarboardThrottles {
    limits: ThrottleLimits,
    reaction_add: WindowedLimiterRegistry<GuildId>,
    autostar: WindowedLimiterRegistry<ChannelId>,
    votes: WindowedLimiterRegistry<VoteKey>,
    commands: Arc<WindowedLimiterRegistry<CommandKey>>,
    message_send: WindowedLimiterRegistry<GuildId>,
    message_edit: WindowedLimiterRegistry<GuildId>,
    message_delete: WindowedLimiterRegistry<GuildId>,
}

/// Registries rotate every two periods of their longest limit, which keeps
/// a counter alive for as long as its previous bucket can still affect the
/// estimate.
fn twice(period: Duration, what: &str) -> Result<Duration> {
    period.checked_mul(2).ok_or_else(|| {
        StarguardError::Config(format!("{what} period of {period:?} is too large to rotate"))
    })
}

fn lazy_registry<K>(name: &'static str, limit: Limit) -> Result<WindowedLimiterRegistry<K>>
where
    K: Eq + Hash + Debug,
{
    let rotation = Rotation::Lazy {
        period: twice(limit.period(), name)?,
    };
    WindowedLimiterRegistry::new(name, rotation)
}

impl StarboardThrottles {
    pub fn new(config: &StarguardConfig) -> Result<Self> {
        let limits = ThrottleLimits::from_config(&config.cooldowns)?;

        let command_period = twice(limits.commands.max_period(), "commands")?;
        let command_rotation = match config.rotation.commands {
            RotationStrategy::Scheduled => Rotation::Scheduled {
                interval: command_period,
            },
            RotationStrategy::Lazy => Rotation::Lazy {
                period: command_period,
            },
        };

        let throttles = Self {
            reaction_add: lazy_registry("reaction_add", limits.reaction_add)?,
            autostar: lazy_registry("autostar", limits.autostar)?,
            votes: WindowedLimiterRegistry::new(
                "votes",
                Rotation::Lazy {
                    period: twice(limits.max_starboard_cooldown, "votes")?,
                },
            )?,
            commands: Arc::new(WindowedLimiterRegistry::new("commands", command_rotation)?),
            message_send: lazy_registry("message_send", limits.message_send)?,
            message_edit: lazy_registry("message_edit", limits.message_edit)?,
            message_delete: lazy_registry("message_delete", limits.message_delete)?,
            limits,
        };

        info!(
            command_rotation = ?command_rotation,
            "Starboard throttles initialized"
        );
        Ok(throttles)
    }

    /// Gate for an inbound reaction add/remove. A `false` means the event
    /// is dropped before any vote is recorded.
    pub fn allow_reaction(&self, guild: GuildId, now: Instant) -> bool {
        let allowed = self.reaction_add.trigger(guild, self.limits.reaction_add, now);
        if !allowed {
            debug!(guild = %guild, "Dropping reaction event");
        }
        allowed
    }

    /// Gate for evaluating a new message in an autostar channel.
    pub fn allow_autostar(&self, channel: ChannelId, now: Instant) -> bool {
        let allowed = self.autostar.trigger(channel, self.limits.autostar, now);
        if !allowed {
            debug!(channel = %channel, "Skipping autostar evaluation");
        }
        allowed
    }

    /// Whether a vote by `user` on `starboard` counts under that
    /// starboard's cooldown. Always `true` when the cooldown is disabled.
    ///
    /// Periods above the configured maximum are clamped to it, so vote
    /// counters never outlive their registry's rotation.
    pub fn allow_vote(
        &self,
        user: UserId,
        starboard: StarboardId,
        cooldown: &StarboardCooldown,
        now: Instant,
    ) -> bool {
        let Some(limit) = cooldown.limit() else {
            return true;
        };

        let limit = if limit.period() > self.limits.max_starboard_cooldown {
            Limit::new(limit.capacity(), self.limits.max_starboard_cooldown).unwrap_or(limit)
        } else {
            limit
        };

        self.votes.trigger(VoteKey::new(user, starboard), limit, now)
    }

    /// Command cooldown check. A limited result carries the wait to report
    /// back to the user.
    pub fn command_cooldown(&self, user: UserId, command: &str, now: Instant) -> Admission {
        let key = CommandKey::new(user, command);
        let limit = self.limits.commands.find_limit(&key.command);
        self.commands.acquire(key, limit, now)
    }

    /// Gate for an outbound starboard message mutation in `guild`.
    pub fn allow_message(&self, op: MessageOp, guild: GuildId, now: Instant) -> bool {
        let registry = match op {
            MessageOp::Send => &self.message_send,
            MessageOp::Edit => &self.message_edit,
            MessageOp::Delete => &self.message_delete,
        };
        registry.trigger(guild, self.limits.message(op), now)
    }

    /// Start background rotation for the registries configured for it.
    ///
    /// Fails outside a tokio runtime when any registry is scheduled.
    pub fn start_scheduled_rotation(&self) -> Result<Option<JoinHandle<()>>> {
        self.commands.spawn_scheduled_rotation()
    }

    pub fn stats(&self) -> Vec<RegistryStats> {
        vec![
            self.reaction_add.stats(),
            self.autostar.stats(),
            self.votes.stats(),
            self.commands.stats(),
            self.message_send.stats(),
            self.message_edit.stats(),
            self.message_delete.stats(),
        ]
    }
}

/// User-facing cooldown notice, rounded up to whole seconds.
pub fn retry_message(wait: Duration) -> String {
    let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
    match secs.max(1) {
        1 => "You're on cooldown, try again in 1 second.".to_string(),
        n => format!("You're on cooldown, try again in {} seconds.", n),
    }
}
