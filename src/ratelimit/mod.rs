//! Sliding window rate limiting with generational eviction.

mod counter;
mod keys;
mod limiter;
mod rules;

pub use counter::{Limit, LimitConfig, SlidingWindowCounter};
pub use keys::{ChannelId, CommandKey, GuildId, MessageId, StarboardId, UserId, VoteKey};
pub use limiter::{Admission, CounterTable, RegistryStats, Rotation, WindowedLimiterRegistry};
pub use rules::{CommandLimits, CooldownRules};
