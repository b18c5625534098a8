//! Identifiers used as rate limit keys.
//!
//! Each registry has its own key space. Composite keys are plain structs,
//! so `(user, starboard)` and `(user, command)` never collide with
//! single-id keys.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! snowflake {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

snowflake!(
    /// A guild (server).
    GuildId
);
snowflake!(
    /// A channel within a guild.
    ChannelId
);
snowflake!(
    /// A user.
    UserId
);
snowflake!(
    /// A starboard configured in some guild.
    StarboardId
);
snowflake!(
    /// A message posted on the chat platform.
    MessageId
);

/// Key for per-(user, starboard) vote cooldowns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VoteKey {
    pub user: UserId,
    pub starboard: StarboardId,
}

impl VoteKey {
    pub fn new(user: UserId, starboard: StarboardId) -> Self {
        Self { user, starboard }
    }
}

impl fmt::Display for VoteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vote:{}:{}", self.user, self.starboard)
    }
}

/// Key for per-(user, command) cooldowns.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommandKey {
    pub user: UserId,
    pub command: String,
}

impl CommandKey {
    /// Command names are matched case-insensitively.
    pub fn new(user: UserId, command: &str) -> Self {
        Self {
            user,
            command: command.trim().to_ascii_lowercase(),
        }
    }
}

impl fmt::Display for CommandKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "command:{}:{}", self.user, self.command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snowflake_display() {
        assert_eq!(GuildId(42).to_string(), "42");
        assert_eq!(UserId::from(7).0, 7);
    }

    #[test]
    fn test_command_key_normalizes_name() {
        let a = CommandKey::new(UserId(1), "Refresh-Roles ");
        let b = CommandKey::new(UserId(1), "refresh-roles");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "command:1:refresh-roles");
    }

    #[test]
    fn test_vote_key_equality() {
        let key1 = VoteKey::new(UserId(1), StarboardId(2));
        let key2 = VoteKey::new(UserId(1), StarboardId(2));
        let key3 = VoteKey::new(UserId(2), StarboardId(1));

        assert_eq!(key1, key2);
        assert_ne!(key1, key3);
        assert_eq!(key1.to_string(), "vote:1:2");
    }

    #[test]
    fn test_snowflake_serde_is_transparent() {
        let id: GuildId = serde_json::from_str("123").unwrap();
        assert_eq!(id, GuildId(123));
        assert_eq!(serde_json::to_string(&id).unwrap(), "123");
    }
}
