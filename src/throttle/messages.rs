//! Throttled access to the chat platform's message API.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::warn;

use super::{MessageOp, StarboardThrottles};
use crate::error::Result;
use crate::ratelimit::{ChannelId, GuildId, MessageId};

/// The platform calls used to maintain starboard messages.
#[async_trait]
pub trait MessageApi: Send + Sync {
    /// Post a new message and return its id.
    async fn send(&self, guild: GuildId, channel: ChannelId, content: &str) -> Result<MessageId>;

    async fn edit(
        &self,
        guild: GuildId,
        channel: ChannelId,
        message: MessageId,
        content: &str,
    ) -> Result<()>;

    async fn delete(&self, guild: GuildId, channel: ChannelId, message: MessageId) -> Result<()>;
}

/// Wraps a [`MessageApi`] so that every call first passes the per-guild
/// throttle for its operation.
///
/// A throttled call is not sent and yields `Ok(None)`. The admission check
/// completes before the API call is awaited, so no lock is held across it.
pub struct ThrottledMessages<A> {
    api: A,
    throttles: Arc<StarboardThrottles>,
}

impl<A: MessageApi> ThrottledMessages<A> {
    pub fn new(api: A, throttles: Arc<StarboardThrottles>) -> Self {
        Self { api, throttles }
    }

    pub async fn send(
        &self,
        guild: GuildId,
        channel: ChannelId,
        content: &str,
    ) -> Result<Option<MessageId>> {
        self.send_at(Instant::now(), guild, channel, content).await
    }

    pub async fn send_at(
        &self,
        now: Instant,
        guild: GuildId,
        channel: ChannelId,
        content: &str,
    ) -> Result<Option<MessageId>> {
        if !self.admit(MessageOp::Send, guild, now) {
            return Ok(None);
        }
        self.api.send(guild, channel, content).await.map(Some)
    }

    pub async fn edit(
        &self,
        guild: GuildId,
        channel: ChannelId,
        message: MessageId,
        content: &str,
    ) -> Result<Option<()>> {
        self.edit_at(Instant::now(), guild, channel, message, content).await
    }

    pub async fn edit_at(
        &self,
        now: Instant,
        guild: GuildId,
        channel: ChannelId,
        message: MessageId,
        content: &str,
    ) -> Result<Option<()>> {
        if !self.admit(MessageOp::Edit, guild, now) {
            return Ok(None);
        }
        self.api.edit(guild, channel, message, content).await.map(Some)
    }

    pub async fn delete(
        &self,
        guild: GuildId,
        channel: ChannelId,
        message: MessageId,
    ) -> Result<Option<()>> {
        self.delete_at(Instant::now(), guild, channel, message).await
    }

    pub async fn delete_at(
        &self,
        now: Instant,
        guild: GuildId,
        channel: ChannelId,
        message: MessageId,
    ) -> Result<Option<()>> {
        if !self.admit(MessageOp::Delete, guild, now) {
            return Ok(None);
        }
        self.api.delete(guild, channel, message).await.map(Some)
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    fn admit(&self, op: MessageOp, guild: GuildId, now: Instant) -> bool {
        let allowed = self.throttles.allow_message(op, guild, now);
        if !allowed {
            warn!(guild = %guild, op = ?op, "Starboard message call throttled");
        }
        allowed
    }
}
