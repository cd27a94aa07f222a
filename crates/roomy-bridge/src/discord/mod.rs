//! Normalized Discord surface.
//!
//! Everything the sync engine needs from Discord goes through the
//! [`DiscordApi`] trait and the [`DiscordEvent`] enum; the serenity-backed
//! implementations live in [`gateway`] and [`serenity_api`] and nothing else
//! in the crate touches serenity types. Tests drive the engine with an
//! in-memory implementation.

mod emoji;
pub mod gateway;
pub mod serenity_api;

use std::time::Duration;

use async_trait::async_trait;
use roomy_bridge_core::Timestamp;
use roomy_bridge_core::error::BoxedError;
use roomy_bridge_core::id::Snowflake;
use snafu::{Location, Snafu};

pub use self::emoji::DiscordEmoji;

/// Name of the webhook the bridge maintains in each channel. The Discord API
/// limits named webhooks per channel, so there is exactly one.
pub const BRIDGE_WEBHOOK_NAME: &str = "Roomy Bridge";

#[derive(Debug, Snafu)]
pub enum DiscordError {
    /// The resource is gone (deleted webhook, missing channel/message).
    #[snafu(display("Discord resource not found"))]
    NotFound,
    #[snafu(display("Discord rate limit, retry after {retry_after:?}"))]
    RateLimited { retry_after: Duration },
    #[snafu(display("Discord API error: {source}"))]
    Api {
        source: BoxedError,
        #[snafu(implicit)]
        location: Location,
    },
}

pub type DiscordResult<T> = std::result::Result<T, DiscordError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Text,
    Category,
    PublicThread,
    PrivateThread,
    Other,
}

impl ChannelKind {
    pub fn is_thread(self) -> bool {
        matches!(self, ChannelKind::PublicThread | ChannelKind::PrivateThread)
    }
}

#[derive(Debug, Clone)]
pub struct ChannelInfo {
    pub id: Snowflake,
    pub guild: Snowflake,
    pub name: String,
    pub kind: ChannelKind,
    pub topic: Option<String>,
    /// Category for text channels, parent text channel for threads.
    pub parent: Option<Snowflake>,
}

#[derive(Debug, Clone)]
pub struct AuthorIn {
    pub id: Snowflake,
    pub username: String,
    pub global_name: Option<String>,
    pub discriminator: Option<u16>,
    pub avatar_url: Option<String>,
    /// Set when the message was posted through a webhook.
    pub webhook_id: Option<Snowflake>,
    pub is_bot: bool,
}

impl AuthorIn {
    /// `username#discriminator`, or the bare username for the new username
    /// system.
    pub fn handle(&self) -> String {
        match self.discriminator {
            Some(disc) => format!("{}#{disc:04}", self.username),
            None => self.username.clone(),
        }
    }

    pub fn display_name(&self) -> &str {
        self.global_name.as_deref().unwrap_or(&self.username)
    }
}

#[derive(Debug, Clone)]
pub struct AttachmentIn {
    pub name: String,
    pub url: String,
    pub mime: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MessageIn {
    pub id: Snowflake,
    pub channel: Snowflake,
    pub guild: Option<Snowflake>,
    pub author: AuthorIn,
    pub content: String,
    pub timestamp: Timestamp,
    pub edited_timestamp: Option<Timestamp>,
    pub attachments: Vec<AttachmentIn>,
    pub reply_to: Option<Snowflake>,
    /// Client-supplied idempotency token; only present on gateway deliveries
    /// and create responses, never on history fetches.
    pub nonce: Option<String>,
    /// Discord system messages (THREAD_CREATED, pins, boosts, ...) are never
    /// mirrored.
    pub is_system: bool,
}

impl MessageIn {
    pub fn attachment_urls(&self) -> Vec<String> {
        self.attachments.iter().map(|a| a.url.clone()).collect()
    }
}

#[derive(Debug, Clone)]
pub struct MessageUpdateIn {
    pub id: Snowflake,
    pub channel: Snowflake,
    pub guild: Option<Snowflake>,
    pub content: Option<String>,
    pub edited_timestamp: Option<Timestamp>,
    pub attachments: Option<Vec<AttachmentIn>>,
}

#[derive(Debug, Clone)]
pub struct ReactionIn {
    pub channel: Snowflake,
    pub message: Snowflake,
    pub user: Snowflake,
    pub guild: Option<Snowflake>,
    pub emoji: DiscordEmoji,
}

/// A normalized gateway event, already scoped to a guild by the router.
#[derive(Debug, Clone)]
pub enum DiscordEvent {
    ChannelCreate(ChannelInfo),
    ThreadCreate(ChannelInfo),
    MessageCreate(MessageIn),
    MessageUpdate(MessageUpdateIn),
    MessageDelete {
        channel: Snowflake,
        message: Snowflake,
    },
    ReactionAdd(ReactionIn),
    ReactionRemove(ReactionIn),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookCredentials {
    pub id: Snowflake,
    pub token: String,
}

#[derive(Debug, Clone)]
pub struct WebhookInfo {
    pub id: Snowflake,
    pub token: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WebhookMessage {
    pub content: String,
    pub username: String,
    pub avatar_url: Option<String>,
    /// ULID-prefix idempotency token. Discord's webhook-execute endpoint has
    /// no nonce parameter, so delivery dedup rests on the nonce mapping and
    /// the content-hash index; the field rides along for bookkeeping.
    pub nonce: String,
}

/// One page of archived threads. `next_before` is the anchor for the next
/// page; `None` means the listing is exhausted.
#[derive(Debug, Clone)]
pub struct ThreadPage {
    pub threads: Vec<ChannelInfo>,
    pub next_before: Option<Timestamp>,
}

/// The exact REST surface the bridge consumes.
#[async_trait]
pub trait DiscordApi: Send + Sync {
    async fn guild_channels(&self, guild: Snowflake) -> DiscordResult<Vec<ChannelInfo>>;

    async fn active_threads(&self, guild: Snowflake) -> DiscordResult<Vec<ChannelInfo>>;

    async fn archived_threads(
        &self,
        channel: Snowflake,
        before: Option<Timestamp>,
    ) -> DiscordResult<ThreadPage>;

    /// Up to `limit` messages strictly after `after`, oldest first. `None`
    /// starts from the beginning of the channel.
    async fn messages_after(
        &self,
        channel: Snowflake,
        after: Option<Snowflake>,
        limit: usize,
    ) -> DiscordResult<Vec<MessageIn>>;

    /// The newest `limit` messages of the channel.
    async fn recent_messages(
        &self,
        channel: Snowflake,
        limit: usize,
    ) -> DiscordResult<Vec<MessageIn>>;

    async fn create_text_channel(
        &self,
        guild: Snowflake,
        name: &str,
        topic: &str,
    ) -> DiscordResult<ChannelInfo>;

    async fn set_channel_topic(&self, channel: Snowflake, topic: &str) -> DiscordResult<()>;

    async fn send_message(&self, channel: Snowflake, content: &str) -> DiscordResult<Snowflake>;

    async fn pin_message(&self, channel: Snowflake, message: Snowflake) -> DiscordResult<()>;

    async fn delete_message(&self, channel: Snowflake, message: Snowflake) -> DiscordResult<()>;

    async fn add_reaction(
        &self,
        channel: Snowflake,
        message: Snowflake,
        emoji: &DiscordEmoji,
    ) -> DiscordResult<()>;

    async fn remove_own_reaction(
        &self,
        channel: Snowflake,
        message: Snowflake,
        emoji: &DiscordEmoji,
    ) -> DiscordResult<()>;

    async fn channel_webhooks(&self, channel: Snowflake) -> DiscordResult<Vec<WebhookInfo>>;

    async fn create_webhook(
        &self,
        channel: Snowflake,
        name: &str,
    ) -> DiscordResult<WebhookCredentials>;

    /// Execute a webhook, returning the created message id.
    async fn execute_webhook(
        &self,
        credentials: &WebhookCredentials,
        message: &WebhookMessage,
    ) -> DiscordResult<Snowflake>;

    async fn edit_webhook_message(
        &self,
        credentials: &WebhookCredentials,
        message: Snowflake,
        content: &str,
    ) -> DiscordResult<()>;
}
