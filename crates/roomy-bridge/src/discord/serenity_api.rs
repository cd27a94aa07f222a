//! serenity-backed [`DiscordApi`] implementation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret as _;
use roomy_bridge_core::Timestamp;
use roomy_bridge_core::id::Snowflake;
use snafu::IntoError as _;
use serenity::all::{
    ChannelId, ChannelType, CreateChannel, CreateWebhook, EditChannel, EditWebhookMessage,
    ExecuteWebhook, GetMessages, GuildChannel, GuildId, Http, Message, MessageId, MessageType,
    ReactionType, Webhook, WebhookId,
};

use super::{
    ApiSnafu, AttachmentIn, AuthorIn, ChannelInfo, ChannelKind, DiscordApi, DiscordError,
    DiscordResult, MessageIn, ThreadPage, WebhookCredentials, WebhookInfo, WebhookMessage,
};

/// Fallback delay when Discord rate limits without a usable retry-after.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(2);

pub struct SerenityApi {
    http: Arc<Http>,
}

impl SerenityApi {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }

    async fn webhook(&self, credentials: &WebhookCredentials) -> DiscordResult<Webhook> {
        Webhook::from_id_with_token(
            &*self.http,
            WebhookId::new(credentials.id.get()),
            &credentials.token,
        )
        .await
        .map_err(map_error)
    }
}

fn map_error(err: serenity::Error) -> DiscordError {
    if let serenity::Error::Http(serenity::http::HttpError::UnsuccessfulRequest(response)) = &err {
        match response.status_code.as_u16() {
            404 => return DiscordError::NotFound,
            // serenity retries rate limits internally; surfacing one here
            // means the bucket is exhausted enough to back off for real.
            429 => {
                return DiscordError::RateLimited {
                    retry_after: DEFAULT_RETRY_AFTER,
                };
            }
            _ => {}
        }
    }
    ApiSnafu.into_error(Box::new(err))
}

fn channel_kind(kind: ChannelType) -> ChannelKind {
    match kind {
        ChannelType::Text | ChannelType::News => ChannelKind::Text,
        ChannelType::Category => ChannelKind::Category,
        ChannelType::PublicThread | ChannelType::NewsThread => ChannelKind::PublicThread,
        ChannelType::PrivateThread => ChannelKind::PrivateThread,
        _ => ChannelKind::Other,
    }
}

pub(crate) fn normalize_channel(channel: &GuildChannel) -> ChannelInfo {
    ChannelInfo {
        id: Snowflake::new(channel.id.get()),
        guild: Snowflake::new(channel.guild_id.get()),
        name: channel.name.clone(),
        kind: channel_kind(channel.kind),
        topic: channel.topic.clone(),
        parent: channel.parent_id.map(|id| Snowflake::new(id.get())),
    }
}

pub(crate) fn normalize_timestamp(ts: &serenity::model::Timestamp) -> Timestamp {
    Timestamp::from_millis((ts.unix_timestamp_nanos() / 1_000_000).max(0) as u64)
}

pub(crate) fn normalize_message(message: &Message) -> MessageIn {
    let author = AuthorIn {
        id: Snowflake::new(message.author.id.get()),
        username: message.author.name.clone(),
        global_name: message.author.global_name.clone(),
        discriminator: message.author.discriminator.map(|d| d.get()),
        avatar_url: message.author.avatar_url(),
        webhook_id: message.webhook_id.map(|id| Snowflake::new(id.get())),
        is_bot: message.author.bot,
    };

    MessageIn {
        id: Snowflake::new(message.id.get()),
        channel: Snowflake::new(message.channel_id.get()),
        guild: message.guild_id.map(|id| Snowflake::new(id.get())),
        author,
        content: message.content.clone(),
        timestamp: normalize_timestamp(&message.timestamp),
        edited_timestamp: message.edited_timestamp.as_ref().map(normalize_timestamp),
        attachments: message
            .attachments
            .iter()
            .map(|attachment| AttachmentIn {
                name: attachment.filename.clone(),
                url: attachment.url.clone(),
                mime: attachment.content_type.clone(),
            })
            .collect(),
        reply_to: message
            .message_reference
            .as_ref()
            .and_then(|reference| reference.message_id)
            .map(|id| Snowflake::new(id.get())),
        nonce: None,
        is_system: !matches!(
            message.kind,
            MessageType::Regular | MessageType::InlineReply
        ),
    }
}

fn reaction_type(emoji: &super::DiscordEmoji) -> ReactionType {
    match emoji {
        super::DiscordEmoji::Unicode(s) => ReactionType::Unicode(s.clone()),
        super::DiscordEmoji::Custom { name, id, animated } => ReactionType::Custom {
            animated: *animated,
            id: serenity::all::EmojiId::new(id.get()),
            name: Some(name.clone()),
        },
    }
}

#[async_trait]
impl DiscordApi for SerenityApi {
    async fn guild_channels(&self, guild: Snowflake) -> DiscordResult<Vec<ChannelInfo>> {
        let channels = GuildId::new(guild.get())
            .channels(&*self.http)
            .await
            .map_err(map_error)?;
        Ok(channels.values().map(normalize_channel).collect())
    }

    async fn active_threads(&self, guild: Snowflake) -> DiscordResult<Vec<ChannelInfo>> {
        let threads = GuildId::new(guild.get())
            .get_active_threads(&*self.http)
            .await
            .map_err(map_error)?;
        Ok(threads.threads.iter().map(normalize_channel).collect())
    }

    async fn archived_threads(
        &self,
        channel: Snowflake,
        before: Option<Timestamp>,
    ) -> DiscordResult<ThreadPage> {
        let data = ChannelId::new(channel.get())
            .get_archived_public_threads(
                &*self.http,
                before.map(|ts| ts.as_millis() / 1000),
                None,
            )
            .await
            .map_err(map_error)?;

        let next_before = if data.has_more {
            data.threads
                .iter()
                .filter_map(|thread| {
                    thread
                        .thread_metadata
                        .as_ref()
                        .and_then(|meta| meta.archive_timestamp.as_ref())
                        .map(normalize_timestamp)
                })
                .min()
        } else {
            None
        };

        Ok(ThreadPage {
            threads: data.threads.iter().map(normalize_channel).collect(),
            next_before,
        })
    }

    async fn messages_after(
        &self,
        channel: Snowflake,
        after: Option<Snowflake>,
        limit: usize,
    ) -> DiscordResult<Vec<MessageIn>> {
        let anchor = MessageId::new(after.map(Snowflake::get).unwrap_or(1).max(1));
        let builder = GetMessages::new().after(anchor).limit(limit.min(100) as u8);
        let mut messages = ChannelId::new(channel.get())
            .messages(&*self.http, builder)
            .await
            .map_err(map_error)?;
        // Discord returns newest-first; backfill wants oldest-first.
        messages.reverse();
        Ok(messages.iter().map(normalize_message).collect())
    }

    async fn recent_messages(
        &self,
        channel: Snowflake,
        limit: usize,
    ) -> DiscordResult<Vec<MessageIn>> {
        let builder = GetMessages::new().limit(limit.min(100) as u8);
        let messages = ChannelId::new(channel.get())
            .messages(&*self.http, builder)
            .await
            .map_err(map_error)?;
        Ok(messages.iter().map(normalize_message).collect())
    }

    async fn create_text_channel(
        &self,
        guild: Snowflake,
        name: &str,
        topic: &str,
    ) -> DiscordResult<ChannelInfo> {
        let channel = GuildId::new(guild.get())
            .create_channel(
                &*self.http,
                CreateChannel::new(name).kind(ChannelType::Text).topic(topic),
            )
            .await
            .map_err(map_error)?;
        Ok(normalize_channel(&channel))
    }

    async fn set_channel_topic(&self, channel: Snowflake, topic: &str) -> DiscordResult<()> {
        ChannelId::new(channel.get())
            .edit(&*self.http, EditChannel::new().topic(topic))
            .await
            .map_err(map_error)?;
        Ok(())
    }

    async fn send_message(&self, channel: Snowflake, content: &str) -> DiscordResult<Snowflake> {
        let message = ChannelId::new(channel.get())
            .say(&*self.http, content)
            .await
            .map_err(map_error)?;
        Ok(Snowflake::new(message.id.get()))
    }

    async fn pin_message(&self, channel: Snowflake, message: Snowflake) -> DiscordResult<()> {
        ChannelId::new(channel.get())
            .pin(&*self.http, MessageId::new(message.get()))
            .await
            .map_err(map_error)
    }

    async fn delete_message(&self, channel: Snowflake, message: Snowflake) -> DiscordResult<()> {
        ChannelId::new(channel.get())
            .delete_message(&*self.http, MessageId::new(message.get()))
            .await
            .map_err(map_error)
    }

    async fn add_reaction(
        &self,
        channel: Snowflake,
        message: Snowflake,
        emoji: &super::DiscordEmoji,
    ) -> DiscordResult<()> {
        ChannelId::new(channel.get())
            .create_reaction(
                &*self.http,
                MessageId::new(message.get()),
                reaction_type(emoji),
            )
            .await
            .map_err(map_error)
    }

    async fn remove_own_reaction(
        &self,
        channel: Snowflake,
        message: Snowflake,
        emoji: &super::DiscordEmoji,
    ) -> DiscordResult<()> {
        ChannelId::new(channel.get())
            .delete_reaction(
                &*self.http,
                MessageId::new(message.get()),
                None,
                reaction_type(emoji),
            )
            .await
            .map_err(map_error)
    }

    async fn channel_webhooks(&self, channel: Snowflake) -> DiscordResult<Vec<WebhookInfo>> {
        let webhooks = ChannelId::new(channel.get())
            .webhooks(&*self.http)
            .await
            .map_err(map_error)?;
        Ok(webhooks
            .into_iter()
            .map(|webhook| WebhookInfo {
                id: Snowflake::new(webhook.id.get()),
                token: webhook.token.map(|t| t.expose_secret().to_owned()),
                name: webhook.name,
            })
            .collect())
    }

    async fn create_webhook(
        &self,
        channel: Snowflake,
        name: &str,
    ) -> DiscordResult<WebhookCredentials> {
        let webhook = ChannelId::new(channel.get())
            .create_webhook(&*self.http, CreateWebhook::new(name))
            .await
            .map_err(map_error)?;
        let token = webhook.token.ok_or(DiscordError::NotFound)?;
        Ok(WebhookCredentials {
            id: Snowflake::new(webhook.id.get()),
            token,
        })
    }

    async fn execute_webhook(
        &self,
        credentials: &WebhookCredentials,
        message: &WebhookMessage,
    ) -> DiscordResult<Snowflake> {
        let webhook = self.webhook(credentials).await?;
        let mut builder = ExecuteWebhook::new()
            .content(&message.content)
            .username(&message.username);
        if let Some(avatar_url) = &message.avatar_url {
            builder = builder.avatar_url(avatar_url);
        }
        let sent = webhook
            .execute(&*self.http, true, builder)
            .await
            .map_err(map_error)?
            .ok_or(DiscordError::NotFound)?;
        Ok(Snowflake::new(sent.id.get()))
    }

    async fn edit_webhook_message(
        &self,
        credentials: &WebhookCredentials,
        message: Snowflake,
        content: &str,
    ) -> DiscordResult<()> {
        let webhook = self.webhook(credentials).await?;
        webhook
            .edit_message(
                &*self.http,
                MessageId::new(message.get()),
                EditWebhookMessage::new().content(content),
            )
            .await
            .map_err(map_error)?;
        Ok(())
    }
}
