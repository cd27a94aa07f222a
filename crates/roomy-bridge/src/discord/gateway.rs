//! serenity gateway handler: normalizes events and routes them to the
//! bridge, registers the slash commands at ready, and answers the operator
//! surface (`/connect`, `/disconnect`, `/info`).

use std::sync::{Arc, OnceLock};

use roomy_bridge_core::error::FmtCompact as _;
use roomy_bridge_core::id::Snowflake;
use serenity::all::{
    ChannelId, Client, CommandOptionType, Context, CreateCommand, CreateCommandOption,
    CreateInteractionResponse, CreateInteractionResponseMessage, EventHandler, GatewayIntents,
    GuildChannel, GuildId, Interaction, Message, MessageId, MessageUpdateEvent, Reaction,
    ReactionType, Ready, ResolvedValue,
};
use tracing::{debug, error, info, warn};

use super::serenity_api::{normalize_channel, normalize_message, normalize_timestamp};
use super::{AttachmentIn, DiscordEmoji, DiscordEvent, MessageUpdateIn, ReactionIn};
use crate::registry::Bridge;

const LOG_TARGET: &str = "bridge::gateway";

pub fn intents() -> GatewayIntents {
    GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT
        | GatewayIntents::GUILD_MESSAGE_REACTIONS
}

pub async fn build_client(token: &str, handler: Handler) -> serenity::Result<Client> {
    Client::builder(token, intents()).event_handler(handler).await
}

/// Forwards normalized events into the bridge. The bridge is injected after
/// the serenity client is built (it needs the client's `Http` handle), hence
/// the cell.
pub struct Handler {
    bridge: Arc<OnceLock<Arc<Bridge>>>,
}

impl Handler {
    pub fn new(bridge: Arc<OnceLock<Arc<Bridge>>>) -> Self {
        Self { bridge }
    }

    fn bridge(&self) -> Option<&Arc<Bridge>> {
        self.bridge.get()
    }

    async fn route(&self, guild: Option<GuildId>, event: DiscordEvent) {
        let Some(bridge) = self.bridge() else {
            return;
        };
        let Some(guild) = guild else {
            // DMs and ephemeral contexts are never bridged.
            return;
        };
        bridge.route_event(Snowflake::new(guild.get()), event).await;
    }

    fn normalize_reaction(reaction: &Reaction) -> Option<ReactionIn> {
        let user = reaction.user_id?;
        let emoji = match &reaction.emoji {
            ReactionType::Unicode(s) => DiscordEmoji::Unicode(s.clone()),
            ReactionType::Custom { animated, id, name } => DiscordEmoji::Custom {
                name: name.clone().unwrap_or_default(),
                id: Snowflake::new(id.get()),
                animated: *animated,
            },
            _ => return None,
        };
        Some(ReactionIn {
            channel: Snowflake::new(reaction.channel_id.get()),
            message: Snowflake::new(reaction.message_id.get()),
            user: Snowflake::new(user.get()),
            guild: reaction.guild_id.map(|id| Snowflake::new(id.get())),
            emoji,
        })
    }
}

fn commands() -> Vec<CreateCommand> {
    vec![
        CreateCommand::new("connect")
            .description("Bridge this guild to a Roomy space")
            .add_option(
                CreateCommandOption::new(
                    CommandOptionType::String,
                    "space",
                    "Roomy space URL or DID",
                )
                .required(true),
            ),
        CreateCommand::new("disconnect").description("Remove this guild's Roomy bridge"),
        CreateCommand::new("info").description("Show the bridge status for this guild"),
    ]
}

#[serenity::async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!(target: LOG_TARGET, user = %ready.user.name, guilds = ready.guilds.len(), "Gateway ready");

        if let Some(bridge) = self.bridge() {
            bridge.set_app_id(Snowflake::new(ready.application.id.get()));
        }

        if let Err(err) = serenity::all::Command::set_global_commands(&ctx.http, commands()).await
        {
            error!(target: LOG_TARGET, err = %err.fmt_compact(), "Slash command registration failed");
        }
    }

    async fn channel_create(&self, _ctx: Context, channel: GuildChannel) {
        let info = normalize_channel(&channel);
        self.route(Some(channel.guild_id), DiscordEvent::ChannelCreate(info))
            .await;
    }

    async fn thread_create(&self, _ctx: Context, thread: GuildChannel) {
        let info = normalize_channel(&thread);
        self.route(Some(thread.guild_id), DiscordEvent::ThreadCreate(info))
            .await;
    }

    async fn message(&self, _ctx: Context, message: Message) {
        let mut normalized = normalize_message(&message);
        normalized.nonce = message.nonce.as_ref().map(|nonce| match nonce {
            serenity::all::Nonce::String(s) => s.clone(),
            serenity::all::Nonce::Number(n) => n.to_string(),
        });
        self.route(message.guild_id, DiscordEvent::MessageCreate(normalized))
            .await;
    }

    async fn message_update(
        &self,
        _ctx: Context,
        _old_if_available: Option<Message>,
        new: Option<Message>,
        event: MessageUpdateEvent,
    ) {
        let update = match new {
            Some(message) => MessageUpdateIn {
                id: Snowflake::new(message.id.get()),
                channel: Snowflake::new(message.channel_id.get()),
                guild: message.guild_id.map(|id| Snowflake::new(id.get())),
                content: Some(message.content.clone()),
                edited_timestamp: message.edited_timestamp.as_ref().map(normalize_timestamp),
                attachments: Some(
                    message
                        .attachments
                        .iter()
                        .map(|attachment| AttachmentIn {
                            name: attachment.filename.clone(),
                            url: attachment.url.clone(),
                            mime: attachment.content_type.clone(),
                        })
                        .collect(),
                ),
            },
            None => MessageUpdateIn {
                id: Snowflake::new(event.id.get()),
                channel: Snowflake::new(event.channel_id.get()),
                guild: event.guild_id.map(|id| Snowflake::new(id.get())),
                content: event.content.clone(),
                edited_timestamp: event.edited_timestamp.as_ref().map(normalize_timestamp),
                attachments: event.attachments.as_ref().map(|attachments| {
                    attachments
                        .iter()
                        .map(|attachment| AttachmentIn {
                            name: attachment.filename.clone(),
                            url: attachment.url.clone(),
                            mime: attachment.content_type.clone(),
                        })
                        .collect()
                }),
            },
        };
        let guild = update.guild.map(|id| GuildId::new(id.get()));
        self.route(guild, DiscordEvent::MessageUpdate(update)).await;
    }

    async fn message_delete(
        &self,
        _ctx: Context,
        channel_id: ChannelId,
        deleted_message_id: MessageId,
        guild_id: Option<GuildId>,
    ) {
        self.route(
            guild_id,
            DiscordEvent::MessageDelete {
                channel: Snowflake::new(channel_id.get()),
                message: Snowflake::new(deleted_message_id.get()),
            },
        )
        .await;
    }

    async fn reaction_add(&self, _ctx: Context, reaction: Reaction) {
        let Some(normalized) = Self::normalize_reaction(&reaction) else {
            return;
        };
        self.route(reaction.guild_id, DiscordEvent::ReactionAdd(normalized))
            .await;
    }

    async fn reaction_remove(&self, _ctx: Context, reaction: Reaction) {
        let Some(normalized) = Self::normalize_reaction(&reaction) else {
            return;
        };
        self.route(reaction.guild_id, DiscordEvent::ReactionRemove(normalized))
            .await;
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        let Interaction::Command(command) = interaction else {
            return;
        };
        let Some(bridge) = self.bridge() else {
            return;
        };
        let Some(guild_id) = command.guild_id else {
            return;
        };
        let guild = Snowflake::new(guild_id.get());

        let reply = match command.data.name.as_str() {
            "connect" => {
                let space = command.data.options().into_iter().find_map(|option| {
                    (option.name == "space").then(|| match option.value {
                        ResolvedValue::String(s) => Some(s.to_owned()),
                        _ => None,
                    })?
                });
                match space {
                    Some(space) => bridge.connect(guild, &space).await,
                    None => "Missing the `space` option.".to_owned(),
                }
            }
            "disconnect" => bridge.disconnect(guild).await,
            "info" => bridge.info(guild).await,
            other => {
                debug!(target: LOG_TARGET, command = other, "Unknown command");
                return;
            }
        };

        let response = CreateInteractionResponse::Message(
            CreateInteractionResponseMessage::new().content(reply),
        );
        if let Err(err) = command.create_response(&ctx.http, response).await {
            warn!(target: LOG_TARGET, err = %err.fmt_compact(), "Command response failed");
        }
    }
}
