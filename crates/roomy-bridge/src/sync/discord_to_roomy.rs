//! Discord -> Roomy translators.
//!
//! Every emitted event carries a Discord-origin extension naming the guild
//! and the mirrored snowflakes, which is what keeps it from being echoed
//! back by the other direction.

use std::collections::BTreeMap;

use roomy_bridge_core::event::{
    Attachment, Attachments, AuthorOverride, CreateMessage, CreateRoom, CreateRoomLink,
    DeleteMessage, DiscordMessageOrigin, DiscordReactionOrigin, DiscordRoomLinkOrigin,
    DiscordRoomOrigin, DiscordSidebarOrigin, DiscordUserOrigin, EditMessage, EventKind,
    RoomyEvent, SidebarCategory, TimestampOverride, UpdateProfile, UpdateSidebar, ext,
};
use roomy_bridge_core::id::{Did, Snowflake, Ulid};
use roomy_bridge_core::{fingerprint, marker};
use roomy_bridge_db::{BridgeDb, EditInfoRecord, MappingKind};
use roomy_bridge_leaf::EventBatcher;
use snafu::ResultExt as _;
use tracing::{debug, instrument};

use super::{
    DbSnafu, DiscordSnafu, LeafSnafu, SyncOutcome, SyncResult, reaction_key,
    register_mapping_idempotent, room_link_key,
};
use crate::context::GuildContext;
use crate::discord::{
    AuthorIn, ChannelInfo, ChannelKind, DiscordEvent, MessageIn, MessageUpdateIn, ReactionIn,
};

const LOG_TARGET: &str = "bridge::sync::d2r";

/// How many recent thread messages to scan for a pinned room URL.
const THREAD_MARKER_SCAN: usize = 50;

/// Live entry point for a normalized gateway event.
#[instrument(name = "sync.discord_to_roomy", skip_all, fields(guild = %ctx.guild()))]
pub async fn apply_event(ctx: &GuildContext, event: &DiscordEvent) -> SyncResult<SyncOutcome> {
    match event {
        DiscordEvent::ChannelCreate(channel) => channel_create(ctx, channel).await,
        DiscordEvent::ThreadCreate(thread) => thread_create(ctx, thread).await,
        DiscordEvent::MessageCreate(message) => {
            // Threshold 1: live messages flush as they are pushed.
            let mut batcher =
                EventBatcher::with_threshold(ctx.leaf.clone(), ctx.binding.space.clone(), 1);
            let pair = message_create(ctx, message, &mut batcher).await?;
            batcher.flush().await.context(LeafSnafu)?;
            match pair {
                Some((discord_id, roomy_id)) => {
                    register_mapping_idempotent(ctx, MappingKind::Message, discord_id, roomy_id)
                        .await?;
                    ctx.db
                        .set_latest_seen(&ctx.binding, message.channel, message.id)
                        .await
                        .context(DbSnafu)?;
                    Ok(SyncOutcome::Applied)
                }
                None => Ok(SyncOutcome::Skipped),
            }
        }
        DiscordEvent::MessageUpdate(update) => message_update(ctx, update).await,
        DiscordEvent::MessageDelete { channel, message } => {
            message_delete(ctx, *channel, *message).await
        }
        DiscordEvent::ReactionAdd(reaction) => reaction_add(ctx, reaction).await,
        DiscordEvent::ReactionRemove(reaction) => reaction_remove(ctx, reaction).await,
    }
}

/// Adopt or create the Roomy room for a Discord text channel.
///
/// Adoption order: an existing mapping wins (re-asserting the topic marker
/// if a topic edit wiped it), then a topic marker, then a fresh
/// `createRoom`.
pub async fn channel_create(ctx: &GuildContext, channel: &ChannelInfo) -> SyncResult<SyncOutcome> {
    if channel.kind.is_thread() {
        return thread_create(ctx, channel).await;
    }
    if channel.kind != ChannelKind::Text {
        return Ok(SyncOutcome::Skipped);
    }

    let room_key = MappingKind::Room.discord_key(channel.id);
    let topic = channel.topic.clone().unwrap_or_default();

    if let Some(room) = ctx
        .db
        .get_roomy_id(&ctx.binding, &room_key)
        .await
        .context(DbSnafu)?
    {
        if marker::extract(&topic) != Some(room) {
            let restored = marker::add(&topic, room);
            ctx.discord
                .set_channel_topic(channel.id, &restored)
                .await
                .context(DiscordSnafu)?;
        }
        return Ok(SyncOutcome::Skipped);
    }

    if let Some(room) = marker::extract(&topic) {
        debug!(target: LOG_TARGET, channel = %channel.id, %room, "Adopting marked channel");
        register_mapping_idempotent(ctx, MappingKind::Room, channel.id, room).await?;
        return Ok(SyncOutcome::Applied);
    }

    let event = RoomyEvent::new(EventKind::CreateRoom(CreateRoom {
        name: channel.name.clone(),
    }))
    .with_extension(
        ext::DISCORD_ORIGIN,
        &DiscordRoomOrigin {
            snowflake: channel.id,
            guild_id: ctx.guild(),
        },
    );
    let room = event.id;

    ctx.send_event(event).await.context(LeafSnafu)?;
    register_mapping_idempotent(ctx, MappingKind::Room, channel.id, room).await?;

    let marked = marker::add(&topic, room);
    ctx.discord
        .set_channel_topic(channel.id, &marked)
        .await
        .context(DiscordSnafu)?;

    debug!(target: LOG_TARGET, channel = %channel.id, %room, "Created room for channel");
    Ok(SyncOutcome::Applied)
}

/// Threads have no topic; a pinned starter message carrying the canonical
/// room URL plays the marker's role.
pub async fn thread_create(ctx: &GuildContext, thread: &ChannelInfo) -> SyncResult<SyncOutcome> {
    let room_key = MappingKind::Room.discord_key(thread.id);
    if ctx
        .db
        .get_roomy_id(&ctx.binding, &room_key)
        .await
        .context(DbSnafu)?
        .is_some()
    {
        return Ok(SyncOutcome::Skipped);
    }

    let recent = ctx
        .discord
        .recent_messages(thread.id, THREAD_MARKER_SCAN)
        .await
        .context(DiscordSnafu)?;
    for message in &recent {
        if let Some((space, room)) = marker::extract_room_url(&message.content) {
            if space == ctx.binding.space {
                debug!(target: LOG_TARGET, thread = %thread.id, %room, "Adopting marked thread");
                register_mapping_idempotent(ctx, MappingKind::Room, thread.id, room).await?;
                return Ok(SyncOutcome::Applied);
            }
        }
    }

    let event = RoomyEvent::new(EventKind::CreateRoom(CreateRoom {
        name: thread.name.clone(),
    }))
    .with_extension(
        ext::DISCORD_ORIGIN,
        &DiscordRoomOrigin {
            snowflake: thread.id,
            guild_id: ctx.guild(),
        },
    );
    let room = event.id;

    ctx.send_event(event).await.context(LeafSnafu)?;
    register_mapping_idempotent(ctx, MappingKind::Room, thread.id, room).await?;

    let url = marker::room_url(&ctx.binding.space, room);
    let starter = ctx
        .discord
        .send_message(thread.id, &url)
        .await
        .context(DiscordSnafu)?;
    ctx.discord
        .pin_message(thread.id, starter)
        .await
        .context(DiscordSnafu)?;

    if let Some(parent) = thread.parent {
        let parent_key = MappingKind::Room.discord_key(parent);
        if let Some(parent_room) = ctx
            .db
            .get_roomy_id(&ctx.binding, &parent_key)
            .await
            .context(DbSnafu)?
        {
            room_link(ctx, parent_room, parent, room, thread.id).await?;
        }
    }

    debug!(target: LOG_TARGET, thread = %thread.id, %room, "Created room for thread");
    Ok(SyncOutcome::Applied)
}

async fn room_link(
    ctx: &GuildContext,
    parent_room: Ulid,
    parent_channel: Snowflake,
    child_room: Ulid,
    child_channel: Snowflake,
) -> SyncResult<SyncOutcome> {
    let key = room_link_key(parent_room, child_room);
    if ctx
        .db
        .room_link_id(&ctx.binding, &key)
        .await
        .context(DbSnafu)?
        .is_some()
    {
        return Ok(SyncOutcome::Skipped);
    }

    let event = RoomyEvent::new(EventKind::CreateRoomLink(CreateRoomLink {
        parent: parent_room,
        child: child_room,
    }))
    .with_extension(
        ext::DISCORD_ROOM_LINK_ORIGIN,
        &DiscordRoomLinkOrigin {
            guild_id: ctx.guild(),
            parent_channel_id: parent_channel,
            child_channel_id: child_channel,
        },
    );
    let event_id = event.id;

    ctx.send_event(event).await.context(LeafSnafu)?;
    ctx.db
        .write_with(|tx| BridgeDb::set_room_link_id_tx(tx, &ctx.binding, &key, event_id))
        .await
        .context(DbSnafu)?;
    Ok(SyncOutcome::Applied)
}

/// Translate one Discord message into a `createMessage`, pushing it (and an
/// opportunistic profile update) into the caller's batcher.
///
/// Returns the `(snowflake, roomy id)` pair to register once the batch has
/// been flushed, or `None` when a skip gate fired: own-webhook authorship,
/// system messages, an existing mapping, or an unsynced channel.
pub async fn message_create(
    ctx: &GuildContext,
    message: &MessageIn,
    batcher: &mut EventBatcher,
) -> SyncResult<Option<(Snowflake, Ulid)>> {
    if let Some(webhook_id) = message.author.webhook_id {
        if ctx.webhooks.is_own_webhook(webhook_id).await {
            return Ok(None);
        }
    }
    if message.is_system {
        return Ok(None);
    }

    let message_key = MappingKind::Message.discord_key(message.id);
    if ctx
        .db
        .get_roomy_id(&ctx.binding, &message_key)
        .await
        .context(DbSnafu)?
        .is_some()
    {
        return Ok(None);
    }

    let room_key = MappingKind::Room.discord_key(message.channel);
    let Some(room) = ctx
        .db
        .get_roomy_id(&ctx.binding, &room_key)
        .await
        .context(DbSnafu)?
    else {
        return Ok(None);
    };

    profile_update(ctx, &message.author, batcher).await?;

    let mut event = RoomyEvent::new(EventKind::CreateMessage(CreateMessage {
        body: message.content.clone(),
    }))
    .in_room(room)
    .with_extension(
        ext::DISCORD_MESSAGE_ORIGIN,
        &DiscordMessageOrigin {
            snowflake: message.id,
            channel_id: message.channel,
            guild_id: ctx.guild(),
            edited_timestamp: None,
            content_hash: None,
        },
    )
    .with_extension(
        ext::AUTHOR_OVERRIDE,
        &AuthorOverride {
            did: Did::discord(message.author.id),
        },
    )
    .with_extension(
        ext::TIMESTAMP_OVERRIDE,
        &TimestampOverride {
            timestamp: message.timestamp,
        },
    );

    let mut attachments: Vec<Attachment> = message
        .attachments
        .iter()
        .map(|a| Attachment::File {
            name: a.name.clone(),
            url: a.url.clone(),
            mime: a.mime.clone(),
        })
        .collect();
    if let Some(reply_to) = message.reply_to {
        // Encode the reply only when the replied-to message is already
        // synced; otherwise it is dropped.
        let reply_key = MappingKind::Message.discord_key(reply_to);
        if let Some(target) = ctx
            .db
            .get_roomy_id(&ctx.binding, &reply_key)
            .await
            .context(DbSnafu)?
        {
            attachments.push(Attachment::Reply { target });
        }
    }
    if !attachments.is_empty() {
        event.set_extension(ext::ATTACHMENTS, &Attachments { attachments });
    }

    let roomy_id = event.id;
    batcher.push(event).await.context(LeafSnafu)?;
    Ok(Some((message.id, roomy_id)))
}

/// Emit a profile update when the author's fingerprint changed.
pub async fn profile_update(
    ctx: &GuildContext,
    author: &AuthorIn,
    batcher: &mut EventBatcher,
) -> SyncResult<SyncOutcome> {
    if author.webhook_id.is_some() {
        return Ok(SyncOutcome::Skipped);
    }

    let hash = fingerprint::profile_fingerprint(
        &author.username,
        author.global_name.as_deref(),
        author.avatar_url.as_deref(),
    );
    if ctx
        .db
        .profile_hash(&ctx.binding, author.id)
        .await
        .context(DbSnafu)?
        .as_deref()
        == Some(hash.as_str())
    {
        return Ok(SyncOutcome::Skipped);
    }

    let event = RoomyEvent::new(EventKind::UpdateProfile(UpdateProfile {
        did: Did::discord(author.id),
        name: author.display_name().to_owned(),
        avatar: author.avatar_url.clone(),
    }))
    .with_extension(
        ext::DISCORD_USER_ORIGIN,
        &DiscordUserOrigin {
            guild_id: ctx.guild(),
            user_id: author.id,
            profile_hash: hash.clone(),
            handle: author.handle(),
        },
    );

    batcher.push(event).await.context(LeafSnafu)?;
    ctx.db
        .write_with(|tx| BridgeDb::set_profile_hash_tx(tx, &ctx.binding, author.id, &hash))
        .await
        .context(DbSnafu)?;
    Ok(SyncOutcome::Applied)
}

/// Mirror an edit, suppressing replays via the `(editedTimestamp,
/// contentHash)` pair.
pub async fn message_update(
    ctx: &GuildContext,
    update: &MessageUpdateIn,
) -> SyncResult<SyncOutcome> {
    let message_key = MappingKind::Message.discord_key(update.id);
    let Some(roomy_id) = ctx
        .db
        .get_roomy_id(&ctx.binding, &message_key)
        .await
        .context(DbSnafu)?
    else {
        return Ok(SyncOutcome::Skipped);
    };

    // Partial updates without content (embed unfurls etc.) carry nothing to
    // mirror.
    let Some(content) = update.content.clone() else {
        return Ok(SyncOutcome::Skipped);
    };
    let Some(edited_timestamp) = update.edited_timestamp else {
        return Ok(SyncOutcome::Skipped);
    };

    let urls: Vec<String> = update
        .attachments
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(|a| a.url.clone())
        .collect();
    let content_hash = fingerprint::message_fingerprint(&content, &urls);

    if let Some(info) = ctx
        .db
        .edit_info(&ctx.binding, update.id)
        .await
        .context(DbSnafu)?
    {
        if info.edited_timestamp == edited_timestamp && info.content_hash == content_hash {
            return Ok(SyncOutcome::Skipped);
        }
    }

    let mut event = RoomyEvent::new(EventKind::EditMessage(EditMessage {
        message: roomy_id,
        body: content,
    }))
    .with_extension(
        ext::DISCORD_MESSAGE_ORIGIN,
        &DiscordMessageOrigin {
            snowflake: update.id,
            channel_id: update.channel,
            guild_id: ctx.guild(),
            edited_timestamp: Some(edited_timestamp),
            content_hash: Some(content_hash.clone()),
        },
    );
    let room_key = MappingKind::Room.discord_key(update.channel);
    if let Some(room) = ctx
        .db
        .get_roomy_id(&ctx.binding, &room_key)
        .await
        .context(DbSnafu)?
    {
        event.room = Some(room);
    }

    ctx.send_event(event).await.context(LeafSnafu)?;
    ctx.db
        .write_with(|tx| {
            BridgeDb::set_edit_info_tx(
                tx,
                &ctx.binding,
                update.id,
                &EditInfoRecord {
                    edited_timestamp,
                    content_hash,
                },
            )
        })
        .await
        .context(DbSnafu)?;
    Ok(SyncOutcome::Applied)
}

/// Emit a `deleteMessage`; the materializer unregisters the mapping when the
/// event returns on the subscription.
pub async fn message_delete(
    ctx: &GuildContext,
    channel: Snowflake,
    message: Snowflake,
) -> SyncResult<SyncOutcome> {
    let message_key = MappingKind::Message.discord_key(message);
    let Some(roomy_id) = ctx
        .db
        .get_roomy_id(&ctx.binding, &message_key)
        .await
        .context(DbSnafu)?
    else {
        return Ok(SyncOutcome::Skipped);
    };

    let event = RoomyEvent::new(EventKind::DeleteMessage(DeleteMessage { message: roomy_id }))
        .with_extension(
            ext::DISCORD_MESSAGE_ORIGIN,
            &DiscordMessageOrigin {
                snowflake: message,
                channel_id: channel,
                guild_id: ctx.guild(),
                edited_timestamp: None,
                content_hash: None,
            },
        );

    ctx.send_event(event).await.context(LeafSnafu)?;
    Ok(SyncOutcome::Applied)
}

pub async fn reaction_add(ctx: &GuildContext, reaction: &ReactionIn) -> SyncResult<SyncOutcome> {
    let emoji_key = reaction.emoji.key();
    let key = reaction_key(reaction.message, reaction.user, &emoji_key);
    if ctx
        .db
        .reaction_id(&ctx.binding, &key)
        .await
        .context(DbSnafu)?
        .is_some()
    {
        return Ok(SyncOutcome::Skipped);
    }

    let message_key = MappingKind::Message.discord_key(reaction.message);
    let Some(roomy_message) = ctx
        .db
        .get_roomy_id(&ctx.binding, &message_key)
        .await
        .context(DbSnafu)?
    else {
        return Ok(SyncOutcome::Skipped);
    };

    let mut event = RoomyEvent::new(EventKind::AddBridgedReaction(
        roomy_bridge_core::event::AddBridgedReaction {
            reaction_to: roomy_message,
            reaction: reaction.emoji.to_string(),
            reacting_user: Did::discord(reaction.user),
        },
    ))
    .with_extension(
        ext::DISCORD_REACTION_ORIGIN,
        &DiscordReactionOrigin {
            guild_id: ctx.guild(),
            message_id: reaction.message,
            user_id: reaction.user,
            emoji_key: emoji_key.clone(),
        },
    );
    let room_key = MappingKind::Room.discord_key(reaction.channel);
    if let Some(room) = ctx
        .db
        .get_roomy_id(&ctx.binding, &room_key)
        .await
        .context(DbSnafu)?
    {
        event.room = Some(room);
    }
    let event_id = event.id;

    ctx.send_event(event).await.context(LeafSnafu)?;
    ctx.db
        .set_reaction_id(&ctx.binding, &key, event_id)
        .await
        .context(DbSnafu)?;
    Ok(SyncOutcome::Applied)
}

pub async fn reaction_remove(ctx: &GuildContext, reaction: &ReactionIn) -> SyncResult<SyncOutcome> {
    let emoji_key = reaction.emoji.key();
    let key = reaction_key(reaction.message, reaction.user, &emoji_key);
    let Some(add_event_id) = ctx
        .db
        .reaction_id(&ctx.binding, &key)
        .await
        .context(DbSnafu)?
    else {
        // The add was never observed (e.g. predates the bridge); nothing to
        // remove on the Roomy side.
        debug!(target: LOG_TARGET, %key, "Reaction remove without observed add");
        return Ok(SyncOutcome::Skipped);
    };

    let event = RoomyEvent::new(EventKind::RemoveBridgedReaction(
        roomy_bridge_core::event::RemoveBridgedReaction {
            reaction_id: add_event_id,
        },
    ))
    .with_extension(
        ext::DISCORD_REACTION_ORIGIN,
        &DiscordReactionOrigin {
            guild_id: ctx.guild(),
            message_id: reaction.message,
            user_id: reaction.user,
            emoji_key,
        },
    );

    ctx.send_event(event).await.context(LeafSnafu)?;
    ctx.db
        .remove_reaction_id(&ctx.binding, &key)
        .await
        .context(DbSnafu)?;
    Ok(SyncOutcome::Applied)
}

/// Emit the sidebar structure when its normalized fingerprint changed.
///
/// Categories come from the guild's channel list: every synced text channel
/// is grouped under its category's name (uncategorized channels group under
/// the empty name).
pub async fn sidebar_update(
    ctx: &GuildContext,
    channels: &[ChannelInfo],
) -> SyncResult<SyncOutcome> {
    let category_names: BTreeMap<Snowflake, String> = channels
        .iter()
        .filter(|c| c.kind == ChannelKind::Category)
        .map(|c| (c.id, c.name.clone()))
        .collect();

    let mut grouped: BTreeMap<String, Vec<Ulid>> = BTreeMap::new();
    for channel in channels.iter().filter(|c| c.kind == ChannelKind::Text) {
        let room_key = MappingKind::Room.discord_key(channel.id);
        let Some(room) = ctx
            .db
            .get_roomy_id(&ctx.binding, &room_key)
            .await
            .context(DbSnafu)?
        else {
            continue;
        };
        let category = channel
            .parent
            .and_then(|parent| category_names.get(&parent).cloned())
            .unwrap_or_default();
        grouped.entry(category).or_default().push(room);
    }

    let categories: Vec<SidebarCategory> = grouped
        .into_iter()
        .map(|(name, children)| SidebarCategory { name, children })
        .collect();

    let hash = fingerprint::sidebar_fingerprint(&categories);
    if ctx
        .db
        .sidebar_hash(&ctx.binding)
        .await
        .context(DbSnafu)?
        .as_deref()
        == Some(hash.as_str())
    {
        return Ok(SyncOutcome::Skipped);
    }

    let event = RoomyEvent::new(EventKind::UpdateSidebar(UpdateSidebar { categories }))
        .with_extension(
            ext::DISCORD_SIDEBAR_ORIGIN,
            &DiscordSidebarOrigin {
                guild_id: ctx.guild(),
                sidebar_hash: hash.clone(),
            },
        );

    ctx.send_event(event).await.context(LeafSnafu)?;
    ctx.db
        .write_with(|tx| BridgeDb::set_sidebar_hash_tx(tx, &ctx.binding, &hash))
        .await
        .context(DbSnafu)?;
    Ok(SyncOutcome::Applied)
}
