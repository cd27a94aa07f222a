//! Roomy -> Discord translators.
//!
//! Called for every non-Discord-origin event on the live subscription and
//! for Roomy-origin history during backfill replay. Message delivery is
//! guarded by three idempotency gates, in order: the send-time nonce
//! mapping, the recent-history `nonce:contentHash` index, and only then a
//! webhook execute.

use roomy_bridge_core::event::{
    AddBridgedReaction, Attachment, Attachments, AuthorOverride, CreateMessage, CreateRoom,
    CreateRoomLink, DeleteMessage, EditMessage, EventKind, RemoveBridgedReaction, RoomyEvent,
    UpdateProfile, UpdateSidebar, ext,
};
use roomy_bridge_core::id::{Did, Snowflake};
use roomy_bridge_core::{fingerprint, marker};
use roomy_bridge_db::{BridgeDb, MappingKind};
use snafu::ResultExt as _;
use tracing::{debug, instrument};

use super::{
    DbSnafu, DiscordSnafu, LeafSnafu, SyncOutcome, SyncResult, WebhookSnafu, room_link_key,
    swallow_mapping_conflict,
};
use crate::context::{GuildContext, MirroredReaction};
use crate::discord::{ChannelKind, DiscordEmoji, DiscordError, WebhookMessage};

const LOG_TARGET: &str = "bridge::sync::r2d";

/// Project one Roomy event onto Discord. `author` is the subscription's
/// authenticated user, used when no `authorOverride` is present.
#[instrument(name = "sync.roomy_to_discord", skip_all, fields(event = %event.id))]
pub async fn dispatch(
    ctx: &GuildContext,
    event: &RoomyEvent,
    author: &Did,
) -> SyncResult<SyncOutcome> {
    match &event.kind {
        EventKind::CreateMessage(payload) => create_message(ctx, event, payload, author).await,
        EventKind::EditMessage(payload) => edit_message(ctx, event, payload).await,
        EventKind::DeleteMessage(payload) => delete_message(ctx, event, payload).await,
        EventKind::AddBridgedReaction(payload) => add_reaction(ctx, event, payload).await,
        EventKind::RemoveBridgedReaction(payload) => remove_reaction(ctx, payload).await,
        EventKind::CreateRoom(payload) => create_room(ctx, event, payload).await,
        // Delete propagation for Roomy-originated rooms is intentionally not
        // mirrored; the materializer already dropped the mapping.
        EventKind::DeleteRoom(_) => Ok(SyncOutcome::Skipped),
        EventKind::CreateRoomLink(payload) => create_room_link(ctx, event, payload).await,
        EventKind::UpdateProfile(payload) => update_profile(ctx, payload).await,
        EventKind::UpdateSidebar(payload) => update_sidebar(ctx, payload).await,
    }
}

/// Display identity for webhook impersonation: Discord DIDs resolve through
/// the profile directory, AT-proto DIDs through the cached resolver.
async fn resolve_author(ctx: &GuildContext, did: &Did) -> SyncResult<(String, Option<String>)> {
    if let Some(record) = ctx.directory.get(did).await {
        return Ok((record.name, record.avatar));
    }
    if let Some(user) = did.as_discord_user() {
        return Ok((format!("Discord user {user}"), None));
    }
    match ctx.profiles.resolve(did).await.context(LeafSnafu)? {
        Some(profile) => {
            let name = profile.display_name.unwrap_or_else(|| profile.handle.clone());
            Ok((name, profile.avatar))
        }
        None => Ok((did.to_string(), None)),
    }
}

pub async fn create_message(
    ctx: &GuildContext,
    event: &RoomyEvent,
    payload: &CreateMessage,
    author: &Did,
) -> SyncResult<SyncOutcome> {
    let Some(room) = event.room else {
        return Ok(SyncOutcome::Skipped);
    };
    let room_key = MappingKind::Room.roomy_key(room);
    let Some(channel) = ctx
        .db
        .get_discord_id(&ctx.binding, &room_key)
        .await
        .context(DbSnafu)?
    else {
        return Ok(SyncOutcome::Skipped);
    };

    let nonce = event.id.nonce();

    // Gate 1: the nonce mapping says this event was already sent.
    if ctx
        .db
        .get_discord_id(&ctx.binding, &nonce)
        .await
        .context(DbSnafu)?
        .is_some()
    {
        return Ok(SyncOutcome::Skipped);
    }
    if ctx
        .db
        .get_discord_id(&ctx.binding, &event.id.to_string())
        .await
        .context(DbSnafu)?
        .is_some()
    {
        return Ok(SyncOutcome::Skipped);
    }

    // Gate 2: the recent-history hash index recognizes a delivery whose
    // mapping write was lost (crash between webhook send and commit).
    let urls: Vec<String> = event
        .extension::<Attachments>(ext::ATTACHMENTS)
        .map(|a| {
            a.attachments
                .into_iter()
                .filter_map(|attachment| match attachment {
                    Attachment::File { url, .. } => Some(url),
                    Attachment::Reply { .. } => None,
                })
                .collect()
        })
        .unwrap_or_default();
    let content_hash = fingerprint::message_fingerprint(&payload.body, &urls);

    if let Some(existing) = ctx
        .db
        .message_hash_lookup(&ctx.binding, channel, &nonce, &content_hash)
        .await
        .context(DbSnafu)?
    {
        debug!(
            target: LOG_TARGET,
            event = %event.id,
            message = %existing,
            "Recovered delivery from hash index, not re-sending"
        );
        register_send(ctx, existing, event, &nonce).await?;
        return Ok(SyncOutcome::Skipped);
    }

    // Gate 3 passed: send through the channel webhook.
    let author_did = event
        .extension::<AuthorOverride>(ext::AUTHOR_OVERRIDE)
        .map(|o| o.did)
        .unwrap_or_else(|| author.clone());
    let (username, avatar_url) = resolve_author(ctx, &author_did).await?;

    let message = WebhookMessage {
        content: payload.body.clone(),
        username,
        avatar_url,
        nonce: nonce.clone(),
    };
    let snowflake = ctx
        .webhooks
        .execute(channel, &message)
        .await
        .context(WebhookSnafu)?;

    register_send(ctx, snowflake, event, &nonce).await?;
    Ok(SyncOutcome::Applied)
}

/// Record both `snowflake -> event id` and `nonce -> snowflake` in one
/// batch.
async fn register_send(
    ctx: &GuildContext,
    snowflake: Snowflake,
    event: &RoomyEvent,
    nonce: &str,
) -> SyncResult<()> {
    let event_id = event.id;
    ctx.db
        .write_with(|tx| {
            swallow_mapping_conflict(BridgeDb::register_mapping_tx(
                tx,
                &ctx.binding,
                MappingKind::Message,
                snowflake,
                event_id,
            ))?;
            swallow_mapping_conflict(BridgeDb::register_nonce_tx(
                tx,
                &ctx.binding,
                nonce,
                snowflake,
            ))?;
            Ok(())
        })
        .await
        .context(DbSnafu)
}

pub async fn edit_message(
    ctx: &GuildContext,
    event: &RoomyEvent,
    payload: &EditMessage,
) -> SyncResult<SyncOutcome> {
    let message_key = MappingKind::Message.roomy_key(payload.message);
    let Some(discord_message) = ctx
        .db
        .get_discord_id(&ctx.binding, &message_key)
        .await
        .context(DbSnafu)?
    else {
        return Ok(SyncOutcome::Skipped);
    };
    let Some(channel) = room_channel(ctx, event).await? else {
        return Ok(SyncOutcome::Skipped);
    };

    ctx.webhooks
        .edit_message(channel, discord_message, &payload.body)
        .await
        .context(WebhookSnafu)?;
    Ok(SyncOutcome::Applied)
}

pub async fn delete_message(
    ctx: &GuildContext,
    event: &RoomyEvent,
    payload: &DeleteMessage,
) -> SyncResult<SyncOutcome> {
    let message_key = MappingKind::Message.roomy_key(payload.message);
    let Some(discord_message) = ctx
        .db
        .get_discord_id(&ctx.binding, &message_key)
        .await
        .context(DbSnafu)?
    else {
        return Ok(SyncOutcome::Skipped);
    };
    let Some(channel) = room_channel(ctx, event).await? else {
        return Ok(SyncOutcome::Skipped);
    };

    match ctx.discord.delete_message(channel, discord_message).await {
        Ok(()) => Ok(SyncOutcome::Applied),
        // Already gone on the Discord side; converged either way.
        Err(DiscordError::NotFound) => Ok(SyncOutcome::Skipped),
        Err(err) => Err(err).context(DiscordSnafu),
    }
}

async fn room_channel(ctx: &GuildContext, event: &RoomyEvent) -> SyncResult<Option<Snowflake>> {
    let Some(room) = event.room else {
        return Ok(None);
    };
    let room_key = MappingKind::Room.roomy_key(room);
    ctx.db
        .get_discord_id(&ctx.binding, &room_key)
        .await
        .context(DbSnafu)
}

pub async fn add_reaction(
    ctx: &GuildContext,
    event: &RoomyEvent,
    payload: &AddBridgedReaction,
) -> SyncResult<SyncOutcome> {
    let message_key = MappingKind::Message.roomy_key(payload.reaction_to);
    let Some(discord_message) = ctx
        .db
        .get_discord_id(&ctx.binding, &message_key)
        .await
        .context(DbSnafu)?
    else {
        return Ok(SyncOutcome::Skipped);
    };
    let Some(channel) = room_channel(ctx, event).await? else {
        return Ok(SyncOutcome::Skipped);
    };

    let emoji = DiscordEmoji::parse(&payload.reaction);
    match ctx
        .discord
        .add_reaction(channel, discord_message, &emoji)
        .await
    {
        Ok(()) => {}
        Err(DiscordError::NotFound) => return Ok(SyncOutcome::Skipped),
        Err(err) => return Err(err).context(DiscordSnafu),
    }

    ctx.reactions
        .record(
            event.id,
            MirroredReaction {
                channel,
                message: discord_message,
                emoji: payload.reaction.clone(),
            },
        )
        .await;
    Ok(SyncOutcome::Applied)
}

pub async fn remove_reaction(
    ctx: &GuildContext,
    payload: &RemoveBridgedReaction,
) -> SyncResult<SyncOutcome> {
    // If the bridge never observed the add, this is a no-op.
    let Some(mirrored) = ctx.reactions.take(payload.reaction_id).await else {
        debug!(
            target: LOG_TARGET,
            reaction = %payload.reaction_id,
            "Reaction remove without a mirrored add"
        );
        return Ok(SyncOutcome::Skipped);
    };

    let emoji = DiscordEmoji::parse(&mirrored.emoji);
    match ctx
        .discord
        .remove_own_reaction(mirrored.channel, mirrored.message, &emoji)
        .await
    {
        Ok(()) => Ok(SyncOutcome::Applied),
        Err(DiscordError::NotFound) => Ok(SyncOutcome::Skipped),
        Err(err) => Err(err).context(DiscordSnafu),
    }
}

/// Idempotent channel creation: adopt any channel already carrying this
/// room's sync marker, otherwise create one and mark it.
pub async fn create_room(
    ctx: &GuildContext,
    event: &RoomyEvent,
    payload: &CreateRoom,
) -> SyncResult<SyncOutcome> {
    let room_key = MappingKind::Room.roomy_key(event.id);
    if ctx
        .db
        .get_discord_id(&ctx.binding, &room_key)
        .await
        .context(DbSnafu)?
        .is_some()
    {
        return Ok(SyncOutcome::Skipped);
    }

    let channels = ctx
        .discord
        .guild_channels(ctx.guild())
        .await
        .context(DiscordSnafu)?;
    for channel in channels.iter().filter(|c| c.kind == ChannelKind::Text) {
        if channel.topic.as_deref().and_then(marker::extract) == Some(event.id) {
            debug!(
                target: LOG_TARGET,
                room = %event.id,
                channel = %channel.id,
                "Adopting marked channel for room"
            );
            swallow_mapping_conflict(
                ctx.db
                    .register_mapping(&ctx.binding, MappingKind::Room, channel.id, event.id)
                    .await,
            )
            .context(DbSnafu)?;
            return Ok(SyncOutcome::Applied);
        }
    }

    let topic = marker::add("", event.id);
    let channel = ctx
        .discord
        .create_text_channel(ctx.guild(), &payload.name, &topic)
        .await
        .context(DiscordSnafu)?;
    swallow_mapping_conflict(
        ctx.db
            .register_mapping(&ctx.binding, MappingKind::Room, channel.id, event.id)
            .await,
    )
    .context(DbSnafu)?;

    debug!(target: LOG_TARGET, room = %event.id, channel = %channel.id, "Created channel for room");
    Ok(SyncOutcome::Applied)
}

/// Room links have no Discord-side structure to create (thread parentage is
/// fixed at thread creation); the link is recorded so the Discord->Roomy
/// side will not re-emit it.
pub async fn create_room_link(
    ctx: &GuildContext,
    event: &RoomyEvent,
    payload: &CreateRoomLink,
) -> SyncResult<SyncOutcome> {
    let key = room_link_key(payload.parent, payload.child);
    if ctx
        .db
        .room_link_id(&ctx.binding, &key)
        .await
        .context(DbSnafu)?
        .is_some()
    {
        return Ok(SyncOutcome::Skipped);
    }
    let event_id = event.id;
    ctx.db
        .write_with(|tx| BridgeDb::set_room_link_id_tx(tx, &ctx.binding, &key, event_id))
        .await
        .context(DbSnafu)?;
    Ok(SyncOutcome::Applied)
}

/// Profiles project onto Discord per-message (webhook username/avatar), so
/// the update only refreshes the directory.
pub async fn update_profile(
    ctx: &GuildContext,
    payload: &UpdateProfile,
) -> SyncResult<SyncOutcome> {
    ctx.directory
        .record(
            payload.did.clone(),
            payload.name.clone(),
            payload.avatar.clone(),
        )
        .await;
    Ok(SyncOutcome::Applied)
}

/// Record the Roomy-side sidebar fingerprint so the Discord->Roomy
/// comparison has the current baseline. Restructuring Discord categories to
/// match is not mirrored.
pub async fn update_sidebar(
    ctx: &GuildContext,
    payload: &UpdateSidebar,
) -> SyncResult<SyncOutcome> {
    let hash = fingerprint::sidebar_fingerprint(&payload.categories);
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
    ctx.db
        .write_with(|tx| BridgeDb::set_sidebar_hash_tx(tx, &ctx.binding, &hash))
        .await
        .context(DbSnafu)?;
    Ok(SyncOutcome::Applied)
}
