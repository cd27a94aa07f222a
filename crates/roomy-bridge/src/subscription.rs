//! The subscription handler: single entry point for every inbound Roomy
//! event batch.
//!
//! Per event, in order: materialize Discord-origin extensions into derived
//! KV state (mappings, edit info, fingerprints, room links), drop mappings
//! for deletes, then dispatch non-Discord-origin events to the
//! Roomy->Discord translators. Catch-up batches dispatch too, gated on the
//! backfill replay's high-water mark: events at or below it were already
//! projected by the replay, while anything past it would otherwise be
//! materialized, cursored past, and never re-read. The cursor advances to
//! the batch's highest index only after every materialization committed, so
//! a crash mid-batch replays it and the idempotency gates make the replay a
//! no-op.

use roomy_bridge_core::error::FmtCompact as _;
use roomy_bridge_core::event::{
    DiscordMessageOrigin, DiscordReactionOrigin, DiscordRoomLinkOrigin, DiscordRoomOrigin,
    DiscordSidebarOrigin, DiscordUserOrigin, EventKind, RoomyEvent, ext,
};
use roomy_bridge_db::{BridgeDb, EditInfoRecord, MappingKind};
use roomy_bridge_leaf::EventBatch;
use snafu::ResultExt as _;
use tracing::{debug, info, instrument, warn};

use crate::context::GuildContext;
use crate::sync::{DbSnafu, SyncResult, room_link_key, roomy_to_discord, swallow_mapping_conflict};

const LOG_TARGET: &str = "bridge::subscription";

/// Process one subscription batch in `idx` order.
///
/// Materialization failures are fatal to the batch (the cursor stays put and
/// the batch is redelivered); decode and dispatch failures are per-event,
/// counted, and do not stop the batch.
#[instrument(
    name = "subscription.batch",
    skip_all,
    fields(space = %ctx.binding.space, events = batch.envelopes.len(), backfill = batch.is_backfill)
)]
pub async fn handle_batch(ctx: &GuildContext, batch: &EventBatch) -> SyncResult<()> {
    let mut max_idx = 0u64;
    let mut decode_failures = 0usize;
    let mut dispatch_failures = 0usize;

    for envelope in &batch.envelopes {
        max_idx = max_idx.max(envelope.idx);

        let event: RoomyEvent = match serde_json::from_value(envelope.event.clone()) {
            Ok(event) => event,
            Err(err) => {
                // Poisoned event: log with its index and move on; parking
                // the whole space on one bad record is worse.
                warn!(
                    target: LOG_TARGET,
                    idx = envelope.idx,
                    err = %err,
                    "Undecodable event, skipping"
                );
                decode_failures += 1;
                continue;
            }
        };

        materialize(ctx, &event).await?;

        // The backfill replay only covered events up to its mark at replay
        // time; the pump's catch-up scan can run past that, and those
        // events get their one dispatch here.
        let replay_covered = batch.is_backfill && envelope.idx <= ctx.replay_mark();
        if !replay_covered && should_dispatch(ctx, &event) {
            if let Err(err) = roomy_to_discord::dispatch(ctx, &event, &envelope.user).await {
                warn!(
                    target: LOG_TARGET,
                    event = %event.id,
                    idx = envelope.idx,
                    err = %err.fmt_compact(),
                    "Dispatch to Discord failed"
                );
                dispatch_failures += 1;
            }
        }
    }

    if 0 < max_idx {
        ctx.db
            .set_cursor(&ctx.binding.space, max_idx)
            .await
            .context(DbSnafu)?;
    }

    if 0 < decode_failures || 0 < dispatch_failures {
        info!(
            target: LOG_TARGET,
            decode_failures,
            dispatch_failures,
            cursor = max_idx,
            "Batch finished with per-event failures"
        );
    }
    Ok(())
}

/// Whether a live event should be projected onto Discord.
///
/// Reactions are special-cased: they propagate even when the reacted-to
/// message is Discord-originated, as long as the reaction event itself
/// carries no `discordReactionOrigin` for this guild.
fn should_dispatch(ctx: &GuildContext, event: &RoomyEvent) -> bool {
    match &event.kind {
        EventKind::AddBridgedReaction(_) | EventKind::RemoveBridgedReaction(_) => event
            .extension::<DiscordReactionOrigin>(ext::DISCORD_REACTION_ORIGIN)
            .is_none_or(|origin| origin.guild_id != ctx.guild()),
        _ => !event.has_discord_origin_for(ctx.guild()),
    }
}

/// Write every derived-KV side effect of one event in a single transaction.
async fn materialize(ctx: &GuildContext, event: &RoomyEvent) -> SyncResult<()> {
    let guild = ctx.guild();

    let message_origin = event
        .extension::<DiscordMessageOrigin>(ext::DISCORD_MESSAGE_ORIGIN)
        .filter(|origin| origin.guild_id == guild);
    let room_origin = event
        .extension::<DiscordRoomOrigin>(ext::DISCORD_ORIGIN)
        .filter(|origin| origin.guild_id == guild);
    let user_origin = event
        .extension::<DiscordUserOrigin>(ext::DISCORD_USER_ORIGIN)
        .filter(|origin| origin.guild_id == guild);
    let sidebar_origin = event
        .extension::<DiscordSidebarOrigin>(ext::DISCORD_SIDEBAR_ORIGIN)
        .filter(|origin| origin.guild_id == guild);
    let link_origin = event
        .extension::<DiscordRoomLinkOrigin>(ext::DISCORD_ROOM_LINK_ORIGIN)
        .filter(|origin| origin.guild_id == guild);

    let event_id = event.id;
    let binding = ctx.binding.clone();
    let kind = event.kind.clone();

    ctx.db
        .write_with(move |tx| {
            if let Some(origin) = &message_origin {
                // Deletes only unregister (below); registering here would
                // resurrect the pair under the delete event's id on replay.
                if !matches!(kind, EventKind::DeleteMessage(_)) {
                    swallow_mapping_conflict(BridgeDb::register_mapping_tx(
                        tx,
                        &binding,
                        MappingKind::Message,
                        origin.snowflake,
                        event_id,
                    ))?;
                }
                if let EventKind::EditMessage(_) = &kind {
                    if let (Some(edited_timestamp), Some(content_hash)) =
                        (origin.edited_timestamp, origin.content_hash.as_ref())
                    {
                        BridgeDb::set_edit_info_tx(
                            tx,
                            &binding,
                            origin.snowflake,
                            &EditInfoRecord {
                                edited_timestamp,
                                content_hash: content_hash.clone(),
                            },
                        )?;
                    }
                }
            }

            if let Some(origin) = &room_origin {
                if !matches!(kind, EventKind::DeleteRoom(_)) {
                    swallow_mapping_conflict(BridgeDb::register_mapping_tx(
                        tx,
                        &binding,
                        MappingKind::Room,
                        origin.snowflake,
                        event_id,
                    ))?;
                }
            }

            if let Some(origin) = &user_origin {
                BridgeDb::set_profile_hash_tx(tx, &binding, origin.user_id, &origin.profile_hash)?;
            }

            if let Some(origin) = &sidebar_origin {
                BridgeDb::set_sidebar_hash_tx(tx, &binding, &origin.sidebar_hash)?;
            }

            if link_origin.is_some() {
                if let EventKind::CreateRoomLink(link) = &kind {
                    BridgeDb::set_room_link_id_tx(
                        tx,
                        &binding,
                        &room_link_key(link.parent, link.child),
                        event_id,
                    )?;
                }
            }

            // Deletes drop both directions, whatever side originated them.
            match &kind {
                EventKind::DeleteRoom(delete) => {
                    BridgeDb::unregister_mapping_by_roomy_tx(
                        tx,
                        &binding,
                        MappingKind::Room,
                        delete.target,
                    )?;
                }
                EventKind::DeleteMessage(delete) => {
                    BridgeDb::unregister_mapping_by_roomy_tx(
                        tx,
                        &binding,
                        MappingKind::Message,
                        delete.message,
                    )?;
                }
                _ => {}
            }

            Ok(())
        })
        .await
        .context(DbSnafu)?;

    // Keep the in-memory profile directory current regardless of origin; it
    // backs webhook impersonation.
    if let EventKind::UpdateProfile(profile) = &event.kind {
        debug!(target: LOG_TARGET, did = %profile.did, "Profile recorded");
        ctx.directory
            .record(
                profile.did.clone(),
                profile.name.clone(),
                profile.avatar.clone(),
            )
            .await;
    }

    Ok(())
}
