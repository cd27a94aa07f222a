//! Per-guild backfill orchestrator.
//!
//! Runs at process start and whenever a binding is registered: adopt
//! channels and threads, sync the sidebar, walk each channel's message history
//! oldest-first through an event batcher, index recent history for
//! duplicate detection, replay Roomy-origin history onto Discord, then flip
//! the guild live. Every stage is idempotent, so an interrupted backfill
//! simply reruns.

use std::fmt;
use std::sync::Arc;

use roomy_bridge_core::error::FmtCompact as _;
use roomy_bridge_core::event::RoomyEvent;
use roomy_bridge_core::fingerprint;
use roomy_bridge_core::id::Snowflake;
use roomy_bridge_db::{BridgeDb, MappingKind};
use roomy_bridge_leaf::EventBatcher;
use snafu::ResultExt as _;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use crate::context::GuildContext;
use crate::discord::ChannelKind;
use crate::sync::{
    DbSnafu, DiscordSnafu, LeafSnafu, SyncResult, discord_to_roomy, register_mapping_idempotent,
    roomy_to_discord,
};

const LOG_TARGET: &str = "bridge::backfill";

/// Bound on concurrent per-channel history walks.
pub const BACKFILL_CONCURRENCY: usize = 5;

const PAGE_SIZE: usize = 100;

/// The stages a guild passes through before accepting real-time events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuildBackfillStage {
    Idle,
    ChannelsAdopted,
    SidebarSynced,
    MessagesBackfilled,
    HashesIndexed,
    RoomyToDiscordReplayed,
    Live,
}

impl fmt::Display for GuildBackfillStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GuildBackfillStage::Idle => "idle",
            GuildBackfillStage::ChannelsAdopted => "channels_adopted",
            GuildBackfillStage::SidebarSynced => "sidebar_synced",
            GuildBackfillStage::MessagesBackfilled => "messages_backfilled",
            GuildBackfillStage::HashesIndexed => "hashes_indexed",
            GuildBackfillStage::RoomyToDiscordReplayed => "roomy_to_discord_replayed",
            GuildBackfillStage::Live => "live",
        };
        f.write_str(name)
    }
}

fn stage(ctx: &GuildContext, stage: GuildBackfillStage) {
    info!(target: LOG_TARGET, guild = %ctx.guild(), %stage, "Backfill stage reached");
}

/// Reconcile both histories for one guild, then admit real-time events.
#[instrument(name = "backfill.guild", skip_all, fields(guild = %ctx.guild(), space = %ctx.binding.space))]
pub async fn run(ctx: &Arc<GuildContext>) -> SyncResult<()> {
    stage(ctx, GuildBackfillStage::Idle);

    // Stage 1: adopt text channels and threads.
    let channels = ctx
        .discord
        .guild_channels(ctx.guild())
        .await
        .context(DiscordSnafu)?;

    for channel in channels.iter().filter(|c| c.kind == ChannelKind::Text) {
        if let Err(err) = discord_to_roomy::channel_create(ctx, channel).await {
            warn!(
                target: LOG_TARGET,
                channel = %channel.id,
                err = %err.fmt_compact(),
                "Channel adoption failed, skipping"
            );
        }
    }

    let mut threads = match ctx.discord.active_threads(ctx.guild()).await {
        Ok(threads) => threads,
        Err(err) => {
            warn!(
                target: LOG_TARGET,
                err = %err.fmt_compact(),
                "Active thread listing failed"
            );
            Vec::new()
        }
    };
    for channel in channels.iter().filter(|c| c.kind == ChannelKind::Text) {
        let mut before = None;
        loop {
            let page = match ctx.discord.archived_threads(channel.id, before).await {
                Ok(page) => page,
                Err(err) => {
                    warn!(
                        target: LOG_TARGET,
                        channel = %channel.id,
                        err = %err.fmt_compact(),
                        "Archived thread listing failed"
                    );
                    break;
                }
            };
            threads.extend(page.threads);
            match page.next_before {
                Some(next) => before = Some(next),
                None => break,
            }
        }
    }
    for thread in &threads {
        if let Err(err) = discord_to_roomy::thread_create(ctx, thread).await {
            warn!(
                target: LOG_TARGET,
                thread = %thread.id,
                err = %err.fmt_compact(),
                "Thread adoption failed, skipping"
            );
        }
    }
    stage(ctx, GuildBackfillStage::ChannelsAdopted);

    // Stage 2: sidebar structure.
    if let Err(err) = discord_to_roomy::sidebar_update(ctx, &channels).await {
        warn!(target: LOG_TARGET, err = %err.fmt_compact(), "Sidebar sync failed");
    }
    stage(ctx, GuildBackfillStage::SidebarSynced);

    // Stage 3: per-channel message history, bounded fan-out.
    let sync_channels: Vec<Snowflake> = channels
        .iter()
        .filter(|c| c.kind == ChannelKind::Text)
        .map(|c| c.id)
        .chain(threads.iter().map(|t| t.id))
        .collect();

    let semaphore = Arc::new(Semaphore::new(BACKFILL_CONCURRENCY));
    let mut handles = Vec::new();
    for channel in sync_channels.clone() {
        let ctx = ctx.clone();
        let semaphore = semaphore.clone();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("Semaphore never closed");
            if let Err(err) = backfill_channel(&ctx, channel).await {
                warn!(
                    target: LOG_TARGET,
                    %channel,
                    err = %err.fmt_compact(),
                    "Channel backfill failed, skipping"
                );
            }
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }
    stage(ctx, GuildBackfillStage::MessagesBackfilled);

    // Stage 4: index recent bridge-authored history for duplicate detection.
    for channel in &sync_channels {
        if let Err(err) = index_channel_hashes(ctx, *channel).await {
            warn!(
                target: LOG_TARGET,
                channel = %channel,
                err = %err.fmt_compact(),
                "Hash indexing failed"
            );
        }
    }
    stage(ctx, GuildBackfillStage::HashesIndexed);

    // Stage 5: replay Roomy-origin history onto Discord.
    if let Err(err) = replay_roomy_history(ctx).await {
        warn!(target: LOG_TARGET, err = %err.fmt_compact(), "Roomy history replay failed");
    }
    stage(ctx, GuildBackfillStage::RoomyToDiscordReplayed);

    // Stage 6: accept real-time events.
    ctx.set_live(true);
    stage(ctx, GuildBackfillStage::Live);
    Ok(())
}

/// Walk one channel's messages oldest-first from the last seen snowflake,
/// batching the emitted events and committing `latestSeen` after each page.
async fn backfill_channel(ctx: &Arc<GuildContext>, channel: Snowflake) -> SyncResult<()> {
    let mut after = ctx
        .db
        .latest_seen(&ctx.binding, channel)
        .await
        .context(DbSnafu)?;
    let mut batcher = EventBatcher::with_threshold(
        ctx.leaf.clone(),
        ctx.binding.space.clone(),
        PAGE_SIZE,
    );
    let mut total = 0usize;

    loop {
        let page = ctx
            .discord
            .messages_after(channel, after, PAGE_SIZE)
            .await
            .context(DiscordSnafu)?;
        let Some(last) = page.last().map(|m| m.id) else {
            break;
        };
        let page_len = page.len();

        let mut pairs = Vec::new();
        for message in &page {
            if let Some(pair) = discord_to_roomy::message_create(ctx, message, &mut batcher).await?
            {
                pairs.push(pair);
            }
        }
        batcher.flush().await.context(LeafSnafu)?;
        total += pairs.len();

        // Mappings and the page bound commit only after the batch did.
        for (discord_id, roomy_id) in pairs {
            register_mapping_idempotent(ctx, MappingKind::Message, discord_id, roomy_id).await?;
        }
        ctx.db
            .set_latest_seen(&ctx.binding, channel, last)
            .await
            .context(DbSnafu)?;

        after = Some(last);
        if page_len < PAGE_SIZE {
            break;
        }
    }

    if 0 < total {
        debug!(target: LOG_TARGET, %channel, synced = total, "Channel history backfilled");
    }
    Ok(())
}

/// Populate the `nonce:contentHash -> snowflake` index from recent
/// bridge-authored messages so Roomy->Discord sync can recognize deliveries
/// whose mapping write was lost.
async fn index_channel_hashes(ctx: &Arc<GuildContext>, channel: Snowflake) -> SyncResult<()> {
    let recent = ctx
        .discord
        .recent_messages(channel, PAGE_SIZE)
        .await
        .context(DiscordSnafu)?;

    let mut entries = Vec::new();
    for message in recent {
        let Some(webhook_id) = message.author.webhook_id else {
            continue;
        };
        if !ctx.webhooks.is_own_webhook(webhook_id).await {
            continue;
        }
        let hash = fingerprint::message_fingerprint(&message.content, &message.attachment_urls());
        entries.push((message.nonce, hash, message.id));
    }

    if entries.is_empty() {
        return Ok(());
    }

    let binding = ctx.binding.clone();
    ctx.db
        .write_with(move |tx| {
            for (nonce, hash, id) in &entries {
                BridgeDb::index_message_hash_tx(
                    tx,
                    &binding,
                    channel,
                    nonce.as_deref(),
                    hash,
                    *id,
                )?;
            }
            Ok(())
        })
        .await
        .context(DbSnafu)?;
    Ok(())
}

/// Pull the space's history and replay Roomy-origin events through the
/// Roomy->Discord translators; their idempotency gates skip anything
/// already delivered.
///
/// The context's replay mark advances page by page: the subscription
/// handler dispatches catch-up events only past the mark, so everything at
/// or below it must have had its one projection attempt here. On a fetch
/// failure the mark simply stops early and the handler over-dispatches the
/// rest, which the gates absorb.
async fn replay_roomy_history(ctx: &Arc<GuildContext>) -> SyncResult<()> {
    let mut start = 1u64;
    loop {
        let page = ctx
            .leaf
            .fetch_events(&ctx.binding.space, start, PAGE_SIZE)
            .await
            .context(LeafSnafu)?;
        if page.is_empty() {
            break;
        }
        let page_len = page.len();

        for envelope in &page {
            let event: RoomyEvent = match serde_json::from_value(envelope.event.clone()) {
                Ok(event) => event,
                Err(_) => continue,
            };
            if event.has_any_discord_origin() {
                continue;
            }
            if let Err(err) = roomy_to_discord::dispatch(ctx, &event, &envelope.user).await {
                warn!(
                    target: LOG_TARGET,
                    event = %event.id,
                    err = %err.fmt_compact(),
                    "History replay of event failed"
                );
            }
        }

        if let Some(last) = page.last() {
            ctx.set_replay_mark(last.idx);
        }

        start += page_len as u64;
        if page_len < PAGE_SIZE {
            break;
        }
    }
    Ok(())
}
