//! Per-guild sync context.
//!
//! One [`GuildContext`] exists per registered binding; it bundles the shared
//! stores with the connected space so every translator call takes a single
//! handle. Within a guild all sync work is serialized by the guild task, so
//! nothing here needs locking beyond its own small caches.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use roomy_bridge_core::event::RoomyEvent;
use roomy_bridge_core::id::{BindingId, Did, Snowflake, Ulid};
use roomy_bridge_db::BridgeDb;
use roomy_bridge_leaf::{LeafResult, LeafTransport, ProfileCache};
use tokio::sync::Mutex;

use crate::discord::DiscordApi;
use crate::webhooks::WebhookPool;

/// Display identity of a Roomy user, as learned from `updateProfile` events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileRecord {
    pub name: String,
    pub avatar: Option<String>,
}

/// In-memory directory of profiles seen on the subscription stream.
///
/// The bridge caches profile records and nothing more; full identity
/// resolution stays out of scope. Lost on restart, at which point the
/// AT-proto resolver or a fresh `updateProfile` refills it.
#[derive(Default)]
pub struct ProfileDirectory {
    profiles: Mutex<HashMap<Did, ProfileRecord>>,
}

impl ProfileDirectory {
    pub async fn record(&self, did: Did, name: String, avatar: Option<String>) {
        self.profiles
            .lock()
            .await
            .insert(did, ProfileRecord { name, avatar });
    }

    pub async fn get(&self, did: &Did) -> Option<ProfileRecord> {
        self.profiles.lock().await.get(did).cloned()
    }
}

/// Where a Roomy-originated reaction landed on Discord.
#[derive(Debug, Clone)]
pub struct MirroredReaction {
    pub channel: Snowflake,
    pub message: Snowflake,
    pub emoji: String,
}

/// Reactions the bridge has projected onto Discord, keyed by the Roomy
/// reaction event id, so a later `removeBridgedReaction` can find them.
///
/// In-memory on purpose: if the bridge did not observe the add, the remove
/// is a no-op.
#[derive(Default)]
pub struct ReactionLog {
    reactions: Mutex<HashMap<Ulid, MirroredReaction>>,
}

impl ReactionLog {
    pub async fn record(&self, reaction_event: Ulid, mirrored: MirroredReaction) {
        self.reactions.lock().await.insert(reaction_event, mirrored);
    }

    pub async fn take(&self, reaction_event: Ulid) -> Option<MirroredReaction> {
        self.reactions.lock().await.remove(&reaction_event)
    }
}

pub struct GuildContext {
    pub binding: BindingId,
    pub db: Arc<BridgeDb>,
    pub discord: Arc<dyn DiscordApi>,
    pub leaf: Arc<dyn LeafTransport>,
    pub webhooks: Arc<WebhookPool>,
    pub profiles: Arc<ProfileCache>,
    pub directory: Arc<ProfileDirectory>,
    pub reactions: Arc<ReactionLog>,
    live: AtomicBool,
    /// Highest space index the backfill replay has projected onto Discord.
    /// Catch-up subscription batches dispatch only events past this mark;
    /// everything below it was already covered by the replay.
    replay_mark: AtomicU64,
}

impl GuildContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        binding: BindingId,
        db: Arc<BridgeDb>,
        discord: Arc<dyn DiscordApi>,
        leaf: Arc<dyn LeafTransport>,
        webhooks: Arc<WebhookPool>,
        profiles: Arc<ProfileCache>,
    ) -> Self {
        Self {
            binding,
            db,
            discord,
            leaf,
            webhooks,
            profiles,
            directory: Arc::new(ProfileDirectory::default()),
            reactions: Arc::new(ReactionLog::default()),
            live: AtomicBool::new(false),
            replay_mark: AtomicU64::new(0),
        }
    }

    pub fn guild(&self) -> Snowflake {
        self.binding.guild
    }

    /// Whether backfill has finished and real-time events are admitted.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Relaxed)
    }

    pub fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::Relaxed);
    }

    pub fn replay_mark(&self) -> u64 {
        self.replay_mark.load(Ordering::Relaxed)
    }

    /// Advance the replay high-water mark; never moves it backwards.
    pub fn set_replay_mark(&self, idx: u64) {
        self.replay_mark.fetch_max(idx, Ordering::Relaxed);
    }

    /// Append a single event to the bound space.
    pub async fn send_event(&self, event: RoomyEvent) -> LeafResult<()> {
        self.leaf
            .send_events(&self.binding.space, vec![event])
            .await
    }
}
