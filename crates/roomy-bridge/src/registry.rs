//! Bridge registration and per-guild task supervision.
//!
//! The [`Bridge`] owns the process-wide pieces (repository, Discord API
//! handle, Leaf transport, webhook pool) and one logical task per registered
//! guild. Within a guild everything is serialized by that task; across
//! guilds tasks run in parallel and share nothing but the binding table.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use roomy_bridge_core::error::FmtCompact as _;
use roomy_bridge_core::id::{BindingId, Snowflake, SpaceDid};
use roomy_bridge_db::{BridgeDb, DbError, RegisterOutcome};
use roomy_bridge_leaf::{LeafTransport, ProfileCache, SpaceSubscription};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::context::GuildContext;
use crate::discord::{DiscordApi, DiscordEvent};
use crate::sync::discord_to_roomy;
use crate::webhooks::{WebhookPool, WebhookResult};
use crate::{backfill, subscription};

const LOG_TARGET: &str = "bridge::registry";

const GUILD_EVENT_QUEUE: usize = 1024;
const ROOMY_BATCH_QUEUE: usize = 16;

pub struct Bridge {
    db: Arc<BridgeDb>,
    discord: Arc<dyn DiscordApi>,
    leaf: Arc<dyn LeafTransport>,
    webhooks: Arc<WebhookPool>,
    profiles: Arc<ProfileCache>,
    guilds: Mutex<HashMap<Snowflake, GuildHandle>>,
    shutdown: watch::Sender<bool>,
    app_id: OnceLock<Snowflake>,
}

struct GuildHandle {
    ctx: Arc<GuildContext>,
    events: mpsc::Sender<DiscordEvent>,
    task: JoinHandle<()>,
}

impl Bridge {
    pub async fn new(
        db: Arc<BridgeDb>,
        discord: Arc<dyn DiscordApi>,
        leaf: Arc<dyn LeafTransport>,
    ) -> WebhookResult<Arc<Self>> {
        let webhooks = Arc::new(WebhookPool::load(discord.clone(), db.clone()).await?);
        let profiles = Arc::new(ProfileCache::new(leaf.clone()));
        let (shutdown, _) = watch::channel(false);

        Ok(Arc::new(Self {
            db,
            discord,
            leaf,
            webhooks,
            profiles,
            guilds: Mutex::new(HashMap::new()),
            shutdown,
            app_id: OnceLock::new(),
        }))
    }

    pub fn set_app_id(&self, id: Snowflake) {
        let _ = self.app_id.set(id);
    }

    pub fn db(&self) -> &Arc<BridgeDb> {
        &self.db
    }

    /// Start guild tasks for every binding persisted from previous runs.
    pub async fn resume_bindings(self: &Arc<Self>) {
        let bindings = match self.db.list_bindings().await {
            Ok(bindings) => bindings,
            Err(err) => {
                error!(
                    target: LOG_TARGET,
                    err = %err.fmt_compact(),
                    "Listing bindings failed, resuming nothing"
                );
                return;
            }
        };
        info!(target: LOG_TARGET, count = bindings.len(), "Resuming registered bindings");
        for binding in bindings {
            self.start_guild(binding).await;
        }
    }

    async fn start_guild(self: &Arc<Self>, binding: BindingId) {
        let mut guilds = self.guilds.lock().await;
        if guilds.contains_key(&binding.guild) {
            return;
        }

        let ctx = Arc::new(GuildContext::new(
            binding.clone(),
            self.db.clone(),
            self.discord.clone(),
            self.leaf.clone(),
            self.webhooks.clone(),
            self.profiles.clone(),
        ));
        let (events_tx, events_rx) = mpsc::channel(GUILD_EVENT_QUEUE);
        let task = tokio::spawn(run_guild(ctx.clone(), events_rx, self.shutdown.subscribe()));

        info!(target: LOG_TARGET, guild = %binding.guild, space = %binding.space, "Guild task started");
        guilds.insert(
            binding.guild,
            GuildHandle {
                ctx,
                events: events_tx,
                task,
            },
        );
    }

    async fn stop_guild(&self, guild: Snowflake) {
        if let Some(handle) = self.guilds.lock().await.remove(&guild) {
            handle.task.abort();
            info!(target: LOG_TARGET, %guild, "Guild task stopped");
        }
    }

    /// Hand a normalized gateway event to its guild task, dropping it (with
    /// a warning) when the guild is not registered or its queue is full.
    pub async fn route_event(&self, guild: Snowflake, event: DiscordEvent) {
        let guilds = self.guilds.lock().await;
        let Some(handle) = guilds.get(&guild) else {
            return;
        };
        if let Err(err) = handle.events.try_send(event) {
            warn!(target: LOG_TARGET, %guild, %err, "Guild event queue rejected event");
        }
    }

    // ── Operator surface ────────────────────────────────────────────────

    pub async fn connect(self: &Arc<Self>, guild: Snowflake, space_input: &str) -> String {
        let Some(space) = parse_space(space_input) else {
            return "That does not look like a Roomy space URL or DID.".to_owned();
        };

        match self.db.register_binding(guild, space.clone()).await {
            Ok(RegisterOutcome::AlreadyRegistered) => {
                "This guild is already connected to that space.".to_owned()
            }
            Ok(RegisterOutcome::Inserted) => {
                self.start_guild(BindingId::new(guild, space.clone())).await;
                format!("Connected to `{space}`. Backfill is running; history will appear shortly.")
            }
            Err(DbError::BindingCollision { .. }) => {
                "This guild or that space is already bridged elsewhere; disconnect it first."
                    .to_owned()
            }
            Err(err) => {
                error!(target: LOG_TARGET, %guild, err = %err.fmt_compact(), "Binding registration failed");
                "Internal error while registering the bridge.".to_owned()
            }
        }
    }

    pub async fn disconnect(&self, guild: Snowflake) -> String {
        match self.db.unregister_binding(guild).await {
            Ok(Some(space)) => {
                self.stop_guild(guild).await;
                format!("Disconnected from `{space}`.")
            }
            Ok(None) => "This guild is not connected to any space.".to_owned(),
            Err(err) => {
                error!(target: LOG_TARGET, %guild, err = %err.fmt_compact(), "Unregistering failed");
                "Internal error while disconnecting.".to_owned()
            }
        }
    }

    pub async fn info(&self, guild: Snowflake) -> String {
        let app = self
            .app_id
            .get()
            .map(Snowflake::to_string)
            .unwrap_or_else(|| "unknown".to_owned());

        let Ok(Some(space)) = self.db.binding_for_guild(guild).await else {
            return format!("Application id: {app}\nThis guild is not connected to a Roomy space.");
        };

        let cursor = self
            .db
            .cursor(&space)
            .await
            .ok()
            .flatten()
            .map(|idx| idx.to_string())
            .unwrap_or_else(|| "none".to_owned());
        let live = {
            let guilds = self.guilds.lock().await;
            guilds.get(&guild).is_some_and(|handle| handle.ctx.is_live())
        };

        format!(
            "Application id: {app}\nBound space: `{space}`\nLeaf cursor: {cursor}\nAccepting real-time events: {live}"
        )
    }

    /// Stop accepting work and let in-flight guild tasks finish within the
    /// grace period.
    pub async fn shutdown(&self, grace: Duration) {
        let _ = self.shutdown.send(true);

        let handles: Vec<GuildHandle> = {
            let mut guilds = self.guilds.lock().await;
            guilds.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            let guild = handle.ctx.guild();
            let abort = handle.task.abort_handle();
            if tokio::time::timeout(grace, handle.task).await.is_err() {
                abort.abort();
                warn!(
                    target: LOG_TARGET,
                    %guild,
                    "Guild task exceeded shutdown grace, aborting"
                );
            }
        }
    }
}

/// Accept a bare space DID or a `https://roomy.space/<did>` URL.
pub fn parse_space(input: &str) -> Option<SpaceDid> {
    let trimmed = input.trim();
    if let Ok(did) = trimmed.parse() {
        return Some(did);
    }
    let rest = trimmed
        .strip_prefix("https://roomy.space/")
        .or_else(|| trimmed.strip_prefix("roomy.space/"))?;
    rest.split('/').next()?.parse().ok()
}

/// The per-guild logical task: one backfill pass, then a serialized loop
/// over the two inbound streams.
async fn run_guild(
    ctx: Arc<GuildContext>,
    mut events: mpsc::Receiver<DiscordEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Err(err) = backfill::run(&ctx).await {
        error!(
            target: LOG_TARGET,
            guild = %ctx.guild(),
            err = %err.fmt_compact(),
            "Backfill failed; real-time Discord events stay parked until restart"
        );
    }

    let start = match ctx.db.cursor(&ctx.binding.space).await {
        Ok(cursor) => cursor.unwrap_or(0) + 1,
        Err(err) => {
            error!(
                target: LOG_TARGET,
                guild = %ctx.guild(),
                err = %err.fmt_compact(),
                "Cursor read failed, guild task exiting"
            );
            return;
        }
    };

    let (batch_tx, mut batches) = mpsc::channel(ROOMY_BATCH_QUEUE);
    let subscription_task = SpaceSubscription::spawn(
        ctx.leaf.clone(),
        ctx.binding.space.clone(),
        start,
        batch_tx,
        shutdown.clone(),
    );

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    if !ctx.is_live() {
                        debug!(target: LOG_TARGET, guild = %ctx.guild(), "Dropping event before live");
                        continue;
                    }
                    if let Err(err) = discord_to_roomy::apply_event(&ctx, &event).await {
                        warn!(
                            target: LOG_TARGET,
                            guild = %ctx.guild(),
                            err = %err.fmt_compact(),
                            "Discord event sync failed"
                        );
                    }
                }
                None => break,
            },
            batch = batches.recv() => match batch {
                Some(batch) => {
                    if let Err(err) = subscription::handle_batch(&ctx, &batch).await {
                        error!(
                            target: LOG_TARGET,
                            guild = %ctx.guild(),
                            err = %err.fmt_compact(),
                            "Batch materialization failed; cursor not advanced"
                        );
                    }
                }
                None => break,
            },
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    // The pump only notices a dropped receiver on its next send; don't wait
    // for that.
    subscription_task.abort();
    let _ = subscription_task.await;
    debug!(target: LOG_TARGET, guild = %ctx.guild(), "Guild task finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_space_accepts_did_and_url() {
        let did: SpaceDid = "did:plc:abc".parse().expect("valid did");
        assert_eq!(parse_space("did:plc:abc"), Some(did.clone()));
        assert_eq!(parse_space("https://roomy.space/did:plc:abc"), Some(did.clone()));
        assert_eq!(
            parse_space("https://roomy.space/did:plc:abc/01HZ5KJVM7X6YM8QPE7YV4Q0ZY"),
            Some(did.clone())
        );
        assert_eq!(parse_space("  roomy.space/did:plc:abc "), Some(did));
        assert_eq!(parse_space("https://example.com/did:plc:abc"), None);
        assert_eq!(parse_space("not-a-did"), None);
    }
}
