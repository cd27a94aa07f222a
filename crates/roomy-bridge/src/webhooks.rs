//! Per-channel webhook pool.
//!
//! Each channel the bridge impersonates users in gets exactly one webhook,
//! found or created on demand and cached both in memory and in the token
//! table so it survives restarts. A webhook cycles through
//! `Absent -> Acquiring -> Cached -> Invalidated -> Acquiring`: a 404 from
//! execute invalidates the cache entry and triggers a single re-acquire; a
//! 429 is retried with bounded backoff honoring the server's retry-after.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use roomy_bridge_core::id::Snowflake;
use roomy_bridge_db::{BridgeDb, WebhookTokenRecord};
use snafu::{ResultExt as _, Snafu};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::discord::{
    BRIDGE_WEBHOOK_NAME, DiscordApi, DiscordError, WebhookCredentials, WebhookMessage,
};

const LOG_TARGET: &str = "bridge::webhooks";

const MAX_EXECUTE_ATTEMPTS: usize = 4;
const RATE_LIMIT_BACKOFF_CAP: Duration = Duration::from_secs(30);

#[derive(Debug, Snafu)]
pub enum WebhookError {
    #[snafu(display("Discord webhook call failed: {source}"))]
    Discord { source: DiscordError },
    #[snafu(display("Webhook token store failed: {source}"))]
    Db { source: roomy_bridge_db::DbError },
    #[snafu(display("Webhook execute attempts exhausted"))]
    AttemptsExhausted,
}

pub type WebhookResult<T> = std::result::Result<T, WebhookError>;

pub struct WebhookPool {
    api: Arc<dyn DiscordApi>,
    db: Arc<BridgeDb>,
    cache: Mutex<HashMap<Snowflake, WebhookCredentials>>,
    /// Ids of every webhook the bridge has ever held, for loop suppression:
    /// messages authored by these must never re-enter Roomy.
    known_ids: Mutex<HashSet<Snowflake>>,
}

impl WebhookPool {
    /// Build the pool, seeding the cache from persisted tokens.
    pub async fn load(api: Arc<dyn DiscordApi>, db: Arc<BridgeDb>) -> WebhookResult<Self> {
        let persisted = db.list_webhook_tokens().await.context(DbSnafu)?;

        let mut cache = HashMap::new();
        let mut known_ids = HashSet::new();
        for (channel, record) in persisted {
            known_ids.insert(record.id);
            cache.insert(
                channel,
                WebhookCredentials {
                    id: record.id,
                    token: record.token,
                },
            );
        }

        debug!(target: LOG_TARGET, cached = cache.len(), "Webhook pool loaded");

        Ok(Self {
            api,
            db,
            cache: Mutex::new(cache),
            known_ids: Mutex::new(known_ids),
        })
    }

    pub async fn is_own_webhook(&self, id: Snowflake) -> bool {
        self.known_ids.lock().await.contains(&id)
    }

    /// Get the channel's webhook, fetching or creating one on cache miss.
    pub async fn acquire(&self, channel: Snowflake) -> WebhookResult<WebhookCredentials> {
        if let Some(credentials) = self.cache.lock().await.get(&channel) {
            return Ok(credentials.clone());
        }

        let credentials = match self.find_existing(channel).await? {
            Some(credentials) => credentials,
            None => self
                .api
                .create_webhook(channel, BRIDGE_WEBHOOK_NAME)
                .await
                .context(DiscordSnafu)?,
        };

        self.db
            .set_webhook_token(
                channel,
                &WebhookTokenRecord {
                    id: credentials.id,
                    token: credentials.token.clone(),
                },
            )
            .await
            .context(DbSnafu)?;
        self.known_ids.lock().await.insert(credentials.id);
        self.cache
            .lock()
            .await
            .insert(channel, credentials.clone());

        debug!(target: LOG_TARGET, %channel, webhook = %credentials.id, "Webhook acquired");
        Ok(credentials)
    }

    async fn find_existing(&self, channel: Snowflake) -> WebhookResult<Option<WebhookCredentials>> {
        let webhooks = self
            .api
            .channel_webhooks(channel)
            .await
            .context(DiscordSnafu)?;
        Ok(webhooks.into_iter().find_map(|info| {
            let token = info.token?;
            (info.name.as_deref() == Some(BRIDGE_WEBHOOK_NAME)).then_some(WebhookCredentials {
                id: info.id,
                token,
            })
        }))
    }

    /// Drop a channel's cached webhook after the remote side deleted it.
    pub async fn invalidate(&self, channel: Snowflake) -> WebhookResult<()> {
        self.cache.lock().await.remove(&channel);
        self.db
            .clear_webhook_token(channel)
            .await
            .context(DbSnafu)?;
        Ok(())
    }

    /// Execute the channel's webhook, re-acquiring once on 404 and backing
    /// off on rate limits. Returns the created message id.
    #[instrument(name = "webhook.execute", skip_all, fields(channel = %channel))]
    pub async fn execute(
        &self,
        channel: Snowflake,
        message: &WebhookMessage,
    ) -> WebhookResult<Snowflake> {
        let mut reacquired = false;

        for attempt in 0..MAX_EXECUTE_ATTEMPTS {
            let credentials = self.acquire(channel).await?;

            match self.api.execute_webhook(&credentials, message).await {
                Ok(id) => return Ok(id),
                Err(DiscordError::NotFound) => {
                    // Webhook was deleted externally; one fresh acquire.
                    self.invalidate(channel).await?;
                    if reacquired {
                        return Err(WebhookError::Discord {
                            source: DiscordError::NotFound,
                        });
                    }
                    reacquired = true;
                    warn!(target: LOG_TARGET, %channel, "Webhook gone, re-acquiring");
                }
                Err(DiscordError::RateLimited { retry_after }) => {
                    let backoff = retry_after
                        .saturating_mul(1u32 << attempt.min(4) as u32)
                        .min(RATE_LIMIT_BACKOFF_CAP);
                    warn!(
                        target: LOG_TARGET,
                        %channel,
                        ?backoff,
                        "Webhook rate limited"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => return Err(WebhookError::Discord { source: err }),
            }
        }

        Err(WebhookError::AttemptsExhausted)
    }

    /// Edit a message previously posted through the channel's webhook.
    pub async fn edit_message(
        &self,
        channel: Snowflake,
        message: Snowflake,
        content: &str,
    ) -> WebhookResult<()> {
        let credentials = self.acquire(channel).await?;
        match self
            .api
            .edit_webhook_message(&credentials, message, content)
            .await
        {
            Ok(()) => Ok(()),
            Err(DiscordError::NotFound) => {
                self.invalidate(channel).await?;
                let credentials = self.acquire(channel).await?;
                self.api
                    .edit_webhook_message(&credentials, message, content)
                    .await
                    .context(DiscordSnafu)
            }
            Err(err) => Err(WebhookError::Discord { source: err }),
        }
    }
}
