//! Shared test harness: an in-memory Discord API plus the in-memory Leaf
//! transport, wired into a live guild context.

use std::collections::{BTreeMap, HashSet};
use std::str::FromStr as _;
use std::sync::Arc;

use async_trait::async_trait;
use roomy_bridge::context::GuildContext;
use roomy_bridge::discord::{
    AttachmentIn, AuthorIn, ChannelInfo, ChannelKind, DiscordApi, DiscordEmoji, DiscordError,
    DiscordResult, MessageIn, ThreadPage, WebhookCredentials, WebhookInfo, WebhookMessage,
};
use roomy_bridge::subscription;
use roomy_bridge::webhooks::WebhookPool;
use roomy_bridge_core::Timestamp;
use roomy_bridge_core::id::{BindingId, Did, Snowflake, SpaceDid};
use roomy_bridge_db::BridgeDb;
use roomy_bridge_leaf::{EventBatch, MemoryLeafTransport, ProfileCache};
use tokio::sync::Mutex;

pub const GUILD: u64 = 100;
pub const SPACE: &str = "did:plc:abc";

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: Snowflake,
    pub content: String,
    pub webhook_id: Option<Snowflake>,
    pub username: Option<String>,
}

#[derive(Debug, Clone)]
struct StoredWebhook {
    id: Snowflake,
    token: String,
    name: String,
}

#[derive(Default)]
struct FakeState {
    next_id: u64,
    channels: BTreeMap<Snowflake, ChannelInfo>,
    messages: BTreeMap<Snowflake, Vec<StoredMessage>>,
    webhooks: BTreeMap<Snowflake, Vec<StoredWebhook>>,
    dead_webhooks: HashSet<Snowflake>,
    pins: BTreeMap<Snowflake, Vec<Snowflake>>,
    reactions: Vec<(Snowflake, Snowflake, String)>,
    webhook_executes: usize,
}

/// In-memory Discord standing in for the REST surface the bridge consumes.
pub struct FakeDiscord {
    state: Mutex<FakeState>,
}

impl FakeDiscord {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState {
                next_id: 5000,
                ..FakeState::default()
            }),
        })
    }

    pub async fn add_text_channel(
        &self,
        id: u64,
        name: &str,
        topic: Option<&str>,
    ) -> ChannelInfo {
        let info = ChannelInfo {
            id: Snowflake::new(id),
            guild: Snowflake::new(GUILD),
            name: name.to_owned(),
            kind: ChannelKind::Text,
            topic: topic.map(str::to_owned),
            parent: None,
        };
        let mut state = self.state.lock().await;
        state.channels.insert(info.id, info.clone());
        state.messages.entry(info.id).or_default();
        info
    }

    pub async fn add_thread(&self, id: u64, name: &str, parent: u64) -> ChannelInfo {
        let info = ChannelInfo {
            id: Snowflake::new(id),
            guild: Snowflake::new(GUILD),
            name: name.to_owned(),
            kind: ChannelKind::PublicThread,
            topic: None,
            parent: Some(Snowflake::new(parent)),
        };
        let mut state = self.state.lock().await;
        state.channels.insert(info.id, info.clone());
        state.messages.entry(info.id).or_default();
        info
    }

    pub async fn pinned(&self, channel: u64) -> Vec<Snowflake> {
        self.state
            .lock()
            .await
            .pins
            .get(&Snowflake::new(channel))
            .cloned()
            .unwrap_or_default()
    }

    pub async fn seed_message(&self, channel: u64, id: u64, content: &str) {
        let mut state = self.state.lock().await;
        state
            .messages
            .entry(Snowflake::new(channel))
            .or_default()
            .push(StoredMessage {
                id: Snowflake::new(id),
                content: content.to_owned(),
                webhook_id: None,
                username: None,
            });
    }

    pub async fn channel(&self, id: u64) -> ChannelInfo {
        self.state.lock().await.channels[&Snowflake::new(id)].clone()
    }

    pub async fn topic(&self, id: u64) -> Option<String> {
        self.state.lock().await.channels[&Snowflake::new(id)]
            .topic
            .clone()
    }

    pub async fn channel_messages(&self, id: u64) -> Vec<StoredMessage> {
        self.state
            .lock()
            .await
            .messages
            .get(&Snowflake::new(id))
            .cloned()
            .unwrap_or_default()
    }

    pub async fn webhook_execute_count(&self) -> usize {
        self.state.lock().await.webhook_executes
    }

    pub async fn channel_count(&self) -> usize {
        self.state.lock().await.channels.len()
    }

    pub async fn reaction_count(&self) -> usize {
        self.state.lock().await.reactions.len()
    }

    /// Simulate someone deleting the channel's webhook out from under the
    /// bridge.
    pub async fn kill_channel_webhooks(&self, channel: u64) {
        let mut state = self.state.lock().await;
        if let Some(webhooks) = state.webhooks.remove(&Snowflake::new(channel)) {
            for webhook in webhooks {
                state.dead_webhooks.insert(webhook.id);
            }
        }
    }

    async fn alloc_id(&self) -> Snowflake {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        Snowflake::new(state.next_id)
    }
}

#[async_trait]
impl DiscordApi for FakeDiscord {
    async fn guild_channels(&self, guild: Snowflake) -> DiscordResult<Vec<ChannelInfo>> {
        Ok(self
            .state
            .lock()
            .await
            .channels
            .values()
            .filter(|c| c.guild == guild)
            .cloned()
            .collect())
    }

    async fn active_threads(&self, guild: Snowflake) -> DiscordResult<Vec<ChannelInfo>> {
        Ok(self
            .state
            .lock()
            .await
            .channels
            .values()
            .filter(|c| c.guild == guild && c.kind.is_thread())
            .cloned()
            .collect())
    }

    async fn archived_threads(
        &self,
        _channel: Snowflake,
        _before: Option<Timestamp>,
    ) -> DiscordResult<ThreadPage> {
        Ok(ThreadPage {
            threads: vec![],
            next_before: None,
        })
    }

    async fn messages_after(
        &self,
        channel: Snowflake,
        after: Option<Snowflake>,
        limit: usize,
    ) -> DiscordResult<Vec<MessageIn>> {
        let state = self.state.lock().await;
        let Some(messages) = state.messages.get(&channel) else {
            return Err(DiscordError::NotFound);
        };
        Ok(messages
            .iter()
            .filter(|m| after.is_none_or(|after| after < m.id))
            .take(limit)
            .map(|m| stored_to_message(channel, m))
            .collect())
    }

    async fn recent_messages(
        &self,
        channel: Snowflake,
        limit: usize,
    ) -> DiscordResult<Vec<MessageIn>> {
        let state = self.state.lock().await;
        let Some(messages) = state.messages.get(&channel) else {
            return Err(DiscordError::NotFound);
        };
        Ok(messages
            .iter()
            .rev()
            .take(limit)
            .map(|m| stored_to_message(channel, m))
            .collect())
    }

    async fn create_text_channel(
        &self,
        guild: Snowflake,
        name: &str,
        topic: &str,
    ) -> DiscordResult<ChannelInfo> {
        let id = self.alloc_id().await;
        let info = ChannelInfo {
            id,
            guild,
            name: name.to_owned(),
            kind: ChannelKind::Text,
            topic: Some(topic.to_owned()),
            parent: None,
        };
        let mut state = self.state.lock().await;
        state.channels.insert(id, info.clone());
        state.messages.entry(id).or_default();
        Ok(info)
    }

    async fn set_channel_topic(&self, channel: Snowflake, topic: &str) -> DiscordResult<()> {
        let mut state = self.state.lock().await;
        let info = state.channels.get_mut(&channel).ok_or(DiscordError::NotFound)?;
        info.topic = Some(topic.to_owned());
        Ok(())
    }

    async fn send_message(&self, channel: Snowflake, content: &str) -> DiscordResult<Snowflake> {
        let id = self.alloc_id().await;
        let mut state = self.state.lock().await;
        state
            .messages
            .get_mut(&channel)
            .ok_or(DiscordError::NotFound)?
            .push(StoredMessage {
                id,
                content: content.to_owned(),
                webhook_id: None,
                username: None,
            });
        Ok(id)
    }

    async fn pin_message(&self, channel: Snowflake, message: Snowflake) -> DiscordResult<()> {
        self.state
            .lock()
            .await
            .pins
            .entry(channel)
            .or_default()
            .push(message);
        Ok(())
    }

    async fn delete_message(&self, channel: Snowflake, message: Snowflake) -> DiscordResult<()> {
        let mut state = self.state.lock().await;
        let messages = state.messages.get_mut(&channel).ok_or(DiscordError::NotFound)?;
        let before = messages.len();
        messages.retain(|m| m.id != message);
        if messages.len() == before {
            return Err(DiscordError::NotFound);
        }
        Ok(())
    }

    async fn add_reaction(
        &self,
        channel: Snowflake,
        message: Snowflake,
        emoji: &DiscordEmoji,
    ) -> DiscordResult<()> {
        self.state
            .lock()
            .await
            .reactions
            .push((channel, message, emoji.key()));
        Ok(())
    }

    async fn remove_own_reaction(
        &self,
        channel: Snowflake,
        message: Snowflake,
        emoji: &DiscordEmoji,
    ) -> DiscordResult<()> {
        let key = emoji.key();
        self.state
            .lock()
            .await
            .reactions
            .retain(|(c, m, k)| !(*c == channel && *m == message && *k == key));
        Ok(())
    }

    async fn channel_webhooks(&self, channel: Snowflake) -> DiscordResult<Vec<WebhookInfo>> {
        Ok(self
            .state
            .lock()
            .await
            .webhooks
            .get(&channel)
            .map(|webhooks| {
                webhooks
                    .iter()
                    .map(|w| WebhookInfo {
                        id: w.id,
                        token: Some(w.token.clone()),
                        name: Some(w.name.clone()),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn create_webhook(
        &self,
        channel: Snowflake,
        name: &str,
    ) -> DiscordResult<WebhookCredentials> {
        let id = self.alloc_id().await;
        let token = format!("token-{id}");
        self.state
            .lock()
            .await
            .webhooks
            .entry(channel)
            .or_default()
            .push(StoredWebhook {
                id,
                token: token.clone(),
                name: name.to_owned(),
            });
        Ok(WebhookCredentials { id, token })
    }

    async fn execute_webhook(
        &self,
        credentials: &WebhookCredentials,
        message: &WebhookMessage,
    ) -> DiscordResult<Snowflake> {
        let id = self.alloc_id().await;
        let mut state = self.state.lock().await;
        if state.dead_webhooks.contains(&credentials.id) {
            return Err(DiscordError::NotFound);
        }
        let Some((channel, _)) = state
            .webhooks
            .iter()
            .find_map(|(channel, webhooks)| {
                webhooks
                    .iter()
                    .find(|w| w.id == credentials.id && w.token == credentials.token)
                    .map(|w| (*channel, w.id))
            })
        else {
            return Err(DiscordError::NotFound);
        };
        state.webhook_executes += 1;
        state
            .messages
            .get_mut(&channel)
            .ok_or(DiscordError::NotFound)?
            .push(StoredMessage {
                id,
                content: message.content.clone(),
                webhook_id: Some(credentials.id),
                username: Some(message.username.clone()),
            });
        Ok(id)
    }

    async fn edit_webhook_message(
        &self,
        credentials: &WebhookCredentials,
        message: Snowflake,
        content: &str,
    ) -> DiscordResult<()> {
        let mut state = self.state.lock().await;
        if state.dead_webhooks.contains(&credentials.id) {
            return Err(DiscordError::NotFound);
        }
        for messages in state.messages.values_mut() {
            if let Some(stored) = messages.iter_mut().find(|m| m.id == message) {
                stored.content = content.to_owned();
                return Ok(());
            }
        }
        Err(DiscordError::NotFound)
    }
}

fn stored_to_message(channel: Snowflake, stored: &StoredMessage) -> MessageIn {
    MessageIn {
        id: stored.id,
        channel,
        guild: Some(Snowflake::new(GUILD)),
        author: AuthorIn {
            id: Snowflake::new(400),
            username: stored.username.clone().unwrap_or_else(|| "user".to_owned()),
            global_name: None,
            discriminator: None,
            avatar_url: None,
            webhook_id: stored.webhook_id,
            is_bot: stored.webhook_id.is_some(),
        },
        content: stored.content.clone(),
        timestamp: Timestamp::from_millis(1_700_000_000_000),
        edited_timestamp: None,
        attachments: vec![],
        reply_to: None,
        nonce: None,
        is_system: false,
    }
}

pub struct Harness {
    pub db: Arc<BridgeDb>,
    pub leaf: Arc<MemoryLeafTransport>,
    pub discord: Arc<FakeDiscord>,
    pub ctx: Arc<GuildContext>,
}

impl Harness {
    pub async fn new() -> Self {
        let db = Arc::new(BridgeDb::new_in_memory().await.expect("open db"));
        let space = SpaceDid::from_str(SPACE).expect("valid did");
        let bridge_did = Did::from_str("did:plc:bridge").expect("valid did");
        let leaf = Arc::new(MemoryLeafTransport::new(bridge_did));
        let discord = FakeDiscord::new();

        db.register_binding(Snowflake::new(GUILD), space.clone())
            .await
            .expect("register binding");

        let webhooks = Arc::new(
            WebhookPool::load(discord.clone(), db.clone())
                .await
                .expect("load pool"),
        );
        let profiles = Arc::new(ProfileCache::new(leaf.clone()));

        let ctx = Arc::new(GuildContext::new(
            BindingId::new(Snowflake::new(GUILD), space),
            db.clone(),
            discord.clone(),
            leaf.clone(),
            webhooks,
            profiles,
        ));
        ctx.set_live(true);

        Self {
            db,
            leaf,
            discord,
            ctx,
        }
    }

    pub fn space(&self) -> SpaceDid {
        self.ctx.binding.space.clone()
    }

    /// Deliver every space event past the cursor through the subscription
    /// handler, as a live batch.
    pub async fn deliver_roomy(&self) {
        use roomy_bridge_leaf::LeafTransport as _;

        let cursor = self
            .db
            .cursor(&self.space())
            .await
            .expect("cursor")
            .unwrap_or(0);
        let envelopes = self
            .leaf
            .fetch_events(&self.space(), cursor + 1, 1000)
            .await
            .expect("fetch");
        if envelopes.is_empty() {
            return;
        }
        subscription::handle_batch(
            &self.ctx,
            &EventBatch {
                envelopes,
                is_backfill: false,
            },
        )
        .await
        .expect("handle batch");
    }

    pub fn message(&self, id: u64, channel: u64, content: &str, author: u64) -> MessageIn {
        MessageIn {
            id: Snowflake::new(id),
            channel: Snowflake::new(channel),
            guild: Some(Snowflake::new(GUILD)),
            author: self.author(author),
            content: content.to_owned(),
            timestamp: Timestamp::from_millis(1_700_000_000_000),
            edited_timestamp: None,
            attachments: vec![],
            reply_to: None,
            nonce: None,
            is_system: false,
        }
    }

    pub fn author(&self, id: u64) -> AuthorIn {
        AuthorIn {
            id: Snowflake::new(id),
            username: format!("user{id}"),
            global_name: Some(format!("User {id}")),
            discriminator: None,
            avatar_url: None,
            webhook_id: None,
            is_bot: false,
        }
    }

    pub fn attachment(&self, name: &str, url: &str) -> AttachmentIn {
        AttachmentIn {
            name: name.to_owned(),
            url: url.to_owned(),
            mime: None,
        }
    }
}
