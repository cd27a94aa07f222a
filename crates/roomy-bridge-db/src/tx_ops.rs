//! Typed repository operations.
//!
//! Every operation exists in two forms: an async method that runs in its own
//! transaction, and a `*_tx` function that composes into a caller-owned
//! [`WriteTransaction`] when several writes belong to one logical step
//! (e.g. a mapping registration plus the edit info it carries).

use redb_bincode::ReadTransaction;
use roomy_bridge_core::Timestamp;
use roomy_bridge_core::id::{BindingId, Snowflake, SpaceDid, Ulid};
use tracing::debug;

use crate::{
    BindingCollisionSnafu, BridgeBindingRecord, BridgeDb, DbResult, EditInfoRecord,
    MappingCollisionSnafu, WebhookTokenRecord, WriteTransaction, bridges_by_guild,
    bridges_by_space, discord_latest_messages, discord_message_hashes, discord_webhook_tokens,
    leaf_cursors, synced_edits, synced_ids, synced_ids_rev, synced_profiles, synced_reactions,
    synced_room_links, synced_sidebar_hashes,
};

const LOG_TARGET: &str = "bridge::db";

/// Which of the two disjoint key spaces a synced-id entry lives in.
///
/// Message ids use the bare snowflake; channel/thread ids are prefixed with
/// `room:` because Discord reuses a thread's starter-message snowflake as
/// the thread id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingKind {
    Message,
    Room,
}

impl MappingKind {
    pub fn discord_key(self, id: Snowflake) -> String {
        match self {
            MappingKind::Message => id.to_string(),
            MappingKind::Room => format!("room:{id}"),
        }
    }

    pub fn roomy_key(self, id: Ulid) -> String {
        match self {
            MappingKind::Message => id.to_string(),
            MappingKind::Room => format!("room:{id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Inserted,
    /// The exact same pair was already present; callers treat this as
    /// success.
    AlreadyRegistered,
}

// ============================================================================
// Bindings
// ============================================================================

impl BridgeDb {
    pub async fn register_binding(
        &self,
        guild: Snowflake,
        space: SpaceDid,
    ) -> DbResult<RegisterOutcome> {
        self.write_with(|tx| Self::register_binding_tx(tx, guild, &space))
            .await
    }

    pub fn register_binding_tx(
        tx: &WriteTransaction,
        guild: Snowflake,
        space: &SpaceDid,
    ) -> DbResult<RegisterOutcome> {
        let mut by_guild = tx.open_table(&bridges_by_guild::TABLE)?;
        let mut by_space = tx.open_table(&bridges_by_space::TABLE)?;

        let existing_space = by_guild.get(&guild)?.map(|g| g.value().space);
        let existing_guild = by_space.get(space)?.map(|g| g.value());

        match (existing_space, existing_guild) {
            (Some(s), Some(g)) if s == *space && g == guild => {
                return Ok(RegisterOutcome::AlreadyRegistered);
            }
            (None, None) => {}
            _ => return BindingCollisionSnafu.fail(),
        }

        by_guild.insert(
            &guild,
            &BridgeBindingRecord {
                space: space.clone(),
                registered_at: Timestamp::now(),
            },
        )?;
        by_space.insert(space, &guild)?;
        Ok(RegisterOutcome::Inserted)
    }

    pub async fn unregister_binding(&self, guild: Snowflake) -> DbResult<Option<SpaceDid>> {
        self.write_with(|tx| {
            let mut by_guild = tx.open_table(&bridges_by_guild::TABLE)?;
            let mut by_space = tx.open_table(&bridges_by_space::TABLE)?;

            let Some(record) = by_guild.remove(&guild)?.map(|g| g.value()) else {
                return Ok(None);
            };
            by_space.remove(&record.space)?;
            Ok(Some(record.space))
        })
        .await
    }

    pub async fn binding_for_guild(&self, guild: Snowflake) -> DbResult<Option<SpaceDid>> {
        self.read_with(|tx| {
            let by_guild = tx.open_table(&bridges_by_guild::TABLE)?;
            Ok(by_guild.get(&guild)?.map(|g| g.value().space))
        })
        .await
    }

    pub async fn binding_for_space(&self, space: &SpaceDid) -> DbResult<Option<Snowflake>> {
        self.read_with(|tx| Self::binding_for_space_tx(tx, space)).await
    }

    pub fn binding_for_space_tx(
        tx: &ReadTransaction,
        space: &SpaceDid,
    ) -> DbResult<Option<Snowflake>> {
        let by_space = tx.open_table(&bridges_by_space::TABLE)?;
        Ok(by_space.get(space)?.map(|g| g.value()))
    }

    pub async fn list_bindings(&self) -> DbResult<Vec<BindingId>> {
        self.read_with(|tx| {
            let by_guild = tx.open_table(&bridges_by_guild::TABLE)?;
            let mut bindings = Vec::new();
            for entry in by_guild.range::<Snowflake>(..)? {
                let (guild, record) = entry?;
                bindings.push(BindingId::new(guild.value(), record.value().space));
            }
            Ok(bindings)
        })
        .await
    }
}

// ============================================================================
// Synced-id mappings
// ============================================================================

impl BridgeDb {
    /// Register a Discord <-> Roomy id pair, writing both directions
    /// atomically. Re-registering the identical pair is a no-op; a conflict
    /// on either side is an error.
    pub async fn register_mapping(
        &self,
        binding: &BindingId,
        kind: MappingKind,
        discord_id: Snowflake,
        roomy_id: Ulid,
    ) -> DbResult<RegisterOutcome> {
        self.write_with(|tx| Self::register_mapping_tx(tx, binding, kind, discord_id, roomy_id))
            .await
    }

    pub fn register_mapping_tx(
        tx: &WriteTransaction,
        binding: &BindingId,
        kind: MappingKind,
        discord_id: Snowflake,
        roomy_id: Ulid,
    ) -> DbResult<RegisterOutcome> {
        let mut fwd = tx.open_table(&synced_ids::TABLE)?;
        let mut rev = tx.open_table(&synced_ids_rev::TABLE)?;

        let discord_key = kind.discord_key(discord_id);
        let roomy_key = kind.roomy_key(roomy_id);

        let fwd_key = (binding.clone(), discord_key.clone());
        let rev_key = (binding.clone(), roomy_key.clone());

        let existing_roomy = fwd.get(&fwd_key)?.map(|g| g.value());
        let existing_discord = rev.get(&rev_key)?.map(|g| g.value());

        match (existing_roomy, existing_discord) {
            (Some(r), Some(d)) if r == roomy_id && d == discord_id => {
                return Ok(RegisterOutcome::AlreadyRegistered);
            }
            (None, None) => {}
            _ => {
                return MappingCollisionSnafu { key: discord_key }.fail();
            }
        }

        fwd.insert(&fwd_key, &roomy_id)?;
        rev.insert(&rev_key, &discord_id)?;
        debug!(
            target: LOG_TARGET,
            binding = %binding,
            discord = %discord_key,
            roomy = %roomy_key,
            "Registered id mapping"
        );
        Ok(RegisterOutcome::Inserted)
    }

    /// Record a send-time nonce -> snowflake entry. Reverse-direction only:
    /// its forward companion is the snowflake -> event-id entry.
    pub fn register_nonce_tx(
        tx: &WriteTransaction,
        binding: &BindingId,
        nonce: &str,
        discord_id: Snowflake,
    ) -> DbResult<RegisterOutcome> {
        let mut rev = tx.open_table(&synced_ids_rev::TABLE)?;
        let rev_key = (binding.clone(), nonce.to_owned());

        let existing = rev.get(&rev_key)?.map(|g| g.value());
        match existing {
            Some(existing) if existing == discord_id => Ok(RegisterOutcome::AlreadyRegistered),
            Some(_) => MappingCollisionSnafu {
                key: nonce.to_owned(),
            }
            .fail(),
            None => {
                rev.insert(&rev_key, &discord_id)?;
                Ok(RegisterOutcome::Inserted)
            }
        }
    }

    pub async fn get_roomy_id(
        &self,
        binding: &BindingId,
        discord_key: &str,
    ) -> DbResult<Option<Ulid>> {
        self.read_with(|tx| {
            let fwd = tx.open_table(&synced_ids::TABLE)?;
            Ok(fwd
                .get(&(binding.clone(), discord_key.to_owned()))?
                .map(|g| g.value()))
        })
        .await
    }

    pub async fn get_discord_id(
        &self,
        binding: &BindingId,
        roomy_key: &str,
    ) -> DbResult<Option<Snowflake>> {
        self.read_with(|tx| {
            let rev = tx.open_table(&synced_ids_rev::TABLE)?;
            Ok(rev
                .get(&(binding.clone(), roomy_key.to_owned()))?
                .map(|g| g.value()))
        })
        .await
    }

    /// Remove a mapping by its Roomy id, both directions in one write.
    /// Returns the Discord id that was mapped, if any.
    pub fn unregister_mapping_by_roomy_tx(
        tx: &WriteTransaction,
        binding: &BindingId,
        kind: MappingKind,
        roomy_id: Ulid,
    ) -> DbResult<Option<Snowflake>> {
        let mut fwd = tx.open_table(&synced_ids::TABLE)?;
        let mut rev = tx.open_table(&synced_ids_rev::TABLE)?;

        let roomy_key = (binding.clone(), kind.roomy_key(roomy_id));
        let Some(discord_id) = rev.remove(&roomy_key)?.map(|g| g.value()) else {
            return Ok(None);
        };
        fwd.remove(&(binding.clone(), kind.discord_key(discord_id)))?;
        // Drop the send-time nonce entry too, if one was recorded.
        if kind == MappingKind::Message {
            rev.remove(&(binding.clone(), roomy_id.nonce()))?;
        }
        Ok(Some(discord_id))
    }

    /// All live Discord-key -> Roomy-id entries for a binding.
    pub async fn list_mappings(&self, binding: &BindingId) -> DbResult<Vec<(String, Ulid)>> {
        self.read_with(|tx| {
            let fwd = tx.open_table(&synced_ids::TABLE)?;
            let mut mappings = Vec::new();
            for entry in fwd.range::<(BindingId, String)>(..)? {
                let (key, value) = entry?;
                let (entry_binding, discord_key) = key.value();
                if entry_binding == *binding {
                    mappings.push((discord_key, value.value()));
                }
            }
            Ok(mappings)
        })
        .await
    }

    /// All reverse (Roomy-key -> Discord-id) entries for a binding.
    pub async fn list_reverse_mappings(
        &self,
        binding: &BindingId,
    ) -> DbResult<Vec<(String, Snowflake)>> {
        self.read_with(|tx| {
            let rev = tx.open_table(&synced_ids_rev::TABLE)?;
            let mut mappings = Vec::new();
            for entry in rev.range::<(BindingId, String)>(..)? {
                let (key, value) = entry?;
                let (entry_binding, roomy_key) = key.value();
                if entry_binding == *binding {
                    mappings.push((roomy_key, value.value()));
                }
            }
            Ok(mappings)
        })
        .await
    }
}

// ============================================================================
// Cursors
// ============================================================================

impl BridgeDb {
    pub async fn cursor(&self, space: &SpaceDid) -> DbResult<Option<u64>> {
        self.read_with(|tx| {
            let cursors = tx.open_table(&leaf_cursors::TABLE)?;
            Ok(cursors.get(space)?.map(|g| g.value()))
        })
        .await
    }

    pub async fn set_cursor(&self, space: &SpaceDid, idx: u64) -> DbResult<()> {
        self.write_with(|tx| Self::set_cursor_tx(tx, space, idx)).await
    }

    /// Advance the cursor; never moves it backwards.
    pub fn set_cursor_tx(tx: &WriteTransaction, space: &SpaceDid, idx: u64) -> DbResult<()> {
        let mut cursors = tx.open_table(&leaf_cursors::TABLE)?;
        let current = cursors.get(space)?.map(|g| g.value()).unwrap_or(0);
        if current < idx {
            cursors.insert(space, &idx)?;
        }
        Ok(())
    }
}

// ============================================================================
// Fingerprints, edit info, reactions, room links
// ============================================================================

impl BridgeDb {
    pub async fn profile_hash(
        &self,
        binding: &BindingId,
        user: Snowflake,
    ) -> DbResult<Option<String>> {
        self.read_with(|tx| {
            let profiles = tx.open_table(&synced_profiles::TABLE)?;
            Ok(profiles.get(&(binding.clone(), user))?.map(|g| g.value()))
        })
        .await
    }

    pub fn set_profile_hash_tx(
        tx: &WriteTransaction,
        binding: &BindingId,
        user: Snowflake,
        hash: &str,
    ) -> DbResult<()> {
        let mut profiles = tx.open_table(&synced_profiles::TABLE)?;
        profiles.insert(&(binding.clone(), user), &hash.to_owned())?;
        Ok(())
    }

    pub async fn sidebar_hash(&self, binding: &BindingId) -> DbResult<Option<String>> {
        self.read_with(|tx| {
            let hashes = tx.open_table(&synced_sidebar_hashes::TABLE)?;
            Ok(hashes.get(binding)?.map(|g| g.value()))
        })
        .await
    }

    pub fn set_sidebar_hash_tx(
        tx: &WriteTransaction,
        binding: &BindingId,
        hash: &str,
    ) -> DbResult<()> {
        let mut hashes = tx.open_table(&synced_sidebar_hashes::TABLE)?;
        hashes.insert(binding, &hash.to_owned())?;
        Ok(())
    }

    pub async fn edit_info(
        &self,
        binding: &BindingId,
        message: Snowflake,
    ) -> DbResult<Option<EditInfoRecord>> {
        self.read_with(|tx| {
            let edits = tx.open_table(&synced_edits::TABLE)?;
            Ok(edits.get(&(binding.clone(), message))?.map(|g| g.value()))
        })
        .await
    }

    pub fn set_edit_info_tx(
        tx: &WriteTransaction,
        binding: &BindingId,
        message: Snowflake,
        info: &EditInfoRecord,
    ) -> DbResult<()> {
        let mut edits = tx.open_table(&synced_edits::TABLE)?;
        edits.insert(&(binding.clone(), message), info)?;
        Ok(())
    }

    pub async fn reaction_id(&self, binding: &BindingId, key: &str) -> DbResult<Option<Ulid>> {
        self.read_with(|tx| {
            let reactions = tx.open_table(&synced_reactions::TABLE)?;
            Ok(reactions
                .get(&(binding.clone(), key.to_owned()))?
                .map(|g| g.value()))
        })
        .await
    }

    pub async fn set_reaction_id(
        &self,
        binding: &BindingId,
        key: &str,
        event_id: Ulid,
    ) -> DbResult<()> {
        self.write_with(|tx| {
            let mut reactions = tx.open_table(&synced_reactions::TABLE)?;
            reactions.insert(&(binding.clone(), key.to_owned()), &event_id)?;
            Ok(())
        })
        .await
    }

    pub async fn remove_reaction_id(
        &self,
        binding: &BindingId,
        key: &str,
    ) -> DbResult<Option<Ulid>> {
        self.write_with(|tx| {
            let mut reactions = tx.open_table(&synced_reactions::TABLE)?;
            Ok(reactions
                .remove(&(binding.clone(), key.to_owned()))?
                .map(|g| g.value()))
        })
        .await
    }

    pub async fn room_link_id(&self, binding: &BindingId, key: &str) -> DbResult<Option<Ulid>> {
        self.read_with(|tx| {
            let links = tx.open_table(&synced_room_links::TABLE)?;
            Ok(links
                .get(&(binding.clone(), key.to_owned()))?
                .map(|g| g.value()))
        })
        .await
    }

    pub fn set_room_link_id_tx(
        tx: &WriteTransaction,
        binding: &BindingId,
        key: &str,
        event_id: Ulid,
    ) -> DbResult<()> {
        let mut links = tx.open_table(&synced_room_links::TABLE)?;
        links.insert(&(binding.clone(), key.to_owned()), &event_id)?;
        Ok(())
    }
}

// ============================================================================
// Discord-side bookkeeping
// ============================================================================

impl BridgeDb {
    pub async fn latest_seen(
        &self,
        binding: &BindingId,
        channel: Snowflake,
    ) -> DbResult<Option<Snowflake>> {
        self.read_with(|tx| {
            let latest = tx.open_table(&discord_latest_messages::TABLE)?;
            Ok(latest.get(&(binding.clone(), channel))?.map(|g| g.value()))
        })
        .await
    }

    pub async fn set_latest_seen(
        &self,
        binding: &BindingId,
        channel: Snowflake,
        message: Snowflake,
    ) -> DbResult<()> {
        self.write_with(|tx| {
            let mut latest = tx.open_table(&discord_latest_messages::TABLE)?;
            let key = (binding.clone(), channel);
            let current = latest.get(&key)?.map(|g| g.value());
            // Snowflakes are time-ordered; never move the bound backwards.
            if current.is_none_or(|c| c < message) {
                latest.insert(&key, &message)?;
            }
            Ok(())
        })
        .await
    }

    /// Look up a history-indexed message by `nonce:contentHash`, falling
    /// back to the nonce-less `:contentHash` form recorded when a history
    /// fetch did not carry the nonce.
    pub async fn message_hash_lookup(
        &self,
        binding: &BindingId,
        channel: Snowflake,
        nonce: &str,
        content_hash: &str,
    ) -> DbResult<Option<Snowflake>> {
        self.read_with(|tx| {
            let hashes = tx.open_table(&discord_message_hashes::TABLE)?;
            let exact = (binding.clone(), channel, format!("{nonce}:{content_hash}"));
            if let Some(found) = hashes.get(&exact)?.map(|g| g.value()) {
                return Ok(Some(found));
            }
            let fallback = (binding.clone(), channel, format!(":{content_hash}"));
            Ok(hashes.get(&fallback)?.map(|g| g.value()))
        })
        .await
    }

    pub fn index_message_hash_tx(
        tx: &WriteTransaction,
        binding: &BindingId,
        channel: Snowflake,
        nonce: Option<&str>,
        content_hash: &str,
        message: Snowflake,
    ) -> DbResult<()> {
        let mut hashes = tx.open_table(&discord_message_hashes::TABLE)?;
        let key = format!("{}:{content_hash}", nonce.unwrap_or(""));
        hashes.insert(&(binding.clone(), channel, key), &message)?;
        Ok(())
    }

    pub async fn webhook_token(&self, channel: Snowflake) -> DbResult<Option<WebhookTokenRecord>> {
        self.read_with(|tx| {
            let tokens = tx.open_table(&discord_webhook_tokens::TABLE)?;
            Ok(tokens.get(&channel)?.map(|g| g.value()))
        })
        .await
    }

    pub async fn set_webhook_token(
        &self,
        channel: Snowflake,
        record: &WebhookTokenRecord,
    ) -> DbResult<()> {
        self.write_with(|tx| {
            let mut tokens = tx.open_table(&discord_webhook_tokens::TABLE)?;
            tokens.insert(&channel, record)?;
            Ok(())
        })
        .await
    }

    pub async fn list_webhook_tokens(&self) -> DbResult<Vec<(Snowflake, WebhookTokenRecord)>> {
        self.read_with(|tx| {
            let tokens = tx.open_table(&discord_webhook_tokens::TABLE)?;
            let mut out = Vec::new();
            for entry in tokens.range::<Snowflake>(..)? {
                let (channel, record) = entry?;
                out.push((channel.value(), record.value()));
            }
            Ok(out)
        })
        .await
    }

    pub async fn clear_webhook_token(&self, channel: Snowflake) -> DbResult<()> {
        self.write_with(|tx| {
            let mut tokens = tx.open_table(&discord_webhook_tokens::TABLE)?;
            tokens.remove(&channel)?;
            Ok(())
        })
        .await
    }
}
