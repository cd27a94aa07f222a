//! Database table definitions for the bridge.
//!
//! Logical "sublevels" are redb tables; per-binding namespaces become
//! composite keys led by [`BindingId`]. Two tables
//! (`synced_ids` / `synced_ids_rev`) hold the bidirectional id map; both
//! directions are always written in the same transaction, so for every live
//! entry both lookups resolve.

use bincode::{Decode, Encode};
use roomy_bridge_core::Timestamp;
use roomy_bridge_core::id::{BindingId, Snowflake, SpaceDid, Ulid};
use serde::Serialize;

#[macro_export]
macro_rules! def_table {
    ($(#[$outer:meta])*
        $name:ident : $k:ty => $v:ty) => {
        #[allow(unused)]
        $(#[$outer])*
        pub mod $name {
            use super::*;
            pub type Key = $k;
            pub type Value = $v;
            pub type Definition<'a> = redb_bincode::TableDefinition<'a, Key, Value>;
            pub trait ReadableTable: redb_bincode::ReadableTable<Key, Value> {}
            impl<RT> ReadableTable for RT where RT: redb_bincode::ReadableTable<Key, Value> {}
            pub type Table<'a> = redb_bincode::Table<'a, Key, Value>;
            pub const TABLE: Definition = redb_bincode::TableDefinition::new(stringify!($name));
        }
    };
}

// ============================================================================
// SYSTEM TABLES
// ============================================================================

def_table! {
    /// Tracks database/schema version for migrations.
    db_version: () => u64
}

// ============================================================================
// BINDING TABLES
// ============================================================================

def_table! {
    /// Guild -> registered space binding.
    ///
    /// Written together with `bridges_by_space` in one transaction; the two
    /// tables are always each other's inverse.
    bridges_by_guild: Snowflake => BridgeBindingRecord
}

def_table! {
    /// Space -> guild (reverse index of `bridges_by_guild`).
    bridges_by_space: SpaceDid => Snowflake
}

/// What a guild is bound to, and since when.
#[derive(Debug, Encode, Decode, Clone, Serialize)]
pub struct BridgeBindingRecord {
    pub space: SpaceDid,
    pub registered_at: Timestamp,
}

def_table! {
    /// Highest event index durably observed per space, 1-based.
    ///
    /// Only advanced after every side effect of the batch it covers has
    /// committed; resuming from `cursor + 1` yields at-least-once delivery.
    leaf_cursors: SpaceDid => u64
}

// ============================================================================
// SYNCED-ID TABLES
// ============================================================================

def_table! {
    /// Discord -> Roomy id map.
    ///
    /// Key: (binding, discord key). Message ids use the bare snowflake
    /// (`"2000"`); channel/thread ids use a `room:` prefix (`"room:300"`)
    /// because Discord reuses a starter-message snowflake as the thread id.
    synced_ids: (BindingId, String) => Ulid
}

def_table! {
    /// Roomy -> Discord id map (reverse direction of `synced_ids`).
    ///
    /// Key: (binding, roomy key): a bare event ULID for messages,
    /// `room:<ulid>` for rooms, or a 25-char ULID-prefix nonce recorded at
    /// send time.
    synced_ids_rev: (BindingId, String) => Snowflake
}

// ============================================================================
// IDEMPOTENCY TABLES
// ============================================================================

def_table! {
    /// Profile fingerprint per Discord user, to skip redundant profile
    /// updates.
    synced_profiles: (BindingId, Snowflake) => String
}

def_table! {
    /// Outstanding Roomy reaction event per `messageId:userId:emojiKey`.
    ///
    /// Presence means the Roomy side has exactly one live reaction event for
    /// the triple; removed when the reaction is removed.
    synced_reactions: (BindingId, String) => Ulid
}

def_table! {
    /// One sidebar structure fingerprint per binding, replaced in place.
    synced_sidebar_hashes: BindingId => String
}

def_table! {
    /// Room-link event per `parentRoomyId:childRoomyId`.
    synced_room_links: (BindingId, String) => Ulid
}

def_table! {
    /// Last mirrored edit per Discord message, to suppress replayed edits.
    synced_edits: (BindingId, Snowflake) => EditInfoRecord
}

/// The `(editedTimestamp, contentHash)` pair of the last mirrored edit.
#[derive(Debug, Encode, Decode, Clone, PartialEq, Eq, Serialize)]
pub struct EditInfoRecord {
    pub edited_timestamp: Timestamp,
    pub content_hash: String,
}

def_table! {
    /// Recent Discord history index: `nonce:contentHash` -> message
    /// snowflake, per channel.
    ///
    /// Lets Roomy->Discord sync recognize an already-delivered message whose
    /// nonce mapping was lost (e.g. crash between webhook send and mapping
    /// write). History fetches may not carry the nonce; such entries are
    /// keyed `:contentHash` and matched as a fallback.
    discord_message_hashes: (BindingId, Snowflake, String) => Snowflake
}

def_table! {
    /// Newest Discord message processed per channel; bounds backfill scans.
    discord_latest_messages: (BindingId, Snowflake) => Snowflake
}

def_table! {
    /// Webhook credentials per channel. Lazily created, deleted on 404,
    /// recreated on next demand.
    discord_webhook_tokens: Snowflake => WebhookTokenRecord
}

/// Credentials for executing a channel's bridge webhook.
#[derive(Debug, Encode, Decode, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookTokenRecord {
    pub id: Snowflake,
    pub token: String,
}
