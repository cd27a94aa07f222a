//! The two translator families.
//!
//! [`discord_to_roomy`] turns normalized Discord events into origin-stamped
//! Roomy events; [`roomy_to_discord`] projects Roomy events onto Discord
//! through the webhook pool. Both are plain functions over a
//! [`GuildContext`]; idempotency lives in the repository lookups they gate
//! on, so replaying any input is safe.

pub mod discord_to_roomy;
pub mod roomy_to_discord;

use roomy_bridge_core::id::{Snowflake, Ulid};
use roomy_bridge_db::{DbError, DbResult, MappingKind, RegisterOutcome};
use snafu::Snafu;
use tracing::debug;

use crate::context::GuildContext;
use crate::discord::DiscordError;
use crate::webhooks::WebhookError;

const LOG_TARGET: &str = "bridge::sync";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SyncError {
    #[snafu(display("Repository failure: {source}"))]
    Db { source: DbError },
    #[snafu(display("Leaf write failed: {source}"))]
    Leaf { source: roomy_bridge_leaf::LeafError },
    #[snafu(display("Discord call failed: {source}"))]
    Discord { source: DiscordError },
    #[snafu(display("Webhook failed: {source}"))]
    Webhook { source: WebhookError },
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// Per-event translator outcome: whether anything was emitted, or every
/// idempotency gate said the work had already happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Applied,
    Skipped,
}

/// Reaction mapping key: `messageId:userId:emojiKey`.
pub fn reaction_key(message: Snowflake, user: Snowflake, emoji_key: &str) -> String {
    format!("{message}:{user}:{emoji_key}")
}

/// Room-link key: `parentRoomyId:childRoomyId`.
pub fn room_link_key(parent: Ulid, child: Ulid) -> String {
    format!("{parent}:{child}")
}

/// Downgrade duplicate/conflicting registrations to success; both sides may
/// legitimately race to write the same mapping (translator at send time, the
/// materializer when the event comes back around).
pub(crate) fn swallow_mapping_conflict(result: DbResult<RegisterOutcome>) -> DbResult<()> {
    match result {
        Ok(_) => Ok(()),
        Err(DbError::MappingCollision { key, .. }) => {
            debug!(target: LOG_TARGET, %key, "Mapping already registered, ignoring");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

pub(crate) async fn register_mapping_idempotent(
    ctx: &GuildContext,
    kind: MappingKind,
    discord_id: Snowflake,
    roomy_id: Ulid,
) -> SyncResult<()> {
    swallow_mapping_conflict(
        ctx.db
            .register_mapping(&ctx.binding, kind, discord_id, roomy_id)
            .await,
    )
    .map_err(|source| SyncError::Db { source })
}

#[cfg(test)]
mod tests {
    use std::str::FromStr as _;

    use super::*;

    #[test]
    fn keys_are_stable() {
        assert_eq!(
            reaction_key(Snowflake::new(2000), Snowflake::new(400), "👍"),
            "2000:400:👍"
        );
        let parent = Ulid::from_str("01HZ5KJVM7X6YM8QPE7YV4Q0ZY").expect("valid ulid");
        let child = Ulid::from_str("01HZ5KJVM7X6YM8QPE7YV4Q0ZZ").expect("valid ulid");
        assert_eq!(
            room_link_key(parent, child),
            "01HZ5KJVM7X6YM8QPE7YV4Q0ZY:01HZ5KJVM7X6YM8QPE7YV4Q0ZZ"
        );
    }
}
