//! The Roomy event model.
//!
//! Roomy events are open records keyed by NSIDs: a `$type` selects the
//! payload shape, and an `extensions` map carries NSID-keyed side records
//! that are inspected but not schema-checked here. Every known `$type` is a
//! tagged variant with a typed payload; extensions stay raw JSON with typed
//! decoders for the ones the bridge understands.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::Timestamp;
use crate::id::{Did, Snowflake, Ulid};

/// Event `$type` NSIDs.
pub mod nsid {
    pub const CREATE_ROOM: &str = "space.roomy.room.createRoom.v0";
    pub const DELETE_ROOM: &str = "space.roomy.room.deleteRoom.v0";
    pub const CREATE_ROOM_LINK: &str = "space.roomy.room.createRoomLink.v0";
    pub const CREATE_MESSAGE: &str = "space.roomy.message.createMessage.v0";
    pub const EDIT_MESSAGE: &str = "space.roomy.message.editMessage.v0";
    pub const DELETE_MESSAGE: &str = "space.roomy.message.deleteMessage.v0";
    pub const ADD_BRIDGED_REACTION: &str = "space.roomy.reaction.addBridgedReaction.v0";
    pub const REMOVE_BRIDGED_REACTION: &str = "space.roomy.reaction.removeBridgedReaction.v0";
    pub const UPDATE_PROFILE: &str = "space.roomy.profile.updateProfile.v0";
    pub const UPDATE_SIDEBAR: &str = "space.roomy.space.updateSidebar.v0";
}

/// Extension NSIDs.
pub mod ext {
    /// Stamped on messages mirrored from Discord.
    pub const DISCORD_MESSAGE_ORIGIN: &str = "space.roomy.extension.discordMessageOrigin.v0";
    /// Stamped on rooms mirrored from Discord channels/threads.
    pub const DISCORD_ORIGIN: &str = "space.roomy.extension.discordOrigin.v0";
    /// Stamped on profile updates mirrored from Discord users.
    pub const DISCORD_USER_ORIGIN: &str = "space.roomy.extension.discordUserOrigin.v0";
    /// Stamped on sidebar updates computed from Discord categories.
    pub const DISCORD_SIDEBAR_ORIGIN: &str = "space.roomy.extension.discordSidebarOrigin.v0";
    /// Stamped on room links mirrored from Discord parent/child structure.
    pub const DISCORD_ROOM_LINK_ORIGIN: &str = "space.roomy.extension.discordRoomLinkOrigin.v0";
    /// Loop-prevention stamp on reactions mirrored from Discord.
    pub const DISCORD_REACTION_ORIGIN: &str = "space.roomy.extension.discordReactionOrigin.v0";

    pub const AUTHOR_OVERRIDE: &str = "space.roomy.extension.authorOverride.v0";
    pub const TIMESTAMP_OVERRIDE: &str = "space.roomy.extension.timestampOverride.v0";
    pub const ATTACHMENTS: &str = "space.roomy.extension.attachments.v0";

    /// Every extension that marks an event as Discord-originated. Presence
    /// of any of these (for the right guild) means the event must not be
    /// echoed back to Discord.
    pub const DISCORD_ORIGINS: [&str; 6] = [
        DISCORD_MESSAGE_ORIGIN,
        DISCORD_ORIGIN,
        DISCORD_USER_ORIGIN,
        DISCORD_SIDEBAR_ORIGIN,
        DISCORD_ROOM_LINK_ORIGIN,
        DISCORD_REACTION_ORIGIN,
    ];
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomyEvent {
    pub id: Ulid,
    /// The room the event belongs to, when it is room-scoped (messages,
    /// reactions). Room lifecycle and space-level events leave it unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<Ulid>,
    #[serde(flatten)]
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "$type")]
pub enum EventKind {
    #[serde(rename = "space.roomy.room.createRoom.v0")]
    CreateRoom(CreateRoom),
    #[serde(rename = "space.roomy.room.deleteRoom.v0")]
    DeleteRoom(DeleteRoom),
    #[serde(rename = "space.roomy.room.createRoomLink.v0")]
    CreateRoomLink(CreateRoomLink),
    #[serde(rename = "space.roomy.message.createMessage.v0")]
    CreateMessage(CreateMessage),
    #[serde(rename = "space.roomy.message.editMessage.v0")]
    EditMessage(EditMessage),
    #[serde(rename = "space.roomy.message.deleteMessage.v0")]
    DeleteMessage(DeleteMessage),
    #[serde(rename = "space.roomy.reaction.addBridgedReaction.v0")]
    AddBridgedReaction(AddBridgedReaction),
    #[serde(rename = "space.roomy.reaction.removeBridgedReaction.v0")]
    RemoveBridgedReaction(RemoveBridgedReaction),
    #[serde(rename = "space.roomy.profile.updateProfile.v0")]
    UpdateProfile(UpdateProfile),
    #[serde(rename = "space.roomy.space.updateSidebar.v0")]
    UpdateSidebar(UpdateSidebar),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateRoom {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteRoom {
    /// Named `target`, not `room`: the envelope's `room` field is the
    /// containing room and is flattened into the same JSON object.
    pub target: Ulid,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateRoomLink {
    pub parent: Ulid,
    pub child: Ulid,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateMessage {
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EditMessage {
    pub message: Ulid,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteMessage {
    pub message: Ulid,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AddBridgedReaction {
    pub reaction_to: Ulid,
    pub reaction: String,
    pub reacting_user: Did,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RemoveBridgedReaction {
    pub reaction_id: Ulid,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateProfile {
    pub did: Did,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateSidebar {
    pub categories: Vec<SidebarCategory>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SidebarCategory {
    pub name: String,
    pub children: Vec<Ulid>,
}

// ============================================================================
// Extension payloads
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DiscordMessageOrigin {
    pub snowflake: Snowflake,
    pub channel_id: Snowflake,
    pub guild_id: Snowflake,
    /// Set on `editMessage` events so replayed edits can be recognized.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_timestamp: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DiscordRoomOrigin {
    pub snowflake: Snowflake,
    pub guild_id: Snowflake,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DiscordUserOrigin {
    pub guild_id: Snowflake,
    pub user_id: Snowflake,
    pub profile_hash: String,
    /// `username#discriminator` of the Discord user.
    pub handle: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DiscordSidebarOrigin {
    pub guild_id: Snowflake,
    pub sidebar_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DiscordRoomLinkOrigin {
    pub guild_id: Snowflake,
    pub parent_channel_id: Snowflake,
    pub child_channel_id: Snowflake,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DiscordReactionOrigin {
    pub guild_id: Snowflake,
    pub message_id: Snowflake,
    pub user_id: Snowflake,
    pub emoji_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthorOverride {
    pub did: Did,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimestampOverride {
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachments {
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "$type")]
pub enum Attachment {
    #[serde(rename = "space.roomy.attachment.file.v0")]
    File {
        name: String,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime: Option<String>,
    },
    /// Reply reference; `target` is the replied-to message's Roomy id.
    #[serde(rename = "space.roomy.attachment.reply.v0")]
    Reply { target: Ulid },
}

/// The minimal slice of any Discord-origin extension: which guild it stamps.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GuildStamp {
    guild_id: Snowflake,
}

impl RoomyEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            id: Ulid::generate(),
            room: None,
            kind,
            extensions: BTreeMap::new(),
        }
    }

    pub fn in_room(mut self, room: Ulid) -> Self {
        self.room = Some(room);
        self
    }

    pub fn type_nsid(&self) -> &'static str {
        match &self.kind {
            EventKind::CreateRoom(_) => nsid::CREATE_ROOM,
            EventKind::DeleteRoom(_) => nsid::DELETE_ROOM,
            EventKind::CreateRoomLink(_) => nsid::CREATE_ROOM_LINK,
            EventKind::CreateMessage(_) => nsid::CREATE_MESSAGE,
            EventKind::EditMessage(_) => nsid::EDIT_MESSAGE,
            EventKind::DeleteMessage(_) => nsid::DELETE_MESSAGE,
            EventKind::AddBridgedReaction(_) => nsid::ADD_BRIDGED_REACTION,
            EventKind::RemoveBridgedReaction(_) => nsid::REMOVE_BRIDGED_REACTION,
            EventKind::UpdateProfile(_) => nsid::UPDATE_PROFILE,
            EventKind::UpdateSidebar(_) => nsid::UPDATE_SIDEBAR,
        }
    }

    pub fn extension_raw(&self, nsid: &str) -> Option<&serde_json::Value> {
        self.extensions.get(nsid)
    }

    /// Decode a typed extension. A present-but-malformed extension decodes to
    /// `None` the same as an absent one; schema evolution happens at the
    /// edges, not here.
    pub fn extension<T: DeserializeOwned>(&self, nsid: &str) -> Option<T> {
        let raw = self.extensions.get(nsid)?;
        serde_json::from_value(raw.clone()).ok()
    }

    pub fn with_extension<T: Serialize>(mut self, nsid: &str, payload: &T) -> Self {
        self.set_extension(nsid, payload);
        self
    }

    pub fn set_extension<T: Serialize>(&mut self, nsid: &str, payload: &T) {
        self.extensions.insert(
            nsid.to_owned(),
            serde_json::to_value(payload).expect("Extension serialization can't fail"),
        );
    }

    /// True when any Discord-origin extension is present, regardless of
    /// which guild stamped it.
    pub fn has_any_discord_origin(&self) -> bool {
        ext::DISCORD_ORIGINS
            .iter()
            .any(|nsid| self.extensions.contains_key(*nsid))
    }

    /// True when a Discord-origin extension stamped by `guild` is present.
    pub fn has_discord_origin_for(&self, guild: Snowflake) -> bool {
        ext::DISCORD_ORIGINS.iter().any(|nsid| {
            self.extension::<GuildStamp>(nsid)
                .is_some_and(|stamp| stamp.guild_id == guild)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr as _;

    use super::*;

    fn ulid(s: &str) -> Ulid {
        Ulid::from_str(s).expect("valid ulid")
    }

    #[test]
    fn event_json_shape() {
        let event = RoomyEvent::new(EventKind::CreateMessage(CreateMessage {
            body: "hi".to_owned(),
        }))
        .in_room(ulid("01HZ5KJVM7X6YM8QPE7YV4Q0ZY"))
        .with_extension(
            ext::DISCORD_MESSAGE_ORIGIN,
            &DiscordMessageOrigin {
                snowflake: Snowflake::new(2000),
                channel_id: Snowflake::new(300),
                guild_id: Snowflake::new(100),
                edited_timestamp: None,
                content_hash: None,
            },
        );

        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["$type"], "space.roomy.message.createMessage.v0");
        assert_eq!(value["body"], "hi");
        assert_eq!(value["room"], "01HZ5KJVM7X6YM8QPE7YV4Q0ZY");
        assert_eq!(
            value["extensions"][ext::DISCORD_MESSAGE_ORIGIN]["snowflake"],
            "2000"
        );

        let back: RoomyEvent = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, event);
    }

    #[test]
    fn origin_detection_is_guild_scoped() {
        let event = RoomyEvent::new(EventKind::CreateRoom(CreateRoom {
            name: "general".to_owned(),
        }))
        .with_extension(
            ext::DISCORD_ORIGIN,
            &DiscordRoomOrigin {
                snowflake: Snowflake::new(300),
                guild_id: Snowflake::new(100),
            },
        );

        assert!(event.has_any_discord_origin());
        assert!(event.has_discord_origin_for(Snowflake::new(100)));
        assert!(!event.has_discord_origin_for(Snowflake::new(101)));
    }

    #[test]
    fn malformed_extension_decodes_as_absent() {
        let mut event = RoomyEvent::new(EventKind::CreateRoom(CreateRoom {
            name: "general".to_owned(),
        }));
        event
            .extensions
            .insert(ext::AUTHOR_OVERRIDE.to_owned(), serde_json::json!(42));

        assert!(event.extension::<AuthorOverride>(ext::AUTHOR_OVERRIDE).is_none());
        assert!(event.extension_raw(ext::AUTHOR_OVERRIDE).is_some());
    }

    #[test]
    fn reaction_payload_field_names() {
        let event = RoomyEvent::new(EventKind::AddBridgedReaction(AddBridgedReaction {
            reaction_to: ulid("01HZ5KJVM7X6YM8QPE7YV4Q0ZY"),
            reaction: "👍".to_owned(),
            reacting_user: Did::discord(Snowflake::new(400)),
        }));

        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["reactionTo"], "01HZ5KJVM7X6YM8QPE7YV4Q0ZY");
        assert_eq!(value["reactingUser"], "did:discord:400");
    }
}
