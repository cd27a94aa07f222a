//! The sync marker embedded in Discord channel topics, and its thread-starter
//! URL counterpart.
//!
//! A synced channel's topic contains exactly `[Synced from Roomy: <ULID>]`.
//! Threads have no topic, so a pinned starter message containing the
//! canonical `https://roomy.space/<spaceDid>/<ulid>` URL plays the same
//! role. Both let Roomy->Discord channel creation stay idempotent without a
//! database lookup: a marked channel is adopted, an unmarked one gets
//! created and marked.

use std::str::FromStr as _;

use crate::id::{SpaceDid, Ulid};

const MARKER_PREFIX: &str = "[Synced from Roomy: ";
const MARKER_SUFFIX: char = ']';
const ULID_STR_LEN: usize = 26;

const ROOM_URL_BASE: &str = "https://roomy.space/";

/// Extract the room id from a topic's sync marker, if a valid one is present.
pub fn extract(topic: &str) -> Option<Ulid> {
    let start = topic.find(MARKER_PREFIX)? + MARKER_PREFIX.len();
    let rest = &topic[start..];
    if rest.len() < ULID_STR_LEN + MARKER_SUFFIX.len_utf8() {
        return None;
    }
    let (candidate, tail) = rest.split_at(ULID_STR_LEN);
    if !tail.starts_with(MARKER_SUFFIX) {
        return None;
    }
    Ulid::from_str(candidate).ok()
}

pub fn is_synced(topic: &str) -> bool {
    extract(topic).is_some()
}

/// Append a sync marker to a topic, replacing any existing one.
pub fn add(topic: &str, room: Ulid) -> String {
    let base = remove(topic);
    if base.is_empty() {
        format!("{MARKER_PREFIX}{room}{MARKER_SUFFIX}")
    } else {
        format!("{base} {MARKER_PREFIX}{room}{MARKER_SUFFIX}")
    }
}

/// Strip any sync marker from a topic.
pub fn remove(topic: &str) -> String {
    let Some(start) = topic.find(MARKER_PREFIX) else {
        return topic.to_owned();
    };
    let after = match topic[start..].find(MARKER_SUFFIX) {
        Some(end) => &topic[start + end + MARKER_SUFFIX.len_utf8()..],
        None => "",
    };
    let mut out = topic[..start].to_owned();
    out.push_str(after);
    out.trim().to_owned()
}

/// The canonical URL for a room, as posted in thread starter messages.
pub fn room_url(space: &SpaceDid, room: Ulid) -> String {
    format!("{ROOM_URL_BASE}{space}/{room}")
}

/// Extract `(space, room)` from the first canonical room URL in `text`.
pub fn extract_room_url(text: &str) -> Option<(SpaceDid, Ulid)> {
    let start = text.find(ROOM_URL_BASE)? + ROOM_URL_BASE.len();
    let rest = &text[start..];
    let (did_part, rest) = rest.split_once('/')?;
    let room_part = rest
        .split(|c: char| c.is_whitespace() || c == ')' || c == ']')
        .next()?;
    let space = SpaceDid::from_str(did_part).ok()?;
    let room = Ulid::from_str(room_part).ok()?;
    Some((space, room))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const ROOM: &str = "01HZ5KJVM7X6YM8QPE7YV4Q0ZY";

    fn room() -> Ulid {
        Ulid::from_str(ROOM).expect("valid ulid")
    }

    #[test]
    fn add_extract_roundtrip() {
        let topic = add("General", room());
        assert_eq!(topic, format!("General [Synced from Roomy: {ROOM}]"));
        assert_eq!(extract(&topic), Some(room()));
        assert!(is_synced(&topic));
    }

    #[test]
    fn add_to_empty_topic() {
        let topic = add("", room());
        assert_eq!(topic, format!("[Synced from Roomy: {ROOM}]"));
        assert_eq!(extract(&topic), Some(room()));
    }

    #[test]
    fn add_replaces_existing_marker() {
        let other = Ulid::from_str("01HZ5KJVM7X6YM8QPE7YV4Q0ZZ").expect("valid ulid");
        let topic = add(&add("General", other), room());
        assert_eq!(extract(&topic), Some(room()));
        assert_eq!(topic.matches("[Synced from Roomy: ").count(), 1);
    }

    #[test]
    fn remove_yields_unmarked_topic() {
        let topic = add("General", room());
        let removed = remove(&topic);
        assert_eq!(removed, "General");
        assert!(!is_synced(&removed));
        assert_eq!(remove("General"), "General");
    }

    #[test]
    fn invalid_ulids_are_not_markers() {
        assert_eq!(extract("[Synced from Roomy: not-a-ulid-but-26-chars!]"), None);
        assert_eq!(extract("[Synced from Roomy: 01HZ5]"), None);
        // Truncated: no closing bracket
        assert_eq!(extract(&format!("[Synced from Roomy: {ROOM}")), None);
    }

    #[test]
    fn room_url_roundtrip() {
        let space: SpaceDid = "did:plc:abc".parse().expect("valid did");
        let url = room_url(&space, room());
        assert_eq!(url, format!("https://roomy.space/did:plc:abc/{ROOM}"));

        let text = format!("This thread is synced: {url} (pinned)");
        assert_eq!(extract_room_url(&text), Some((space, room())));
        assert_eq!(extract_room_url("no url here"), None);
    }

    proptest! {
        #[test]
        fn marker_roundtrip_any_topic(topic in "[^\\[\\]]{0,80}") {
            let marked = add(&topic, room());
            prop_assert_eq!(extract(&marked), Some(room()));
            prop_assert!(is_synced(&marked));
            let removed = remove(&marked);
            prop_assert!(!is_synced(&removed));
            prop_assert_eq!(removed, topic.trim());
        }
    }
}
