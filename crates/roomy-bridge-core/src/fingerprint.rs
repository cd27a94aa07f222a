//! Deterministic content fingerprints.
//!
//! Everything idempotency-sensitive compares 32-hex-char truncated SHA-256
//! fingerprints: message bodies + attachment URLs, profile fields, and the
//! normalized sidebar structure. Inputs are canonicalized (sorted) first so
//! the fingerprint is invariant under orderings that do not matter.

use sha2::{Digest as _, Sha256};

use crate::event::SidebarCategory;

/// Hex length of every fingerprint: SHA-256 truncated to 16 bytes.
pub const FINGERPRINT_LEN: usize = 32;

fn truncated_sha256(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(&digest[..FINGERPRINT_LEN / 2])
}

/// Fingerprint of a message: content plus its attachment URLs, URL order
/// ignored.
pub fn message_fingerprint(content: &str, attachment_urls: &[String]) -> String {
    let mut urls: Vec<&str> = attachment_urls.iter().map(String::as_str).collect();
    urls.sort_unstable();

    let mut input = String::with_capacity(content.len() + 1);
    input.push_str(content);
    for url in urls {
        input.push('\n');
        input.push_str(url);
    }
    truncated_sha256(&input)
}

/// Fingerprint of a Discord user profile: `username | globalName | avatar`,
/// absent fields hashing as empty.
pub fn profile_fingerprint(
    username: &str,
    global_name: Option<&str>,
    avatar: Option<&str>,
) -> String {
    let input = format!(
        "{username}|{}|{}",
        global_name.unwrap_or(""),
        avatar.unwrap_or("")
    );
    truncated_sha256(&input)
}

/// Fingerprint of the sidebar structure, invariant under category and child
/// reordering within the same set.
pub fn sidebar_fingerprint(categories: &[SidebarCategory]) -> String {
    let mut normalized: Vec<(String, Vec<String>)> = categories
        .iter()
        .map(|category| {
            let mut children: Vec<String> =
                category.children.iter().map(|id| id.to_string()).collect();
            children.sort_unstable();
            (category.name.clone(), children)
        })
        .collect();
    normalized.sort_unstable();

    let mut input = String::new();
    for (name, children) in normalized {
        input.push_str(&name);
        for child in children {
            input.push('\x1f');
            input.push_str(&child);
        }
        input.push('\n');
    }
    truncated_sha256(&input)
}

#[cfg(test)]
mod tests {
    use std::str::FromStr as _;

    use proptest::prelude::*;

    use super::*;
    use crate::id::Ulid;

    #[test]
    fn fingerprints_are_32_hex_chars() {
        for fp in [
            message_fingerprint("hi", &[]),
            profile_fingerprint("user", Some("User"), None),
            sidebar_fingerprint(&[]),
        ] {
            assert_eq!(fp.len(), FINGERPRINT_LEN);
            assert!(fp.bytes().all(|b| b.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn message_fingerprint_ignores_attachment_order() {
        let a = "https://cdn.example/a.png".to_owned();
        let b = "https://cdn.example/b.png".to_owned();
        assert_eq!(
            message_fingerprint("hi", &[a.clone(), b.clone()]),
            message_fingerprint("hi", &[b, a]),
        );
    }

    #[test]
    fn message_fingerprint_distinguishes_content_from_urls() {
        // A newline in content must not collide with the content/URL separator
        assert_ne!(
            message_fingerprint("hi\nhttps://cdn.example/a.png", &[]),
            message_fingerprint("hi", &["https://cdn.example/a.png".to_owned()]),
        );
    }

    #[test]
    fn profile_fingerprint_changes_with_each_field() {
        let base = profile_fingerprint("user", Some("User"), Some("avatar"));
        assert_ne!(base, profile_fingerprint("user2", Some("User"), Some("avatar")));
        assert_ne!(base, profile_fingerprint("user", Some("User2"), Some("avatar")));
        assert_ne!(base, profile_fingerprint("user", Some("User"), None));
    }

    fn category(name: &str, children: &[&str]) -> SidebarCategory {
        SidebarCategory {
            name: name.to_owned(),
            children: children
                .iter()
                .map(|s| Ulid::from_str(s).expect("valid ulid"))
                .collect(),
        }
    }

    const U1: &str = "01HZ5KJVM7X6YM8QPE7YV4Q0ZY";
    const U2: &str = "01HZ5KJVM7X6YM8QPE7YV4Q0ZZ";

    #[test]
    fn sidebar_fingerprint_reorder_invariant() {
        let a = [category("general", &[U1, U2]), category("dev", &[])];
        let b = [category("dev", &[]), category("general", &[U2, U1])];
        assert_eq!(sidebar_fingerprint(&a), sidebar_fingerprint(&b));

        let c = [category("general", &[U1]), category("dev", &[U2])];
        assert_ne!(sidebar_fingerprint(&a), sidebar_fingerprint(&c));
    }

    proptest! {
        #[test]
        fn message_fingerprint_permutation_invariant(
            content in ".*",
            mut urls in proptest::collection::vec("[a-z0-9:/.]{0,40}", 0..6),
        ) {
            let original = message_fingerprint(&content, &urls);
            urls.reverse();
            prop_assert_eq!(message_fingerprint(&content, &urls), original);
        }
    }
}
