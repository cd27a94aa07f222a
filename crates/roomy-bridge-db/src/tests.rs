use std::collections::HashSet;
use std::str::FromStr as _;

use roomy_bridge_core::Timestamp;
use roomy_bridge_core::id::{BindingId, Snowflake, SpaceDid, Ulid};

use crate::{BridgeDb, DbError, EditInfoRecord, MappingKind, RegisterOutcome, WebhookTokenRecord};

fn binding() -> BindingId {
    BindingId::new(
        Snowflake::new(100),
        SpaceDid::from_str("did:plc:abc").expect("valid did"),
    )
}

fn ulid(s: &str) -> Ulid {
    Ulid::from_str(s).expect("valid ulid")
}

const R1: &str = "01HZ5KJVM7X6YM8QPE7YV4Q0ZY";
const R2: &str = "01HZ5KJVM7X6YM8QPE7YV4Q0ZZ";

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn binding_roundtrip_and_collision() {
    let db = BridgeDb::new_in_memory().await.expect("open");
    let space = SpaceDid::from_str("did:plc:abc").expect("valid did");
    let guild = Snowflake::new(100);

    assert_eq!(
        db.register_binding(guild, space.clone()).await.expect("register"),
        RegisterOutcome::Inserted
    );
    assert_eq!(
        db.register_binding(guild, space.clone()).await.expect("re-register"),
        RegisterOutcome::AlreadyRegistered
    );
    assert_eq!(db.binding_for_guild(guild).await.expect("get"), Some(space.clone()));
    assert_eq!(db.binding_for_space(&space).await.expect("get"), Some(guild));

    // A guild may be bound to at most one space and vice versa
    let other_space = SpaceDid::from_str("did:plc:other").expect("valid did");
    assert!(matches!(
        db.register_binding(guild, other_space.clone()).await,
        Err(DbError::BindingCollision { .. })
    ));
    assert!(matches!(
        db.register_binding(Snowflake::new(101), space.clone()).await,
        Err(DbError::BindingCollision { .. })
    ));

    assert_eq!(db.unregister_binding(guild).await.expect("unregister"), Some(space.clone()));
    assert_eq!(db.binding_for_space(&space).await.expect("get"), None);
    assert_eq!(db.unregister_binding(guild).await.expect("unregister again"), None);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn mapping_registers_both_directions() {
    let db = BridgeDb::new_in_memory().await.expect("open");
    let b = binding();

    let outcome = db
        .register_mapping(&b, MappingKind::Message, Snowflake::new(2000), ulid(R1))
        .await
        .expect("register");
    assert_eq!(outcome, RegisterOutcome::Inserted);

    assert_eq!(db.get_roomy_id(&b, "2000").await.expect("get"), Some(ulid(R1)));
    assert_eq!(
        db.get_discord_id(&b, R1).await.expect("get"),
        Some(Snowflake::new(2000))
    );

    // Rooms live in a disjoint key space: the same snowflake can map again
    db.register_mapping(&b, MappingKind::Room, Snowflake::new(2000), ulid(R2))
        .await
        .expect("register room");
    assert_eq!(db.get_roomy_id(&b, "room:2000").await.expect("get"), Some(ulid(R2)));
    assert_eq!(
        db.get_discord_id(&b, &format!("room:{R2}")).await.expect("get"),
        Some(Snowflake::new(2000))
    );
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn mapping_duplicate_is_idempotent_but_conflict_errors() {
    let db = BridgeDb::new_in_memory().await.expect("open");
    let b = binding();

    db.register_mapping(&b, MappingKind::Message, Snowflake::new(2000), ulid(R1))
        .await
        .expect("register");

    assert_eq!(
        db.register_mapping(&b, MappingKind::Message, Snowflake::new(2000), ulid(R1))
            .await
            .expect("duplicate"),
        RegisterOutcome::AlreadyRegistered
    );

    // Same Discord id, different Roomy id
    assert!(matches!(
        db.register_mapping(&b, MappingKind::Message, Snowflake::new(2000), ulid(R2))
            .await,
        Err(DbError::MappingCollision { .. })
    ));
    // Same Roomy id, different Discord id
    assert!(matches!(
        db.register_mapping(&b, MappingKind::Message, Snowflake::new(2001), ulid(R1))
            .await,
        Err(DbError::MappingCollision { .. })
    ));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn mapping_is_a_bijection() {
    let db = BridgeDb::new_in_memory().await.expect("open");
    let b = binding();

    db.register_mapping(&b, MappingKind::Message, Snowflake::new(2000), ulid(R1))
        .await
        .expect("register");
    db.register_mapping(&b, MappingKind::Room, Snowflake::new(300), ulid(R2))
        .await
        .expect("register");

    let forward = db.list_mappings(&b).await.expect("list");
    let roomy_ids: HashSet<_> = forward.iter().map(|(_, r)| *r).collect();
    assert_eq!(forward.len(), roomy_ids.len(), "no Roomy id mapped twice");

    // Every forward entry resolves backwards to the same Discord key
    for (discord_key, roomy_id) in forward {
        let (kind, discord_id) = match discord_key.strip_prefix("room:") {
            Some(rest) => (MappingKind::Room, rest.parse().expect("snowflake")),
            None => (MappingKind::Message, discord_key.parse().expect("snowflake")),
        };
        assert_eq!(
            db.get_discord_id(&b, &kind.roomy_key(roomy_id)).await.expect("get"),
            Some(discord_id)
        );
    }
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn unregister_by_roomy_removes_both_directions_and_nonce() {
    let db = BridgeDb::new_in_memory().await.expect("open");
    let b = binding();
    let roomy = ulid(R1);

    db.register_mapping(&b, MappingKind::Message, Snowflake::new(2000), roomy)
        .await
        .expect("register");
    db.write_with(|tx| BridgeDb::register_nonce_tx(tx, &b, &roomy.nonce(), Snowflake::new(2000)))
        .await
        .expect("nonce");

    let removed = db
        .write_with(|tx| {
            BridgeDb::unregister_mapping_by_roomy_tx(tx, &b, MappingKind::Message, roomy)
        })
        .await
        .expect("unregister");
    assert_eq!(removed, Some(Snowflake::new(2000)));

    assert_eq!(db.get_roomy_id(&b, "2000").await.expect("get"), None);
    assert_eq!(db.get_discord_id(&b, R1).await.expect("get"), None);
    assert_eq!(db.get_discord_id(&b, &roomy.nonce()).await.expect("get"), None);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn cursor_is_monotonic() {
    let db = BridgeDb::new_in_memory().await.expect("open");
    let space = SpaceDid::from_str("did:plc:abc").expect("valid did");

    assert_eq!(db.cursor(&space).await.expect("get"), None);
    db.set_cursor(&space, 5).await.expect("set");
    assert_eq!(db.cursor(&space).await.expect("get"), Some(5));

    // Never moves backwards
    db.set_cursor(&space, 3).await.expect("set");
    assert_eq!(db.cursor(&space).await.expect("get"), Some(5));
    db.set_cursor(&space, 9).await.expect("set");
    assert_eq!(db.cursor(&space).await.expect("get"), Some(9));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn latest_seen_never_regresses() {
    let db = BridgeDb::new_in_memory().await.expect("open");
    let b = binding();
    let channel = Snowflake::new(300);

    db.set_latest_seen(&b, channel, Snowflake::new(2000)).await.expect("set");
    db.set_latest_seen(&b, channel, Snowflake::new(1500)).await.expect("set");
    assert_eq!(
        db.latest_seen(&b, channel).await.expect("get"),
        Some(Snowflake::new(2000))
    );
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn message_hash_lookup_falls_back_to_nonceless_entry() {
    let db = BridgeDb::new_in_memory().await.expect("open");
    let b = binding();
    let channel = Snowflake::new(300);
    let nonce = ulid(R1).nonce();

    // History scans usually cannot see the nonce
    db.write_with(|tx| {
        BridgeDb::index_message_hash_tx(tx, &b, channel, None, "deadbeef", Snowflake::new(2000))
    })
    .await
    .expect("index");

    assert_eq!(
        db.message_hash_lookup(&b, channel, &nonce, "deadbeef").await.expect("lookup"),
        Some(Snowflake::new(2000))
    );
    assert_eq!(
        db.message_hash_lookup(&b, channel, &nonce, "feedface").await.expect("lookup"),
        None
    );

    // An exact nonce-keyed entry wins over the fallback
    db.write_with(|tx| {
        BridgeDb::index_message_hash_tx(
            tx,
            &b,
            channel,
            Some(&nonce),
            "deadbeef",
            Snowflake::new(2001),
        )
    })
    .await
    .expect("index");
    assert_eq!(
        db.message_hash_lookup(&b, channel, &nonce, "deadbeef").await.expect("lookup"),
        Some(Snowflake::new(2001))
    );
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn edit_info_and_fingerprints_roundtrip() {
    let db = BridgeDb::new_in_memory().await.expect("open");
    let b = binding();

    let info = EditInfoRecord {
        edited_timestamp: Timestamp::from_millis(1_700_000_000_000),
        content_hash: "deadbeef".repeat(4),
    };
    db.write_with(|tx| BridgeDb::set_edit_info_tx(tx, &b, Snowflake::new(2000), &info))
        .await
        .expect("set");
    assert_eq!(db.edit_info(&b, Snowflake::new(2000)).await.expect("get"), Some(info));

    db.write_with(|tx| BridgeDb::set_profile_hash_tx(tx, &b, Snowflake::new(400), "abcd"))
        .await
        .expect("set");
    assert_eq!(
        db.profile_hash(&b, Snowflake::new(400)).await.expect("get"),
        Some("abcd".to_owned())
    );

    db.write_with(|tx| BridgeDb::set_sidebar_hash_tx(tx, &b, "ffff"))
        .await
        .expect("set");
    assert_eq!(db.sidebar_hash(&b).await.expect("get"), Some("ffff".to_owned()));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn reaction_keys_roundtrip() {
    let db = BridgeDb::new_in_memory().await.expect("open");
    let b = binding();
    let key = "2000:400:👍";

    assert_eq!(db.reaction_id(&b, key).await.expect("get"), None);
    db.set_reaction_id(&b, key, ulid(R1)).await.expect("set");
    assert_eq!(db.reaction_id(&b, key).await.expect("get"), Some(ulid(R1)));
    assert_eq!(db.remove_reaction_id(&b, key).await.expect("remove"), Some(ulid(R1)));
    assert_eq!(db.reaction_id(&b, key).await.expect("get"), None);
    assert_eq!(db.remove_reaction_id(&b, key).await.expect("remove again"), None);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn webhook_tokens_roundtrip() {
    let db = BridgeDb::new_in_memory().await.expect("open");
    let channel = Snowflake::new(300);

    assert_eq!(db.webhook_token(channel).await.expect("get"), None);
    let record = WebhookTokenRecord {
        id: Snowflake::new(900),
        token: "tok".to_owned(),
    };
    db.set_webhook_token(channel, &record).await.expect("set");
    assert_eq!(db.webhook_token(channel).await.expect("get"), Some(record));
    db.clear_webhook_token(channel).await.expect("clear");
    assert_eq!(db.webhook_token(channel).await.expect("get"), None);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn persists_across_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = BridgeDb::mk_db_path(dir.path()).await.expect("path");
    let b = binding();

    {
        let db = BridgeDb::open(&path).await.expect("open");
        db.register_mapping(&b, MappingKind::Message, Snowflake::new(2000), ulid(R1))
            .await
            .expect("register");
        let space = SpaceDid::from_str("did:plc:abc").expect("valid did");
        db.set_cursor(&space, 7).await.expect("cursor");
    }

    let db = BridgeDb::open(&path).await.expect("reopen");
    assert_eq!(db.get_roomy_id(&b, "2000").await.expect("get"), Some(ulid(R1)));
    let space = SpaceDid::from_str("did:plc:abc").expect("valid did");
    assert_eq!(db.cursor(&space).await.expect("get"), Some(7));
}
