use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use lantern_store::structured::Database;
use lantern_types::{
    ChannelQuery, ChannelState, MemberState, MessageState, ReactionState, ReadState, UserState,
};
use serde_json::json;

fn ts(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).unwrap()
}

fn user(id: &str) -> UserState {
    let mut user = UserState::new(id);
    user.name = Some(id.to_uppercase());
    user
}

fn message(id: &str, text: &str, at: i64, author: &str) -> MessageState {
    let mut message = MessageState::new(id, text, ts(at));
    message.user = Some(user(author));
    message
}

fn channel(id: &str) -> ChannelState {
    let mut channel = ChannelState::new("messaging", id);
    channel.data.insert("name".into(), json!(format!("#{id}")));
    channel.members = vec![
        MemberState::for_user(user("alice")),
        MemberState::for_user(user("bob")),
    ];
    channel
}

fn query() -> ChannelQuery {
    ChannelQuery::new(json!({"members": {"$in": ["alice"]}}), json!([{"last_message_at": -1}]))
}

fn cids(db: &Database, query: &ChannelQuery, offset: usize, limit: usize) -> Vec<String> {
    db.query_channels(query, offset, limit)
        .unwrap()
        .into_iter()
        .map(|c| c.cid)
        .collect()
}

fn love(message_id: &str, user_id: &str) -> ReactionState {
    ReactionState {
        message_id: message_id.into(),
        kind: "love".into(),
        user_id: Some(user_id.into()),
        user: Some(user(user_id)),
        score: 1,
        created_at: Some(ts(5_000)),
        updated_at: None,
    }
}

#[test]
fn channel_with_three_messages_rehydrates_in_order() {
    let db = Database::open_in_memory().unwrap();
    let mut general = channel("general");
    // Stored out of order on purpose.
    general.messages = vec![
        message("m3", "third", 3_000, "alice"),
        message("m1", "first", 1_000, "bob"),
        message("m2", "second", 2_000, "alice"),
    ];

    db.store_channels(&query(), &[general], false).unwrap();
    let channels = db.query_channels(&query(), 0, 10).unwrap();

    assert_eq!(channels.len(), 1);
    let restored = &channels[0];
    assert_eq!(restored.cid, "messaging:general");
    assert_eq!(restored.data.get("name"), Some(&json!("#general")));
    let ids: Vec<&str> = restored.messages.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["m1", "m2", "m3"]);
    assert_eq!(restored.messages[0].user.as_ref().unwrap().name.as_deref(), Some("BOB"));
    assert_eq!(restored.members.len(), 2);
}

#[test]
fn removing_the_only_reaction_clears_row_and_count() {
    let db = Database::open_in_memory().unwrap();
    let mut general = channel("general");
    let mut m1 = message("m1", "hi", 1_000, "alice");
    m1.latest_reactions = vec![love("m1", "bob")];
    m1.reaction_counts = BTreeMap::from([("love".to_string(), 1)]);
    general.messages = vec![m1];
    db.store_channels(&query(), &[general], true).unwrap();

    assert_eq!(db.reaction_count("m1", "love").unwrap(), 1);
    assert!(db.has_reaction("m1", "bob", "love").unwrap());

    db.delete_reaction(&love("m1", "bob")).unwrap();

    assert_eq!(db.reaction_count("m1", "love").unwrap(), 0);
    assert!(!db.has_reaction("m1", "bob", "love").unwrap());
    let restored = &db.query_channels(&query(), 0, 10).unwrap()[0].messages[0];
    assert!(restored.latest_reactions.is_empty());
    assert!(restored.reaction_counts.is_empty());

    // A second delete finds nothing and leaves the count at zero.
    db.delete_reaction(&love("m1", "bob")).unwrap();
    assert_eq!(db.reaction_count("m1", "love").unwrap(), 0);
}

#[test]
fn adding_the_same_reaction_twice_counts_once() {
    let db = Database::open_in_memory().unwrap();
    let mut general = channel("general");
    general.messages = vec![message("m1", "hi", 1_000, "alice")];
    db.store_channels(&query(), &[general], true).unwrap();

    db.add_reaction(&love("m1", "carol"), true).unwrap();
    db.add_reaction(&love("m1", "carol"), true).unwrap();

    assert_eq!(db.reaction_count("m1", "love").unwrap(), 1);
    let restored = &db.query_messages("messaging:general", 10, None).unwrap()[0];
    assert_eq!(restored.own_reactions.len(), 1);
    assert_eq!(restored.latest_reactions[0].user.as_ref().unwrap().name.as_deref(), Some("CAROL"));
}

#[test]
fn repeated_sync_is_idempotent() {
    let db = Database::open_in_memory().unwrap();
    let mut general = channel("general");
    general.messages = vec![
        message("m1", "one", 1_000, "alice"),
        message("m2", "two", 2_000, "bob"),
    ];

    db.store_channels(&query(), std::slice::from_ref(&general), false).unwrap();
    let first = db.stats().unwrap();
    db.store_channels(&query(), std::slice::from_ref(&general), false).unwrap();
    db.add_member("messaging:general", &MemberState::for_user(user("alice"))).unwrap();
    db.insert_messages("messaging:general", &general.messages).unwrap();

    assert_eq!(db.stats().unwrap(), first);
    assert_eq!(first.channels, 1);
    assert_eq!(first.messages, 2);
    assert_eq!(first.members, 2);
    assert_eq!(first.users, 2);
}

#[test]
fn pages_are_disjoint() {
    let db = Database::open_in_memory().unwrap();
    let channels: Vec<ChannelState> = (0..5).map(|i| channel(&format!("c{i}"))).collect();
    db.store_channels(&query(), &channels, true).unwrap();

    assert_eq!(cids(&db, &query(), 0, 2), vec!["messaging:c0", "messaging:c1"]);
    assert_eq!(cids(&db, &query(), 2, 2), vec!["messaging:c2", "messaging:c3"]);
    assert_eq!(cids(&db, &query(), 4, 2), vec!["messaging:c4"]);
}

#[test]
fn offset_past_the_end_returns_nothing() {
    let db = Database::open_in_memory().unwrap();
    let channels: Vec<ChannelState> = (0..3).map(|i| channel(&format!("c{i}"))).collect();
    db.store_channels(&query(), &channels, true).unwrap();

    assert!(cids(&db, &query(), usize::MAX, 2).is_empty());
    assert!(cids(&db, &query(), 3, 2).is_empty());
    assert_eq!(cids(&db, &query(), 1, usize::MAX), vec!["messaging:c1", "messaging:c2"]);
}

#[test]
fn resync_replaces_list_and_append_dedupes() {
    let db = Database::open_in_memory().unwrap();
    db.store_channels(&query(), &[channel("a"), channel("b")], true).unwrap();

    // Appending a known channel keeps its original position.
    db.store_channels(&query(), &[channel("b"), channel("c")], false).unwrap();
    assert_eq!(
        cids(&db, &query(), 0, 10),
        vec!["messaging:a", "messaging:b", "messaging:c"]
    );

    db.store_channels(&query(), &[channel("c")], true).unwrap();
    assert_eq!(cids(&db, &query(), 0, 10), vec!["messaging:c"]);

    // Dropped channels linger until swept.
    assert_eq!(db.stats().unwrap().channels, 3);
    let removed = db.sweep_orphans().unwrap();
    assert_eq!(removed, 2);
    assert_eq!(db.stats().unwrap().channels, 1);
}

#[test]
fn other_queries_keep_their_lists() {
    let db = Database::open_in_memory().unwrap();
    let other = ChannelQuery::new(json!({"type": "livestream"}), json!([]));
    db.store_channels(&query(), &[channel("a")], true).unwrap();
    db.store_channels(&other, &[channel("b")], true).unwrap();

    db.store_channels(&query(), &[channel("c")], true).unwrap();

    assert_eq!(cids(&db, &other, 0, 10), vec!["messaging:b"]);
}

#[test]
fn thread_replies_and_pins_are_split_on_read() {
    let db = Database::open_in_memory().unwrap();
    let mut general = channel("general");
    let mut parent = message("p", "parent", 1_000, "alice");
    parent.pinned = true;
    let mut reply = message("r", "reply", 2_000, "bob");
    reply.parent_id = Some("p".into());
    general.messages = vec![parent];
    general.threads.insert("p".into(), vec![reply]);
    db.store_channels(&query(), &[general], true).unwrap();

    let restored = &db.query_channels(&query(), 0, 1).unwrap()[0];
    assert_eq!(restored.messages.len(), 1);
    assert_eq!(restored.threads["p"][0].id, "r");
    assert_eq!(restored.pinned_messages[0].id, "p");
}

#[test]
fn reply_shown_in_channel_rehydrates_in_timeline_and_thread() {
    let db = Database::open_in_memory().unwrap();
    let mut general = channel("general");
    let mut reply = message("r1", "also in channel", 2_000, "bob");
    reply.parent_id = Some("m1".into());
    general.messages = vec![message("m1", "root", 1_000, "alice"), reply];
    db.store_channels(&query(), &[general], false).unwrap();

    let restored = &db.query_channels(&query(), 0, 1).unwrap()[0];
    let timeline: Vec<&str> = restored.messages.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(timeline, vec!["m1", "r1"]);
    assert!(restored.messages[1].show_in_channel);
    assert_eq!(restored.threads["m1"][0].id, "r1");

    // An update that drops the flag moves the reply back into the thread only.
    let mut edited = message("r1", "edited", 2_000, "bob");
    edited.parent_id = Some("m1".into());
    db.update_message(&edited).unwrap();
    let restored = &db.query_channels(&query(), 0, 1).unwrap()[0];
    assert_eq!(restored.messages.len(), 1);
    assert_eq!(restored.threads["m1"][0].text, "edited");
}

#[test]
fn member_and_read_updates() {
    let db = Database::open_in_memory().unwrap();
    db.store_channels(&query(), &[channel("general")], true).unwrap();

    let mut alice = MemberState::for_user(user("alice"));
    alice.role = Some("owner".into());
    db.update_member("messaging:general", &alice).unwrap();
    // Not a member yet, so nothing is written.
    db.update_member("messaging:general", &MemberState::for_user(user("dave"))).unwrap();
    db.remove_member("messaging:general", "bob").unwrap();
    db.update_read(
        "messaging:general",
        &ReadState {
            user: user("alice"),
            last_read: ts(9_000),
            unread_messages: 3,
        },
    )
    .unwrap();

    let restored = &db.query_channels(&query(), 0, 1).unwrap()[0];
    assert_eq!(restored.members.len(), 1);
    assert_eq!(restored.members[0].role.as_deref(), Some("owner"));
    assert_eq!(restored.read["alice"].unread_messages, 3);
    assert_eq!(restored.read["alice"].last_read, ts(9_000));
}

#[test]
fn query_messages_pages_backwards_and_truncate_empties() {
    let db = Database::open_in_memory().unwrap();
    let mut general = channel("general");
    general.messages = (0..6).map(|i| message(&format!("m{i}"), "x", 1_000 + i, "alice")).collect();
    db.store_channels(&query(), &[general], true).unwrap();

    let page = db.query_messages("messaging:general", 2, Some(ts(1_004))).unwrap();
    let ids: Vec<&str> = page.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["m2", "m3"]);

    db.truncate_channel("messaging:general").unwrap();
    assert!(db.query_messages("messaging:general", 10, None).unwrap().is_empty());
    assert_eq!(db.stats().unwrap().channels, 1);
}

#[test]
fn update_channel_data_and_delete_all() {
    let db = Database::open_in_memory().unwrap();
    db.store_channels(&query(), &[channel("general")], true).unwrap();

    let mut data = serde_json::Map::new();
    data.insert("name".into(), json!("renamed"));
    db.update_channel_data("messaging:general", &data).unwrap();
    let restored = &db.query_channels(&query(), 0, 1).unwrap()[0];
    assert_eq!(restored.data.get("name"), Some(&json!("renamed")));

    db.delete_all().unwrap();
    assert_eq!(db.stats().unwrap(), Default::default());
}
