//! Translation between the nested live state the client holds and the flat,
//! key-addressed rows both backends persist.
//!
//! A channel never embeds its members, messages or users: each becomes its
//! own row and the channel is reassembled from them on read. Users are
//! deduplicated by id so a user mentioned in fifty messages is one row.

use std::collections::{BTreeMap, BTreeSet};

use lantern_types::{
    ChannelConfig, ChannelState, Command, MemberState, MessageState, ReactionState, ReadState,
    UserState,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::MappingError;
use crate::models::{
    ChannelConfigRow, ChannelRow, CommandRow, MemberRow, MessageRow, ReactionCountRow, ReactionRow,
    ReadRow, UserRow, command_key, from_millis, member_key, opt_from_millis, opt_to_millis,
    reaction_count_key, reaction_key, read_key, to_millis,
};

type Result<T> = std::result::Result<T, MappingError>;

/// Users resolved by id, used when reassembling live state.
pub type UserMap = BTreeMap<String, UserState>;

/// One message split into its rows.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedMessage {
    pub message: MessageRow,
    pub reactions: Vec<ReactionRow>,
    pub reaction_counts: Vec<ReactionCountRow>,
    pub users: Vec<UserRow>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedConfig {
    pub config: ChannelConfigRow,
    pub commands: Vec<CommandRow>,
}

/// One channel split into its rows. Message-level users stay on each
/// `NormalizedMessage`; `users` holds members and readers.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedChannel {
    pub channel: ChannelRow,
    pub config: Option<NormalizedConfig>,
    pub members: Vec<MemberRow>,
    pub messages: Vec<NormalizedMessage>,
    pub reads: Vec<ReadRow>,
    pub users: Vec<UserRow>,
}

impl NormalizedChannel {
    /// Every user row referenced anywhere in the channel, one per id.
    pub fn all_users(&self) -> Vec<UserRow> {
        let mut by_id: BTreeMap<String, UserRow> = BTreeMap::new();
        let message_users = self.messages.iter().flat_map(|m| m.users.iter());
        for user in self.users.iter().chain(message_users) {
            by_id.insert(user.id.clone(), user.clone());
        }
        by_id.into_values().collect()
    }
}

fn require<'a>(value: &'a str, entity: &'static str, field: &'static str) -> Result<&'a str> {
    if value.trim().is_empty() {
        return Err(MappingError::MissingField { entity, field });
    }
    Ok(value)
}

fn to_json<T: Serialize>(value: &T, entity: &'static str, field: &'static str) -> Result<String> {
    serde_json::to_string(value).map_err(|source| MappingError::Json {
        entity,
        field,
        source,
    })
}

/// Empty columns read back as the type's default.
fn from_json<T: DeserializeOwned + Default>(
    raw: &str,
    entity: &'static str,
    field: &'static str,
) -> Result<T> {
    if raw.is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(raw).map_err(|source| MappingError::Json {
        entity,
        field,
        source,
    })
}

fn lookup_user(users: &UserMap, id: &str) -> UserState {
    users.get(id).cloned().unwrap_or_else(|| UserState::new(id))
}

// -- Users --

pub fn to_storable_user(user: &UserState) -> Result<UserRow> {
    require(&user.id, "user", "id")?;
    Ok(UserRow {
        id: user.id.clone(),
        name: user.name.clone(),
        image: user.image.clone(),
        role: user.role.clone(),
        online: user.online,
        created_at: opt_to_millis(user.created_at),
        updated_at: opt_to_millis(user.updated_at),
        last_active: opt_to_millis(user.last_active),
        extra: to_json(&user.extra, "user", "extra")?,
    })
}

pub fn from_storable_user(row: &UserRow) -> Result<UserState> {
    let extra: Map<String, Value> = from_json(&row.extra, "user", "extra")?;
    Ok(UserState {
        id: row.id.clone(),
        name: row.name.clone(),
        image: row.image.clone(),
        role: row.role.clone(),
        online: row.online,
        created_at: opt_from_millis(row.created_at),
        updated_at: opt_from_millis(row.updated_at),
        last_active: opt_from_millis(row.last_active),
        extra,
    })
}

/// Resolve a batch of user rows into a lookup map.
pub fn user_map(rows: &[UserRow]) -> Result<UserMap> {
    rows.iter()
        .map(|row| from_storable_user(row).map(|user| (row.id.clone(), user)))
        .collect()
}

// -- Reactions --

pub fn to_storable_reaction(
    message_id: &str,
    reaction: &ReactionState,
    own: bool,
) -> Result<ReactionRow> {
    require(message_id, "reaction", "message_id")?;
    require(&reaction.kind, "reaction", "type")?;
    let user_id = reaction
        .author_id()
        .ok_or(MappingError::MissingField {
            entity: "reaction",
            field: "user_id",
        })?;
    require(user_id, "reaction", "user_id")?;

    Ok(ReactionRow {
        id: reaction_key(message_id, user_id, &reaction.kind),
        message_id: message_id.to_string(),
        user_id: user_id.to_string(),
        kind: reaction.kind.clone(),
        score: reaction.score,
        own,
        created_at: opt_to_millis(reaction.created_at),
        updated_at: opt_to_millis(reaction.updated_at),
    })
}

pub fn from_storable_reaction(row: &ReactionRow, users: &UserMap) -> ReactionState {
    ReactionState {
        message_id: row.message_id.clone(),
        kind: row.kind.clone(),
        user_id: Some(row.user_id.clone()),
        user: Some(lookup_user(users, &row.user_id)),
        score: row.score,
        created_at: opt_from_millis(row.created_at),
        updated_at: opt_from_millis(row.updated_at),
    }
}

// -- Messages --

/// Flatten a message. `cid` is used when the message does not carry its own.
pub fn to_storable_message(message: &MessageState, cid: &str) -> Result<NormalizedMessage> {
    require(&message.id, "message", "id")?;
    let cid = message
        .cid
        .as_deref()
        .filter(|c| !c.is_empty())
        .unwrap_or(cid);
    require(cid, "message", "cid")?;

    let mut users: BTreeMap<String, UserRow> = BTreeMap::new();

    let user_id = match &message.user {
        Some(user) => {
            let row = to_storable_user(user)?;
            let id = row.id.clone();
            users.insert(id.clone(), row);
            Some(id)
        }
        None => None,
    };

    let mut mentioned_user_ids = Vec::with_capacity(message.mentioned_users.len());
    for user in &message.mentioned_users {
        let row = to_storable_user(user)?;
        mentioned_user_ids.push(row.id.clone());
        users.insert(row.id.clone(), row);
    }

    // Own reactions go first so the `own` flag survives when the same
    // reaction also appears in the latest list.
    let mut reactions: BTreeMap<String, ReactionRow> = BTreeMap::new();
    let tagged = message
        .own_reactions
        .iter()
        .map(|r| (r, true))
        .chain(message.latest_reactions.iter().map(|r| (r, false)));
    for (reaction, own) in tagged {
        let row = to_storable_reaction(&message.id, reaction, own)?;
        if let Some(user) = &reaction.user {
            let user_row = to_storable_user(user)?;
            users.insert(user_row.id.clone(), user_row);
        }
        reactions.entry(row.id.clone()).or_insert(row);
    }

    let mut reaction_counts = Vec::with_capacity(message.reaction_counts.len());
    for (kind, count) in &message.reaction_counts {
        require(kind, "reaction_count", "type")?;
        reaction_counts.push(ReactionCountRow {
            id: reaction_count_key(&message.id, kind),
            message_id: message.id.clone(),
            kind: kind.clone(),
            count: (*count).max(0),
        });
    }

    let row = MessageRow {
        id: message.id.clone(),
        cid: cid.to_string(),
        user_id,
        text: message.text.clone(),
        kind: message.kind.clone(),
        attachments: to_json(&message.attachments, "message", "attachments")?,
        mentioned_user_ids: to_json(&mentioned_user_ids, "message", "mentioned_user_ids")?,
        parent_id: message.parent_id.clone().filter(|p| !p.is_empty()),
        reply_count: message.reply_count,
        show_in_channel: message.show_in_channel,
        pinned: message.pinned,
        created_at: to_millis(message.created_at),
        updated_at: opt_to_millis(message.updated_at),
        deleted_at: opt_to_millis(message.deleted_at),
    };

    Ok(NormalizedMessage {
        message: row,
        reactions: reactions.into_values().collect(),
        reaction_counts,
        users: users.into_values().collect(),
    })
}

/// Reassemble a message. `reactions` are expected newest first, the order
/// `latest_reactions` uses.
pub fn from_storable_message(
    row: &MessageRow,
    users: &UserMap,
    reactions: &[ReactionRow],
    counts: &[ReactionCountRow],
) -> Result<MessageState> {
    let attachments: Vec<Value> = from_json(&row.attachments, "message", "attachments")?;
    let mentioned_ids: Vec<String> =
        from_json(&row.mentioned_user_ids, "message", "mentioned_user_ids")?;

    let mut latest_reactions = Vec::with_capacity(reactions.len());
    let mut own_reactions = Vec::new();
    for reaction in reactions {
        let state = from_storable_reaction(reaction, users);
        if reaction.own {
            own_reactions.push(state.clone());
        }
        latest_reactions.push(state);
    }

    Ok(MessageState {
        id: row.id.clone(),
        cid: Some(row.cid.clone()),
        text: row.text.clone(),
        kind: row.kind.clone(),
        user: row.user_id.as_deref().map(|id| lookup_user(users, id)),
        attachments,
        mentioned_users: mentioned_ids.iter().map(|id| lookup_user(users, id)).collect(),
        latest_reactions,
        own_reactions,
        reaction_counts: counts
            .iter()
            .filter(|c| c.count > 0)
            .map(|c| (c.kind.clone(), c.count))
            .collect(),
        parent_id: row.parent_id.clone(),
        reply_count: row.reply_count,
        show_in_channel: row.show_in_channel,
        pinned: row.pinned,
        created_at: from_millis(row.created_at),
        updated_at: opt_from_millis(row.updated_at),
        deleted_at: opt_from_millis(row.deleted_at),
    })
}

/// Ids of users a message row references, author first.
pub fn message_user_ids(row: &MessageRow) -> Result<Vec<String>> {
    let mut ids: Vec<String> = from_json(&row.mentioned_user_ids, "message", "mentioned_user_ids")?;
    if let Some(author) = &row.user_id {
        ids.insert(0, author.clone());
    }
    Ok(ids)
}

// -- Members --

pub fn to_storable_member(cid: &str, member: &MemberState) -> Result<(MemberRow, Option<UserRow>)> {
    require(cid, "member", "cid")?;
    let user_id = member.member_id().ok_or(MappingError::MissingField {
        entity: "member",
        field: "user_id",
    })?;
    require(user_id, "member", "user_id")?;
    let user = member.user.as_ref().map(to_storable_user).transpose()?;

    let row = MemberRow {
        id: member_key(cid, user_id),
        cid: cid.to_string(),
        user_id: user_id.to_string(),
        role: member.role.clone(),
        invited: member.invited,
        invite_accepted_at: opt_to_millis(member.invite_accepted_at),
        invite_rejected_at: opt_to_millis(member.invite_rejected_at),
        is_moderator: member.is_moderator,
        created_at: opt_to_millis(member.created_at),
        updated_at: opt_to_millis(member.updated_at),
    };
    Ok((row, user))
}

pub fn from_storable_member(row: &MemberRow, users: &UserMap) -> MemberState {
    MemberState {
        user_id: Some(row.user_id.clone()),
        user: Some(lookup_user(users, &row.user_id)),
        role: row.role.clone(),
        invited: row.invited,
        invite_accepted_at: opt_from_millis(row.invite_accepted_at),
        invite_rejected_at: opt_from_millis(row.invite_rejected_at),
        is_moderator: row.is_moderator,
        created_at: opt_from_millis(row.created_at),
        updated_at: opt_from_millis(row.updated_at),
    }
}

// -- Reads --

pub fn to_storable_read(cid: &str, read: &ReadState) -> Result<(ReadRow, UserRow)> {
    require(cid, "read", "cid")?;
    let user = to_storable_user(&read.user)?;
    let row = ReadRow {
        id: read_key(cid, &user.id),
        cid: cid.to_string(),
        user_id: user.id.clone(),
        last_read: to_millis(read.last_read),
        unread_messages: read.unread_messages,
    };
    Ok((row, user))
}

/// Read rows become the `{ user_id: { user, last_read } }` map the client
/// keeps per channel.
pub fn from_storable_reads(rows: &[ReadRow], users: &UserMap) -> BTreeMap<String, ReadState> {
    rows.iter()
        .map(|row| {
            let state = ReadState {
                user: lookup_user(users, &row.user_id),
                last_read: from_millis(row.last_read),
                unread_messages: row.unread_messages,
            };
            (row.user_id.clone(), state)
        })
        .collect()
}

// -- Channel configs --

pub fn to_storable_config(config: &ChannelConfig) -> Result<NormalizedConfig> {
    require(&config.name, "channel_config", "name")?;
    config_rows(&config.name, config)
}

fn config_rows(channel_type: &str, config: &ChannelConfig) -> Result<NormalizedConfig> {
    let mut commands = Vec::with_capacity(config.commands.len());
    for (position, command) in config.commands.iter().enumerate() {
        require(&command.name, "command", "name")?;
        commands.push(CommandRow {
            id: command_key(channel_type, &command.name),
            channel_type: channel_type.to_string(),
            name: command.name.clone(),
            description: command.description.clone(),
            args: command.args.clone(),
            set_tag: command.set.clone(),
            position: position as i64,
        });
    }

    Ok(NormalizedConfig {
        config: ChannelConfigRow {
            channel_type: channel_type.to_string(),
            typing_events: config.typing_events,
            read_events: config.read_events,
            connect_events: config.connect_events,
            reactions: config.reactions,
            replies: config.replies,
            search: config.search,
            mutes: config.mutes,
            uploads: config.uploads,
            url_enrichment: config.url_enrichment,
            max_message_length: config.max_message_length,
            automod: config.automod.clone(),
            created_at: opt_to_millis(config.created_at),
            updated_at: opt_to_millis(config.updated_at),
        },
        commands,
    })
}

pub fn from_storable_config(row: &ChannelConfigRow, commands: &[CommandRow]) -> ChannelConfig {
    let mut ordered: Vec<&CommandRow> = commands.iter().collect();
    ordered.sort_by_key(|c| c.position);

    ChannelConfig {
        name: row.channel_type.clone(),
        typing_events: row.typing_events,
        read_events: row.read_events,
        connect_events: row.connect_events,
        reactions: row.reactions,
        replies: row.replies,
        search: row.search,
        mutes: row.mutes,
        uploads: row.uploads,
        url_enrichment: row.url_enrichment,
        max_message_length: row.max_message_length,
        automod: row.automod.clone(),
        commands: ordered
            .into_iter()
            .map(|c| Command {
                name: c.name.clone(),
                description: c.description.clone(),
                args: c.args.clone(),
                set: c.set_tag.clone(),
            })
            .collect(),
        created_at: opt_from_millis(row.created_at),
        updated_at: opt_from_millis(row.updated_at),
    }
}

// -- Channels --

pub fn to_storable_channel(channel: &ChannelState) -> Result<NormalizedChannel> {
    require(&channel.id, "channel", "id")?;
    require(&channel.kind, "channel", "type")?;
    require(&channel.cid, "channel", "cid")?;

    let config = match &channel.config {
        Some(config) if config.name.is_empty() => Some(config_rows(&channel.kind, config)?),
        Some(config) => Some(config_rows(&config.name, config)?),
        None => None,
    };

    let mut users: BTreeMap<String, UserRow> = BTreeMap::new();

    let mut members = Vec::with_capacity(channel.members.len());
    for member in &channel.members {
        let (row, user) = to_storable_member(&channel.cid, member)?;
        if let Some(user) = user {
            users.insert(user.id.clone(), user);
        }
        members.push(row);
    }

    let mut reads = Vec::with_capacity(channel.read.len());
    for read in channel.read.values() {
        let (row, user) = to_storable_read(&channel.cid, read)?;
        users.insert(user.id.clone(), user);
        reads.push(row);
    }

    // Timeline, thread replies and pinned messages all live in one message
    // table; the first copy of an id wins.
    let mut by_id: BTreeMap<&str, &MessageState> = BTreeMap::new();
    let all = channel
        .messages
        .iter()
        .chain(channel.threads.values().flatten())
        .chain(channel.pinned_messages.iter());
    for message in all {
        by_id.entry(message.id.as_str()).or_insert(message);
    }
    let pinned_ids: BTreeSet<&str> =
        channel.pinned_messages.iter().map(|m| m.id.as_str()).collect();
    let timeline_ids: BTreeSet<&str> = channel.messages.iter().map(|m| m.id.as_str()).collect();

    let mut messages = Vec::with_capacity(by_id.len());
    for message in by_id.values() {
        let mut normalized = to_storable_message(message, &channel.cid)?;
        if pinned_ids.contains(message.id.as_str()) {
            normalized.message.pinned = true;
        }
        if normalized.message.parent_id.is_some() && timeline_ids.contains(message.id.as_str()) {
            normalized.message.show_in_channel = true;
        }
        messages.push(normalized);
    }
    messages.sort_by(|a, b| {
        (a.message.created_at, &a.message.id).cmp(&(b.message.created_at, &b.message.id))
    });

    Ok(NormalizedChannel {
        channel: ChannelRow {
            cid: channel.cid.clone(),
            id: channel.id.clone(),
            channel_type: channel.kind.clone(),
            data: to_json(&channel.data, "channel", "data")?,
            initialized: channel.initialized,
        },
        config,
        members,
        messages,
        reads,
        users: users.into_values().collect(),
    })
}

/// Reassemble a channel from its row and already-rehydrated parts.
///
/// `messages` must be oldest first. Replies are moved into `threads`, or
/// copied there when they are also shown in the channel. Pinned messages
/// are copied into `pinned_messages`.
pub fn from_storable_channel(
    row: &ChannelRow,
    config: Option<ChannelConfig>,
    members: Vec<MemberState>,
    messages: Vec<MessageState>,
    read: BTreeMap<String, ReadState>,
) -> Result<ChannelState> {
    let data: Map<String, Value> = from_json(&row.data, "channel", "data")?;

    let mut timeline = Vec::new();
    let mut threads: BTreeMap<String, Vec<MessageState>> = BTreeMap::new();
    let mut pinned_messages = Vec::new();
    for message in messages {
        if message.pinned {
            pinned_messages.push(message.clone());
        }
        match message.parent_id.clone() {
            Some(parent) => {
                if message.show_in_channel {
                    timeline.push(message.clone());
                }
                threads.entry(parent).or_default().push(message);
            }
            None => timeline.push(message),
        }
    }

    Ok(ChannelState {
        id: row.id.clone(),
        kind: row.channel_type.clone(),
        cid: row.cid.clone(),
        data,
        initialized: row.initialized,
        config,
        members,
        messages: timeline,
        pinned_messages,
        threads,
        read,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn user(id: &str) -> UserState {
        let mut user = UserState::new(id);
        user.name = Some(format!("User {id}"));
        user
    }

    fn reaction(message_id: &str, user_id: &str, kind: &str) -> ReactionState {
        ReactionState {
            message_id: message_id.into(),
            kind: kind.into(),
            user_id: Some(user_id.into()),
            user: Some(user(user_id)),
            score: 1,
            created_at: Some(Utc.timestamp_millis_opt(1_700_000_000_000).unwrap()),
            updated_at: None,
        }
    }

    fn message_with_reactions() -> MessageState {
        let at = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let mut message = MessageState::new("m1", "hello", at);
        message.user = Some(user("author"));
        message.latest_reactions = vec![reaction("m1", "u1", "love"), reaction("m1", "u2", "like")];
        message.own_reactions = vec![reaction("m1", "u1", "love")];
        message.reaction_counts =
            BTreeMap::from([("love".to_string(), 1), ("like".to_string(), 1)]);
        message
    }

    #[test]
    fn message_roundtrip_keeps_identity_and_reaction_pairs() {
        let original = message_with_reactions();
        let normalized = to_storable_message(&original, "messaging:general").unwrap();

        let users = user_map(&normalized.users).unwrap();
        let restored = from_storable_message(
            &normalized.message,
            &users,
            &normalized.reactions,
            &normalized.reaction_counts,
        )
        .unwrap();

        assert_eq!(restored.id, original.id);
        assert_eq!(restored.text, original.text);
        assert_eq!(restored.user.as_ref().map(|u| u.id.as_str()), Some("author"));

        let pairs = |m: &MessageState| -> BTreeSet<(String, String)> {
            m.latest_reactions
                .iter()
                .map(|r| (r.kind.clone(), r.author_id().unwrap_or_default().to_string()))
                .collect()
        };
        assert_eq!(pairs(&restored), pairs(&original));
        assert_eq!(restored.own_reactions.len(), 1);
        assert_eq!(restored.reaction_counts, original.reaction_counts);
    }

    #[test]
    fn own_reaction_duplicated_in_latest_is_one_row() {
        let normalized =
            to_storable_message(&message_with_reactions(), "messaging:general").unwrap();
        assert_eq!(normalized.reactions.len(), 2);
        let love = normalized
            .reactions
            .iter()
            .find(|r| r.kind == "love")
            .unwrap();
        assert!(love.own);
        assert_eq!(love.id, "m1:u1:love");
    }

    #[test]
    fn message_users_are_deduplicated() {
        let mut message = message_with_reactions();
        message.mentioned_users = vec![user("u1"), user("author")];
        let normalized = to_storable_message(&message, "messaging:general").unwrap();
        let ids: Vec<&str> = normalized.users.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["author", "u1", "u2"]);
    }

    #[test]
    fn user_extra_fields_merge_back() {
        let mut original = user("u1");
        original.extra.insert("favorite_color".into(), json!("teal"));
        original.extra.insert("badges".into(), json!(["early", "mod"]));

        let row = to_storable_user(&original).unwrap();
        assert!(row.extra.contains("favorite_color"));

        let restored = from_storable_user(&row).unwrap();
        assert_eq!(restored, original);
    }

    #[test]
    fn missing_ids_are_rejected() {
        let message = MessageState::new("", "orphan", Utc::now());
        let err = to_storable_message(&message, "messaging:general").unwrap_err();
        assert!(matches!(
            err,
            MappingError::MissingField { entity: "message", field: "id" }
        ));

        let mut channel = ChannelState::new("messaging", "general");
        channel.kind.clear();
        assert!(to_storable_channel(&channel).is_err());

        let mut anonymous = reaction("m1", "u1", "love");
        anonymous.user_id = None;
        anonymous.user = None;
        assert!(to_storable_reaction("m1", &anonymous, false).is_err());
    }

    #[test]
    fn corrupt_extra_column_is_a_mapping_error() {
        let mut row = to_storable_user(&user("u1")).unwrap();
        row.extra = "{not json".into();
        assert!(matches!(
            from_storable_user(&row),
            Err(MappingError::Json { entity: "user", .. })
        ));
    }

    #[test]
    fn reads_become_user_keyed_map() {
        let read = ReadState {
            user: user("u1"),
            last_read: Utc.timestamp_millis_opt(1_700_000_500_000).unwrap(),
            unread_messages: 3,
        };
        let (row, user_row) = to_storable_read("messaging:general", &read).unwrap();
        assert_eq!(row.id, "messaging:general:u1");

        let users = user_map(&[user_row]).unwrap();
        let map = from_storable_reads(&[row], &users);
        assert_eq!(map.get("u1"), Some(&read));
    }

    #[test]
    fn channel_is_split_and_reassembled() {
        let base = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let mut channel = ChannelState::new("messaging", "general");
        channel.data.insert("name".into(), json!("General"));
        channel.members = vec![MemberState::for_user(user("u1"))];
        channel.config = Some(ChannelConfig {
            name: "messaging".into(),
            typing_events: true,
            read_events: true,
            connect_events: true,
            reactions: true,
            replies: true,
            search: false,
            mutes: true,
            uploads: true,
            url_enrichment: false,
            max_message_length: 5000,
            automod: "disabled".into(),
            commands: vec![
                Command {
                    name: "giphy".into(),
                    description: "Post a gif".into(),
                    args: "[text]".into(),
                    set: "fun_set".into(),
                },
                Command {
                    name: "mute".into(),
                    description: "Mute a user".into(),
                    args: "[@user]".into(),
                    set: "moderation_set".into(),
                },
            ],
            created_at: None,
            updated_at: None,
        });

        let root = MessageState::new("m1", "root", base);
        let mut reply = MessageState::new("m2", "reply", base + chrono::Duration::seconds(1));
        reply.parent_id = Some("m1".into());
        let mut pinned = MessageState::new("m3", "pinned", base + chrono::Duration::seconds(2));
        pinned.pinned = true;
        channel.messages = vec![root, pinned.clone()];
        channel.threads.insert("m1".into(), vec![reply]);
        channel.pinned_messages = vec![pinned];

        let normalized = to_storable_channel(&channel).unwrap();
        assert_eq!(normalized.messages.len(), 3);
        assert_eq!(normalized.config.as_ref().unwrap().commands.len(), 2);
        assert_eq!(normalized.members[0].id, "messaging:general:u1");

        let users = user_map(&normalized.all_users()).unwrap();
        let messages = normalized
            .messages
            .iter()
            .map(|m| from_storable_message(&m.message, &users, &m.reactions, &m.reaction_counts))
            .collect::<Result<Vec<_>>>()
            .unwrap();
        let members = normalized
            .members
            .iter()
            .map(|m| from_storable_member(m, &users))
            .collect();
        let config = normalized
            .config
            .as_ref()
            .map(|c| from_storable_config(&c.config, &c.commands));

        let restored =
            from_storable_channel(&normalized.channel, config, members, messages, BTreeMap::new())
                .unwrap();
        assert_eq!(restored.cid, "messaging:general");
        assert_eq!(restored.data.get("name"), Some(&json!("General")));
        let timeline: Vec<&str> = restored.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(timeline, vec!["m1", "m3"]);
        assert_eq!(restored.threads.get("m1").map(Vec::len), Some(1));
        assert_eq!(restored.pinned_messages.len(), 1);
        let commands: Vec<&str> = restored
            .config
            .as_ref()
            .unwrap()
            .commands
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(commands, vec!["giphy", "mute"]);
    }

    #[test]
    fn reply_shown_in_channel_stays_in_timeline() {
        let base = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let mut channel = ChannelState::new("messaging", "general");
        let mut reply = MessageState::new("r1", "reply", base + chrono::Duration::seconds(1));
        reply.parent_id = Some("m1".into());
        let mut hidden = MessageState::new("r2", "hidden", base + chrono::Duration::seconds(2));
        hidden.parent_id = Some("m1".into());
        channel.messages = vec![MessageState::new("m1", "root", base), reply];
        channel.threads.insert("m1".into(), vec![hidden]);

        let normalized = to_storable_channel(&channel).unwrap();
        let flags: Vec<(&str, bool)> = normalized
            .messages
            .iter()
            .map(|m| (m.message.id.as_str(), m.message.show_in_channel))
            .collect();
        assert_eq!(flags, vec![("m1", false), ("r1", true), ("r2", false)]);

        let users = user_map(&normalized.all_users()).unwrap();
        let messages = normalized
            .messages
            .iter()
            .map(|m| from_storable_message(&m.message, &users, &m.reactions, &m.reaction_counts))
            .collect::<Result<Vec<_>>>()
            .unwrap();
        let restored =
            from_storable_channel(&normalized.channel, None, Vec::new(), messages, BTreeMap::new())
                .unwrap();

        let timeline: Vec<&str> = restored.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(timeline, vec!["m1", "r1"]);
        let thread: Vec<&str> = restored.threads["m1"].iter().map(|m| m.id.as_str()).collect();
        assert_eq!(thread, vec!["r1", "r2"]);
    }
}
