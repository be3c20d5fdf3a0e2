use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A user as the live client sees it.
///
/// Only the profile fields the storage layer indexes are typed. Everything
/// else the server sends (custom profile fields) lands in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserState {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_active: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UserState {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            image: None,
            role: None,
            online: false,
            created_at: None,
            updated_at: None,
            last_active: None,
            extra: Map::new(),
        }
    }
}

/// A single reaction on a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionState {
    pub message_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserState>,
    #[serde(default = "default_score")]
    pub score: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

fn default_score() -> i64 {
    1
}

impl ReactionState {
    /// The reacting user's id, taken from the embedded user when the flat
    /// `user_id` field is absent.
    pub fn author_id(&self) -> Option<&str> {
        self.user_id
            .as_deref()
            .or_else(|| self.user.as_ref().map(|u| u.id.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageState {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(rename = "type", default = "default_message_kind")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserState>,
    #[serde(default)]
    pub attachments: Vec<Value>,
    #[serde(default)]
    pub mentioned_users: Vec<UserState>,
    #[serde(default)]
    pub latest_reactions: Vec<ReactionState>,
    #[serde(default)]
    pub own_reactions: Vec<ReactionState>,
    #[serde(default)]
    pub reaction_counts: BTreeMap<String, i64>,
    /// Set on thread replies: the id of the message that started the thread.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub reply_count: i64,
    /// A thread reply that is also shown in the channel timeline.
    #[serde(default)]
    pub show_in_channel: bool,
    #[serde(default)]
    pub pinned: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

fn default_message_kind() -> String {
    "regular".into()
}

impl MessageState {
    pub fn new(id: impl Into<String>, text: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            cid: None,
            text: text.into(),
            kind: default_message_kind(),
            user: None,
            attachments: Vec::new(),
            mentioned_users: Vec::new(),
            latest_reactions: Vec::new(),
            own_reactions: Vec::new(),
            reaction_counts: BTreeMap::new(),
            parent_id: None,
            reply_count: 0,
            show_in_channel: false,
            pinned: false,
            created_at,
            updated_at: None,
            deleted_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub invited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invite_accepted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invite_rejected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_moderator: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl MemberState {
    pub fn for_user(user: UserState) -> Self {
        Self {
            user_id: Some(user.id.clone()),
            user: Some(user),
            role: None,
            invited: false,
            invite_accepted_at: None,
            invite_rejected_at: None,
            is_moderator: false,
            created_at: None,
            updated_at: None,
        }
    }

    pub fn member_id(&self) -> Option<&str> {
        self.user_id
            .as_deref()
            .or_else(|| self.user.as_ref().map(|u| u.id.as_str()))
    }
}

/// Read marker of one user in one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadState {
    pub user: UserState,
    pub last_read: DateTime<Utc>,
    #[serde(default)]
    pub unread_messages: i64,
}

/// Slash command exposed by a channel type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub args: String,
    /// Behaviour tag, e.g. `fun_set` or `moderation_set`.
    #[serde(default)]
    pub set: String,
}

/// Per channel-type feature flags. `name` is the channel type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    #[serde(default)]
    pub typing_events: bool,
    #[serde(default)]
    pub read_events: bool,
    #[serde(default)]
    pub connect_events: bool,
    #[serde(default)]
    pub reactions: bool,
    #[serde(default)]
    pub replies: bool,
    #[serde(default)]
    pub search: bool,
    #[serde(default)]
    pub mutes: bool,
    #[serde(default)]
    pub uploads: bool,
    #[serde(default)]
    pub url_enrichment: bool,
    #[serde(default)]
    pub max_message_length: i64,
    #[serde(default)]
    pub automod: String,
    #[serde(default)]
    pub commands: Vec<Command>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Live state of one channel as held by the transport client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelState {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub cid: String,
    /// Opaque channel data (name, image, custom fields).
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub initialized: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ChannelConfig>,
    #[serde(default)]
    pub members: Vec<MemberState>,
    /// Main channel timeline, oldest first.
    #[serde(default)]
    pub messages: Vec<MessageState>,
    #[serde(default)]
    pub pinned_messages: Vec<MessageState>,
    /// Thread replies keyed by parent message id, oldest first.
    #[serde(default)]
    pub threads: BTreeMap<String, Vec<MessageState>>,
    /// Read markers keyed by user id.
    #[serde(default)]
    pub read: BTreeMap<String, ReadState>,
}

impl ChannelState {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        let kind = kind.into();
        let id = id.into();
        Self {
            cid: format!("{kind}:{id}"),
            id,
            kind,
            data: Map::new(),
            initialized: true,
            config: None,
            members: Vec::new(),
            messages: Vec::new(),
            pinned_messages: Vec::new(),
            threads: BTreeMap::new(),
            read: BTreeMap::new(),
        }
    }
}

/// Whole-client state captured for the coarse snapshot cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default)]
    pub users: BTreeMap<String, UserState>,
    /// Remaining client state the storage layer does not interpret.
    #[serde(default)]
    pub state: Map<String, Value>,
}
