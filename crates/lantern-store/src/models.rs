//! Storage row types. These map directly to SQLite rows in the structured
//! backend and to JSON values in the flat backend. Distinct from the
//! lantern-types live models so the storage layout can change without
//! touching the client-facing shapes.
//!
//! Timestamps are UTC milliseconds.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRow {
    pub id: String,
    pub name: Option<String>,
    pub image: Option<String>,
    pub role: Option<String>,
    pub online: bool,
    pub created_at: Option<i64>,
    pub updated_at: Option<i64>,
    pub last_active: Option<i64>,
    /// Every profile property without a column, as one JSON object.
    pub extra: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfigRow {
    pub channel_type: String,
    pub typing_events: bool,
    pub read_events: bool,
    pub connect_events: bool,
    pub reactions: bool,
    pub replies: bool,
    pub search: bool,
    pub mutes: bool,
    pub uploads: bool,
    pub url_enrichment: bool,
    pub max_message_length: i64,
    pub automod: String,
    pub created_at: Option<i64>,
    pub updated_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRow {
    pub id: String,
    pub channel_type: String,
    pub name: String,
    pub description: String,
    pub args: String,
    pub set_tag: String,
    pub position: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelRow {
    pub cid: String,
    pub id: String,
    pub channel_type: String,
    pub data: String,
    pub initialized: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberRow {
    pub id: String,
    pub cid: String,
    pub user_id: String,
    pub role: Option<String>,
    pub invited: bool,
    pub invite_accepted_at: Option<i64>,
    pub invite_rejected_at: Option<i64>,
    pub is_moderator: bool,
    pub created_at: Option<i64>,
    pub updated_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: String,
    pub cid: String,
    pub user_id: Option<String>,
    pub text: String,
    pub kind: String,
    pub attachments: String,
    pub mentioned_user_ids: String,
    pub parent_id: Option<String>,
    pub reply_count: i64,
    #[serde(default)]
    pub show_in_channel: bool,
    pub pinned: bool,
    pub created_at: i64,
    pub updated_at: Option<i64>,
    pub deleted_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionRow {
    pub id: String,
    pub message_id: String,
    pub user_id: String,
    pub kind: String,
    pub score: i64,
    /// Came from the connected user's own reaction list.
    pub own: bool,
    pub created_at: Option<i64>,
    pub updated_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionCountRow {
    pub id: String,
    pub message_id: String,
    pub kind: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadRow {
    pub id: String,
    pub cid: String,
    pub user_id: String,
    pub last_read: i64,
    pub unread_messages: i64,
}

// -- Composite keys --

pub fn member_key(cid: &str, user_id: &str) -> String {
    format!("{cid}:{user_id}")
}

pub fn read_key(cid: &str, user_id: &str) -> String {
    format!("{cid}:{user_id}")
}

pub fn reaction_key(message_id: &str, user_id: &str, kind: &str) -> String {
    format!("{message_id}:{user_id}:{kind}")
}

pub fn reaction_count_key(message_id: &str, kind: &str) -> String {
    format!("{message_id}:{kind}")
}

pub fn command_key(channel_type: &str, name: &str) -> String {
    format!("{channel_type}:{name}")
}

// -- Timestamps --

pub fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub fn opt_to_millis(ts: Option<DateTime<Utc>>) -> Option<i64> {
    ts.map(to_millis)
}

/// Out-of-range values fall back to the epoch rather than failing the read.
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(|| {
        tracing::warn!("Corrupt timestamp {} in storage, using epoch", ms);
        DateTime::default()
    })
}

pub fn opt_from_millis(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(from_millis)
}
