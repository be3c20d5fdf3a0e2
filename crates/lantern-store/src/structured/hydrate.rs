use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use lantern_types::{ChannelConfig, ChannelQuery, ChannelState, MessageState};
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::debug;

use super::Database;
use crate::error::Result;
use crate::mapper::{
    UserMap, from_storable_channel, from_storable_config, from_storable_member,
    from_storable_message, from_storable_reads, message_user_ids, user_map,
};
use crate::models::{
    ChannelConfigRow, ChannelRow, CommandRow, MemberRow, MessageRow, ReactionCountRow, ReactionRow,
    ReadRow, UserRow, to_millis,
};

/// SQLite's default host parameter limit is far above this; chunking keeps
/// very large channels from building one enormous statement.
const IN_CHUNK: usize = 500;

const MESSAGE_COLUMNS: &str = "id, cid, user_id, text, kind, attachments, mentioned_user_ids, \
     parent_id, reply_count, pinned, created_at, updated_at, deleted_at, show_in_channel";

impl Database {
    /// Rehydrate one page of the channels stored for `query`, in list order.
    /// Listed channels whose rows are gone are skipped.
    pub fn query_channels(
        &self,
        query: &ChannelQuery,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ChannelState>> {
        let signature = query.signature();
        let (offset, limit) = (sql_count(offset), sql_count(limit));
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT cid FROM query_channels WHERE signature = ?1 ORDER BY position LIMIT ?2 OFFSET ?3",
            )?;
            let cids = stmt
                .query_map(params![signature, limit, offset], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut channels = Vec::with_capacity(cids.len());
            for cid in &cids {
                match load_channel(conn, cid)? {
                    Some(channel) => channels.push(channel),
                    None => debug!("Query {} lists {} but it is not cached", signature, cid),
                }
            }
            Ok(channels)
        })
    }

    /// Up to `limit` messages of a channel older than `before`, oldest first.
    pub fn query_messages(
        &self,
        cid: &str,
        limit: usize,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<MessageState>> {
        let before = before.map(to_millis);
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE cid = ?1 AND (?2 IS NULL OR created_at < ?2)
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?3"
            ))?;
            let mut rows = stmt
                .query_map(params![cid, before, sql_count(limit)], read_message_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.reverse();

            let parts = MessageParts::load(conn, rows)?;
            let users = load_users(conn, parts.user_ids()?)?;
            parts.into_states(&users)
        })
    }
}

fn load_channel(conn: &Connection, cid: &str) -> Result<Option<ChannelState>> {
    let channel: Option<ChannelRow> = conn
        .query_row(
            "SELECT cid, id, channel_type, data, initialized FROM channels WHERE cid = ?1",
            [cid],
            |row| {
                Ok(ChannelRow {
                    cid: row.get(0)?,
                    id: row.get(1)?,
                    channel_type: row.get(2)?,
                    data: row.get(3)?,
                    initialized: row.get(4)?,
                })
            },
        )
        .optional()?;
    let Some(channel) = channel else {
        return Ok(None);
    };

    let config = load_config(conn, &channel.channel_type)?;

    let mut stmt = conn.prepare(
        "SELECT id, cid, user_id, role, invited, invite_accepted_at, invite_rejected_at,
                is_moderator, created_at, updated_at
         FROM members WHERE cid = ?1
         ORDER BY created_at, user_id",
    )?;
    let members = stmt
        .query_map([cid], |row| {
            Ok(MemberRow {
                id: row.get(0)?,
                cid: row.get(1)?,
                user_id: row.get(2)?,
                role: row.get(3)?,
                invited: row.get(4)?,
                invite_accepted_at: row.get(5)?,
                invite_rejected_at: row.get(6)?,
                is_moderator: row.get(7)?,
                created_at: row.get(8)?,
                updated_at: row.get(9)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT id, cid, user_id, last_read, unread_messages FROM reads WHERE cid = ?1 ORDER BY user_id",
    )?;
    let reads = stmt
        .query_map([cid], |row| {
            Ok(ReadRow {
                id: row.get(0)?,
                cid: row.get(1)?,
                user_id: row.get(2)?,
                last_read: row.get(3)?,
                unread_messages: row.get(4)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE cid = ?1 ORDER BY created_at, id"
    ))?;
    let message_rows = stmt
        .query_map([cid], read_message_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let parts = MessageParts::load(conn, message_rows)?;

    let mut user_ids = parts.user_ids()?;
    user_ids.extend(members.iter().map(|m| m.user_id.clone()));
    user_ids.extend(reads.iter().map(|r| r.user_id.clone()));
    let users = load_users(conn, user_ids)?;

    let messages = parts.into_states(&users)?;
    let members = members.iter().map(|m| from_storable_member(m, &users)).collect();
    let read = from_storable_reads(&reads, &users);

    Ok(Some(from_storable_channel(&channel, config, members, messages, read)?))
}

fn load_config(conn: &Connection, channel_type: &str) -> Result<Option<ChannelConfig>> {
    let row: Option<ChannelConfigRow> = conn
        .query_row(
            "SELECT channel_type, typing_events, read_events, connect_events, reactions, replies,
                    search, mutes, uploads, url_enrichment, max_message_length, automod,
                    created_at, updated_at
             FROM channel_configs WHERE channel_type = ?1",
            [channel_type],
            |row| {
                Ok(ChannelConfigRow {
                    channel_type: row.get(0)?,
                    typing_events: row.get(1)?,
                    read_events: row.get(2)?,
                    connect_events: row.get(3)?,
                    reactions: row.get(4)?,
                    replies: row.get(5)?,
                    search: row.get(6)?,
                    mutes: row.get(7)?,
                    uploads: row.get(8)?,
                    url_enrichment: row.get(9)?,
                    max_message_length: row.get(10)?,
                    automod: row.get(11)?,
                    created_at: row.get(12)?,
                    updated_at: row.get(13)?,
                })
            },
        )
        .optional()?;
    let Some(row) = row else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT id, channel_type, name, description, args, set_tag, position
         FROM commands WHERE channel_type = ?1 ORDER BY position",
    )?;
    let commands = stmt
        .query_map([channel_type], |row| {
            Ok(CommandRow {
                id: row.get(0)?,
                channel_type: row.get(1)?,
                name: row.get(2)?,
                description: row.get(3)?,
                args: row.get(4)?,
                set_tag: row.get(5)?,
                position: row.get(6)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(Some(from_storable_config(&row, &commands)))
}

/// Message rows plus their reactions and counts, grouped by message id.
struct MessageParts {
    rows: Vec<MessageRow>,
    reactions: HashMap<String, Vec<ReactionRow>>,
    counts: HashMap<String, Vec<ReactionCountRow>>,
}

impl MessageParts {
    fn load(conn: &Connection, rows: Vec<MessageRow>) -> Result<Self> {
        let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
        let mut reactions: HashMap<String, Vec<ReactionRow>> = HashMap::new();
        let mut counts: HashMap<String, Vec<ReactionCountRow>> = HashMap::new();

        for chunk in ids.chunks(IN_CHUNK) {
            let placeholders = placeholders(chunk.len());

            // Newest first, matching `latest_reactions`.
            let mut stmt = conn.prepare(&format!(
                "SELECT id, message_id, user_id, kind, score, own, created_at, updated_at
                 FROM reactions WHERE message_id IN ({placeholders})
                 ORDER BY created_at DESC, id"
            ))?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(chunk), |row| {
                    Ok(ReactionRow {
                        id: row.get(0)?,
                        message_id: row.get(1)?,
                        user_id: row.get(2)?,
                        kind: row.get(3)?,
                        score: row.get(4)?,
                        own: row.get(5)?,
                        created_at: row.get(6)?,
                        updated_at: row.get(7)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            for row in rows {
                reactions.entry(row.message_id.clone()).or_default().push(row);
            }

            let mut stmt = conn.prepare(&format!(
                "SELECT id, message_id, kind, count FROM reaction_counts
                 WHERE message_id IN ({placeholders}) ORDER BY kind"
            ))?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(chunk), |row| {
                    Ok(ReactionCountRow {
                        id: row.get(0)?,
                        message_id: row.get(1)?,
                        kind: row.get(2)?,
                        count: row.get(3)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            for row in rows {
                counts.entry(row.message_id.clone()).or_default().push(row);
            }
        }

        Ok(Self { rows, reactions, counts })
    }

    fn user_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for row in &self.rows {
            ids.extend(message_user_ids(row)?);
        }
        ids.extend(self.reactions.values().flatten().map(|r| r.user_id.clone()));
        Ok(ids)
    }

    fn into_states(self, users: &UserMap) -> Result<Vec<MessageState>> {
        let empty_reactions = Vec::new();
        let empty_counts = Vec::new();
        self.rows
            .iter()
            .map(|row| -> Result<MessageState> {
                let reactions = self.reactions.get(&row.id).unwrap_or(&empty_reactions);
                let counts = self.counts.get(&row.id).unwrap_or(&empty_counts);
                Ok(from_storable_message(row, users, reactions, counts)?)
            })
            .collect()
    }
}

fn load_users(conn: &Connection, ids: Vec<String>) -> Result<UserMap> {
    let ids: Vec<String> = ids.into_iter().collect::<BTreeSet<_>>().into_iter().collect();
    let mut rows = Vec::with_capacity(ids.len());

    for chunk in ids.chunks(IN_CHUNK) {
        let mut stmt = conn.prepare(&format!(
            "SELECT id, name, image, role, online, created_at, updated_at, last_active, extra
             FROM users WHERE id IN ({})",
            placeholders(chunk.len())
        ))?;
        let found = stmt
            .query_map(rusqlite::params_from_iter(chunk), |row| {
                Ok(UserRow {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    image: row.get(2)?,
                    role: row.get(3)?,
                    online: row.get(4)?,
                    created_at: row.get(5)?,
                    updated_at: row.get(6)?,
                    last_active: row.get(7)?,
                    extra: row.get(8)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.extend(found);
    }

    Ok(user_map(&rows)?)
}

fn read_message_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        cid: row.get(1)?,
        user_id: row.get(2)?,
        text: row.get(3)?,
        kind: row.get(4)?,
        attachments: row.get(5)?,
        mentioned_user_ids: row.get(6)?,
        parent_id: row.get(7)?,
        reply_count: row.get(8)?,
        pinned: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
        deleted_at: row.get(12)?,
        show_in_channel: row.get(13)?,
    })
}

/// Clamp a page bound into SQLite's integer range. A plain cast would wrap
/// large values negative, which SQLite reads as "no bound".
fn sql_count(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn placeholders(n: usize) -> String {
    (1..=n).map(|i| format!("?{}", i)).collect::<Vec<_>>().join(", ")
}
