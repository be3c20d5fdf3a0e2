use chrono::Utc;
use lantern_types::{
    ChannelQuery, ChannelState, MemberState, MessageState, ReactionState, ReadState,
};
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::{Map, Value};
use tracing::debug;

use super::Database;
use crate::error::{MappingError, Result};
use crate::mapper::{
    NormalizedChannel, NormalizedConfig, NormalizedMessage, to_storable_channel, to_storable_member,
    to_storable_message, to_storable_reaction, to_storable_read, to_storable_user,
};
use crate::models::{
    ChannelRow, MemberRow, ReactionRow, ReadRow, UserRow, member_key, reaction_count_key,
    reaction_key,
};

impl Database {
    // -- Channels --

    /// Persist a page of channels for `query`.
    ///
    /// With `resync` the query's channel list is replaced by this page;
    /// otherwise the page is appended, skipping channels already listed.
    /// Rows of channels dropped from the list stay until `sweep_orphans`.
    pub fn store_channels(
        &self,
        query: &ChannelQuery,
        channels: &[ChannelState],
        resync: bool,
    ) -> Result<()> {
        let normalized = channels
            .iter()
            .map(to_storable_channel)
            .collect::<std::result::Result<Vec<_>, MappingError>>()?;
        let signature = query.signature();
        let cids: Vec<&str> = normalized.iter().map(|c| c.channel.cid.as_str()).collect();

        self.with_tx(|tx| {
            for channel in &normalized {
                write_channel(tx, channel)?;
            }
            link_query(tx, &signature, &cids, resync)
        })?;

        debug!(
            "Stored {} channels for query {} (resync={})",
            normalized.len(),
            signature,
            resync
        );
        Ok(())
    }

    pub fn update_channel_data(&self, cid: &str, data: &Map<String, Value>) -> Result<()> {
        let raw = serde_json::to_string(data)?;
        self.with_tx(|tx| {
            let updated =
                tx.execute("UPDATE channels SET data = ?2 WHERE cid = ?1", params![cid, raw])?;
            if updated == 0 {
                debug!("Channel {} not cached, data update skipped", cid);
            }
            Ok(())
        })
    }

    // -- Messages --

    pub fn insert_messages(&self, cid: &str, messages: &[MessageState]) -> Result<()> {
        let normalized = messages
            .iter()
            .map(|m| to_storable_message(m, cid))
            .collect::<std::result::Result<Vec<_>, MappingError>>()?;

        self.with_tx(|tx| {
            for message in &normalized {
                write_message(tx, message)?;
            }
            Ok(())
        })
    }

    /// Update a cached message in place. Messages that were never cached
    /// are left alone.
    pub fn update_message(&self, message: &MessageState) -> Result<()> {
        self.with_tx(|tx| {
            let cid: Option<String> = tx
                .query_row("SELECT cid FROM messages WHERE id = ?1", [&message.id], |r| r.get(0))
                .optional()?;
            let Some(cid) = cid else {
                debug!("Message {} not cached, update skipped", message.id);
                return Ok(());
            };
            let normalized = to_storable_message(message, &cid)?;
            write_message(tx, &normalized)
        })
    }

    // -- Reactions --

    /// Record a reaction. The per-type count is bumped only when the
    /// reaction row is new, so replaying the same event is harmless.
    pub fn add_reaction(&self, reaction: &ReactionState, own: bool) -> Result<()> {
        let row = to_storable_reaction(&reaction.message_id, reaction, own)?;
        let user = reaction.user.as_ref().map(to_storable_user).transpose()?;

        self.with_tx(|tx| {
            let cached: Option<String> = tx
                .query_row("SELECT id FROM messages WHERE id = ?1", [&row.message_id], |r| r.get(0))
                .optional()?;
            if cached.is_none() {
                debug!("Message {} not cached, reaction skipped", row.message_id);
                return Ok(());
            }
            match &user {
                Some(user) => upsert_user(tx, user)?,
                None => ensure_user(tx, &row.user_id)?,
            }
            if insert_reaction(tx, &row)? {
                tx.execute(
                    "INSERT INTO reaction_counts (id, message_id, kind, count) VALUES (?1, ?2, ?3, 1)
                     ON CONFLICT(id) DO UPDATE SET count = count + 1",
                    params![
                        reaction_count_key(&row.message_id, &row.kind),
                        row.message_id,
                        row.kind,
                    ],
                )?;
            }
            Ok(())
        })
    }

    /// Remove a reaction. The count is decremented only when a row was
    /// actually removed, and never below zero.
    pub fn delete_reaction(&self, reaction: &ReactionState) -> Result<()> {
        let user_id = reaction.author_id().ok_or(MappingError::MissingField {
            entity: "reaction",
            field: "user_id",
        })?;
        let id = reaction_key(&reaction.message_id, user_id, &reaction.kind);

        self.with_tx(|tx| {
            let removed = tx.execute("DELETE FROM reactions WHERE id = ?1", [&id])?;
            if removed > 0 {
                tx.execute(
                    "UPDATE reaction_counts SET count = MAX(count - 1, 0) WHERE id = ?1",
                    [reaction_count_key(&reaction.message_id, &reaction.kind)],
                )?;
            }
            Ok(())
        })
    }

    // -- Members --

    pub fn add_member(&self, cid: &str, member: &MemberState) -> Result<()> {
        let (row, user) = to_storable_member(cid, member)?;
        self.with_tx(|tx| {
            write_user_ref(tx, &row.user_id, user.as_ref())?;
            upsert_member(tx, &row)
        })
    }

    pub fn remove_member(&self, cid: &str, user_id: &str) -> Result<()> {
        self.with_tx(|tx| {
            tx.execute("DELETE FROM members WHERE id = ?1", [member_key(cid, user_id)])?;
            Ok(())
        })
    }

    /// Update a cached membership. Memberships that were never cached are
    /// left alone.
    pub fn update_member(&self, cid: &str, member: &MemberState) -> Result<()> {
        let (row, user) = to_storable_member(cid, member)?;
        self.with_tx(|tx| {
            let exists: Option<String> = tx
                .query_row("SELECT id FROM members WHERE id = ?1", [&row.id], |r| r.get(0))
                .optional()?;
            if exists.is_none() {
                debug!("Member {} not cached, update skipped", row.id);
                return Ok(());
            }
            write_user_ref(tx, &row.user_id, user.as_ref())?;
            upsert_member(tx, &row)
        })
    }

    // -- Reads --

    pub fn update_read(&self, cid: &str, read: &ReadState) -> Result<()> {
        let (row, user) = to_storable_read(cid, read)?;
        self.with_tx(|tx| {
            upsert_user(tx, &user)?;
            upsert_read(tx, &row)
        })
    }

    // -- Maintenance --

    /// Drop every cached message of a channel (reactions and counts follow
    /// through the foreign keys).
    pub fn truncate_channel(&self, cid: &str) -> Result<()> {
        self.with_tx(|tx| {
            let removed = tx.execute("DELETE FROM messages WHERE cid = ?1", [cid])?;
            debug!("Truncated {} messages from {}", removed, cid);
            Ok(())
        })
    }

    /// Remove channels no query lists any more, then users nothing
    /// references. Returns the number of rows removed.
    pub fn sweep_orphans(&self) -> Result<usize> {
        self.with_tx(|tx| {
            let channels = tx.execute(
                "DELETE FROM channels WHERE cid NOT IN (SELECT cid FROM query_channels)",
                [],
            )?;
            let users = tx.execute(
                "DELETE FROM users
                 WHERE id NOT IN (SELECT user_id FROM members)
                   AND id NOT IN (SELECT user_id FROM reads)
                   AND id NOT IN (SELECT user_id FROM reactions)
                   AND id NOT IN (SELECT user_id FROM messages WHERE user_id IS NOT NULL)
                   AND id NOT IN (SELECT j.value FROM messages, json_each(messages.mentioned_user_ids) AS j)",
                [],
            )?;
            debug!("Swept {} orphan channels and {} orphan users", channels, users);
            Ok(channels + users)
        })
    }

    pub fn delete_all(&self) -> Result<()> {
        self.with_tx(|tx| {
            tx.execute_batch(
                "DELETE FROM reactions;
                 DELETE FROM reaction_counts;
                 DELETE FROM reads;
                 DELETE FROM members;
                 DELETE FROM messages;
                 DELETE FROM query_channels;
                 DELETE FROM queries;
                 DELETE FROM channels;
                 DELETE FROM commands;
                 DELETE FROM channel_configs;
                 DELETE FROM users;",
            )?;
            Ok(())
        })
    }

    // -- Inspection --

    /// Current count for one reaction type on a message, zero when absent.
    pub fn reaction_count(&self, message_id: &str, kind: &str) -> Result<i64> {
        self.with_conn(|conn| {
            let count: Option<i64> = conn
                .query_row(
                    "SELECT count FROM reaction_counts WHERE id = ?1",
                    [reaction_count_key(message_id, kind)],
                    |r| r.get(0),
                )
                .optional()?;
            Ok(count.unwrap_or(0))
        })
    }

    pub fn has_reaction(&self, message_id: &str, user_id: &str, kind: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let found: Option<String> = conn
                .query_row(
                    "SELECT id FROM reactions WHERE id = ?1",
                    [reaction_key(message_id, user_id, kind)],
                    |r| r.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }
}

// -- Row writers. Callers hold a transaction. --

fn write_channel(conn: &Connection, channel: &NormalizedChannel) -> Result<()> {
    for user in channel.all_users() {
        upsert_user(conn, &user)?;
    }
    if let Some(config) = &channel.config {
        write_config(conn, config)?;
    }
    upsert_channel(conn, &channel.channel)?;
    for member in &channel.members {
        ensure_user(conn, &member.user_id)?;
        upsert_member(conn, member)?;
    }
    for read in &channel.reads {
        ensure_user(conn, &read.user_id)?;
        upsert_read(conn, read)?;
    }
    for message in &channel.messages {
        write_message(conn, message)?;
    }
    Ok(())
}

/// Append (or with `resync`, replace) the query's channel list. A cid
/// already in the list keeps its original position.
fn link_query(conn: &Connection, signature: &str, cids: &[&str], resync: bool) -> Result<()> {
    conn.execute(
        "INSERT INTO queries (signature, updated_at) VALUES (?1, ?2)
         ON CONFLICT(signature) DO UPDATE SET updated_at = excluded.updated_at",
        params![signature, Utc::now().timestamp_millis()],
    )?;

    if resync {
        conn.execute("DELETE FROM query_channels WHERE signature = ?1", [signature])?;
    }

    let mut next: i64 = conn.query_row(
        "SELECT COALESCE(MAX(position) + 1, 0) FROM query_channels WHERE signature = ?1",
        [signature],
        |r| r.get(0),
    )?;
    for cid in cids {
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO query_channels (signature, cid, position) VALUES (?1, ?2, ?3)",
            params![signature, cid, next],
        )?;
        next += inserted as i64;
    }
    Ok(())
}

fn write_config(conn: &Connection, config: &NormalizedConfig) -> Result<()> {
    let c = &config.config;
    conn.execute(
        "INSERT INTO channel_configs (
            channel_type, typing_events, read_events, connect_events, reactions, replies,
            search, mutes, uploads, url_enrichment, max_message_length, automod, created_at, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
         ON CONFLICT(channel_type) DO UPDATE SET
            typing_events = excluded.typing_events,
            read_events = excluded.read_events,
            connect_events = excluded.connect_events,
            reactions = excluded.reactions,
            replies = excluded.replies,
            search = excluded.search,
            mutes = excluded.mutes,
            uploads = excluded.uploads,
            url_enrichment = excluded.url_enrichment,
            max_message_length = excluded.max_message_length,
            automod = excluded.automod,
            created_at = excluded.created_at,
            updated_at = excluded.updated_at",
        params![
            c.channel_type,
            c.typing_events,
            c.read_events,
            c.connect_events,
            c.reactions,
            c.replies,
            c.search,
            c.mutes,
            c.uploads,
            c.url_enrichment,
            c.max_message_length,
            c.automod,
            c.created_at,
            c.updated_at,
        ],
    )?;

    // Commands are replaced wholesale: the server sends the full list.
    conn.execute("DELETE FROM commands WHERE channel_type = ?1", [&c.channel_type])?;
    for command in &config.commands {
        conn.execute(
            "INSERT INTO commands (id, channel_type, name, description, args, set_tag, position)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                command.id,
                command.channel_type,
                command.name,
                command.description,
                command.args,
                command.set_tag,
                command.position,
            ],
        )?;
    }
    Ok(())
}

fn upsert_channel(conn: &Connection, channel: &ChannelRow) -> Result<()> {
    conn.execute(
        "INSERT INTO channels (cid, id, channel_type, data, initialized) VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(cid) DO UPDATE SET
            id = excluded.id,
            channel_type = excluded.channel_type,
            data = excluded.data,
            initialized = excluded.initialized",
        params![channel.cid, channel.id, channel.channel_type, channel.data, channel.initialized],
    )?;
    Ok(())
}

/// Upsert the message row and make its reactions and counts match the
/// server's view of that message.
fn write_message(conn: &Connection, normalized: &NormalizedMessage) -> Result<()> {
    for user in &normalized.users {
        upsert_user(conn, user)?;
    }

    let m = &normalized.message;
    if let Some(author) = &m.user_id {
        ensure_user(conn, author)?;
    }
    conn.execute(
        "INSERT INTO messages (
            id, cid, user_id, text, kind, attachments, mentioned_user_ids, parent_id,
            reply_count, pinned, created_at, updated_at, deleted_at, show_in_channel
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
         ON CONFLICT(id) DO UPDATE SET
            cid = excluded.cid,
            user_id = excluded.user_id,
            text = excluded.text,
            kind = excluded.kind,
            attachments = excluded.attachments,
            mentioned_user_ids = excluded.mentioned_user_ids,
            parent_id = excluded.parent_id,
            reply_count = excluded.reply_count,
            pinned = excluded.pinned,
            created_at = excluded.created_at,
            updated_at = excluded.updated_at,
            deleted_at = excluded.deleted_at,
            show_in_channel = excluded.show_in_channel",
        params![
            m.id,
            m.cid,
            m.user_id,
            m.text,
            m.kind,
            m.attachments,
            m.mentioned_user_ids,
            m.parent_id,
            m.reply_count,
            m.pinned,
            m.created_at,
            m.updated_at,
            m.deleted_at,
            m.show_in_channel,
        ],
    )?;

    conn.execute("DELETE FROM reactions WHERE message_id = ?1", [&m.id])?;
    for reaction in &normalized.reactions {
        ensure_user(conn, &reaction.user_id)?;
        insert_reaction(conn, reaction)?;
    }

    conn.execute("DELETE FROM reaction_counts WHERE message_id = ?1", [&m.id])?;
    for count in &normalized.reaction_counts {
        conn.execute(
            "INSERT INTO reaction_counts (id, message_id, kind, count) VALUES (?1, ?2, ?3, ?4)",
            params![count.id, count.message_id, count.kind, count.count],
        )?;
    }
    Ok(())
}

/// Returns whether a new row was written.
fn insert_reaction(conn: &Connection, reaction: &ReactionRow) -> Result<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO reactions (id, message_id, user_id, kind, score, own, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            reaction.id,
            reaction.message_id,
            reaction.user_id,
            reaction.kind,
            reaction.score,
            reaction.own,
            reaction.created_at,
            reaction.updated_at,
        ],
    )?;
    Ok(inserted > 0)
}

fn upsert_member(conn: &Connection, member: &MemberRow) -> Result<()> {
    conn.execute(
        "INSERT INTO members (
            id, cid, user_id, role, invited, invite_accepted_at, invite_rejected_at,
            is_moderator, created_at, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(id) DO UPDATE SET
            role = excluded.role,
            invited = excluded.invited,
            invite_accepted_at = excluded.invite_accepted_at,
            invite_rejected_at = excluded.invite_rejected_at,
            is_moderator = excluded.is_moderator,
            created_at = excluded.created_at,
            updated_at = excluded.updated_at",
        params![
            member.id,
            member.cid,
            member.user_id,
            member.role,
            member.invited,
            member.invite_accepted_at,
            member.invite_rejected_at,
            member.is_moderator,
            member.created_at,
            member.updated_at,
        ],
    )?;
    Ok(())
}

fn upsert_read(conn: &Connection, read: &ReadRow) -> Result<()> {
    conn.execute(
        "INSERT INTO reads (id, cid, user_id, last_read, unread_messages) VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(id) DO UPDATE SET
            last_read = excluded.last_read,
            unread_messages = excluded.unread_messages",
        params![read.id, read.cid, read.user_id, read.last_read, read.unread_messages],
    )?;
    Ok(())
}

fn upsert_user(conn: &Connection, user: &UserRow) -> Result<()> {
    conn.execute(
        "INSERT INTO users (id, name, image, role, online, created_at, updated_at, last_active, extra)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            image = excluded.image,
            role = excluded.role,
            online = excluded.online,
            created_at = excluded.created_at,
            updated_at = excluded.updated_at,
            last_active = excluded.last_active,
            extra = excluded.extra",
        params![
            user.id,
            user.name,
            user.image,
            user.role,
            user.online,
            user.created_at,
            user.updated_at,
            user.last_active,
            user.extra,
        ],
    )?;
    Ok(())
}

/// Make sure a referenced user has a row without overwriting a full one.
fn ensure_user(conn: &Connection, id: &str) -> Result<()> {
    conn.execute("INSERT OR IGNORE INTO users (id, extra) VALUES (?1, '{}')", [id])?;
    Ok(())
}

fn write_user_ref(conn: &Connection, id: &str, user: Option<&UserRow>) -> Result<()> {
    match user {
        Some(user) => upsert_user(conn, user),
        None => ensure_user(conn, id),
    }
}
