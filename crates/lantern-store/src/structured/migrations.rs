use rusqlite::Connection;
use tracing::info;

use crate::error::Result;

pub const SCHEMA_VERSION: i64 = 2;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |r| r.get(0),
    )?;

    if version < 1 {
        info!("Local store: running migration v1 (initial schema)");
        conn.execute_batch(
            "
            CREATE TABLE users (
                id          TEXT PRIMARY KEY,
                name        TEXT,
                image       TEXT,
                role        TEXT,
                online      INTEGER NOT NULL DEFAULT 0,
                created_at  INTEGER,
                updated_at  INTEGER,
                last_active INTEGER,
                extra       TEXT NOT NULL DEFAULT '{}'
            );

            CREATE TABLE channel_configs (
                channel_type        TEXT PRIMARY KEY,
                typing_events       INTEGER NOT NULL DEFAULT 0,
                read_events         INTEGER NOT NULL DEFAULT 0,
                connect_events      INTEGER NOT NULL DEFAULT 0,
                reactions           INTEGER NOT NULL DEFAULT 0,
                replies             INTEGER NOT NULL DEFAULT 0,
                search              INTEGER NOT NULL DEFAULT 0,
                mutes               INTEGER NOT NULL DEFAULT 0,
                uploads             INTEGER NOT NULL DEFAULT 0,
                url_enrichment      INTEGER NOT NULL DEFAULT 0,
                max_message_length  INTEGER NOT NULL DEFAULT 0,
                automod             TEXT NOT NULL DEFAULT '',
                created_at          INTEGER,
                updated_at          INTEGER
            );

            CREATE TABLE commands (
                id            TEXT PRIMARY KEY,
                channel_type  TEXT NOT NULL REFERENCES channel_configs(channel_type) ON DELETE CASCADE,
                name          TEXT NOT NULL,
                description   TEXT NOT NULL DEFAULT '',
                args          TEXT NOT NULL DEFAULT '',
                set_tag       TEXT NOT NULL DEFAULT '',
                position      INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE channels (
                cid           TEXT PRIMARY KEY,
                id            TEXT NOT NULL,
                channel_type  TEXT NOT NULL,
                data          TEXT NOT NULL DEFAULT '{}',
                initialized   INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE members (
                id                  TEXT PRIMARY KEY,
                cid                 TEXT NOT NULL REFERENCES channels(cid) ON DELETE CASCADE,
                user_id             TEXT NOT NULL REFERENCES users(id),
                role                TEXT,
                invited             INTEGER NOT NULL DEFAULT 0,
                invite_accepted_at  INTEGER,
                invite_rejected_at  INTEGER,
                is_moderator        INTEGER NOT NULL DEFAULT 0,
                created_at          INTEGER,
                updated_at          INTEGER
            );

            CREATE INDEX idx_members_channel ON members(cid);

            CREATE TABLE messages (
                id                  TEXT PRIMARY KEY,
                cid                 TEXT NOT NULL REFERENCES channels(cid) ON DELETE CASCADE,
                user_id             TEXT REFERENCES users(id),
                text                TEXT NOT NULL DEFAULT '',
                kind                TEXT NOT NULL DEFAULT 'regular',
                attachments         TEXT NOT NULL DEFAULT '[]',
                mentioned_user_ids  TEXT NOT NULL DEFAULT '[]',
                parent_id           TEXT,
                reply_count         INTEGER NOT NULL DEFAULT 0,
                pinned              INTEGER NOT NULL DEFAULT 0,
                created_at          INTEGER NOT NULL,
                updated_at          INTEGER,
                deleted_at          INTEGER
            );

            CREATE INDEX idx_messages_channel ON messages(cid, created_at);
            CREATE INDEX idx_messages_parent ON messages(parent_id);

            CREATE TABLE reactions (
                id          TEXT PRIMARY KEY,
                message_id  TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                user_id     TEXT NOT NULL REFERENCES users(id),
                kind        TEXT NOT NULL,
                score       INTEGER NOT NULL DEFAULT 1,
                own         INTEGER NOT NULL DEFAULT 0,
                created_at  INTEGER,
                updated_at  INTEGER
            );

            CREATE INDEX idx_reactions_message ON reactions(message_id);

            CREATE TABLE reaction_counts (
                id          TEXT PRIMARY KEY,
                message_id  TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                kind        TEXT NOT NULL,
                count       INTEGER NOT NULL DEFAULT 0 CHECK (count >= 0)
            );

            CREATE INDEX idx_reaction_counts_message ON reaction_counts(message_id);

            CREATE TABLE reads (
                id               TEXT PRIMARY KEY,
                cid              TEXT NOT NULL REFERENCES channels(cid) ON DELETE CASCADE,
                user_id          TEXT NOT NULL REFERENCES users(id),
                last_read        INTEGER NOT NULL,
                unread_messages  INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX idx_reads_channel ON reads(cid);

            CREATE TABLE queries (
                signature   TEXT PRIMARY KEY,
                updated_at  INTEGER NOT NULL
            );

            CREATE TABLE query_channels (
                signature  TEXT NOT NULL REFERENCES queries(signature) ON DELETE CASCADE,
                cid        TEXT NOT NULL,
                position   INTEGER NOT NULL,
                PRIMARY KEY (signature, cid)
            );

            CREATE INDEX idx_query_channels_position ON query_channels(signature, position);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    if version < 2 {
        info!("Local store: running migration v2 (replies shown in channel)");
        conn.execute_batch(
            "
            ALTER TABLE messages ADD COLUMN show_in_channel INTEGER NOT NULL DEFAULT 0;

            INSERT INTO schema_version (version) VALUES (2);
            ",
        )?;
    }

    info!("Local store migrations complete (schema v{})", SCHEMA_VERSION);
    Ok(())
}
