//! Relational backend: one SQLite database with a table per record kind and
//! key references between them.
//!
//! Every public write runs inside a single transaction, so a channel sync or
//! a reaction change is applied fully or not at all. There is no atomicity
//! across calls.

pub mod migrations;
mod hydrate;
mod queries;

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use lantern_types::{
    ChannelQuery, ChannelState, MemberState, MessageState, ReactionState, ReadState,
};
use rusqlite::{Connection, Transaction};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::info;

use crate::LocalStore;
use crate::error::{Result, StoreError};

pub struct Database {
    conn: Mutex<Connection>,
}

/// Row counts per table, for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub channels: i64,
    pub messages: i64,
    pub members: i64,
    pub users: i64,
    pub reactions: i64,
    pub reads: i64,
    pub queries: i64,
}

impl Database {
    /// Open (or create) the store at `path`. `encryption_key` is applied
    /// with `PRAGMA key`, which SQLCipher builds honour and plain SQLite
    /// ignores.
    pub fn open(path: &Path, encryption_key: Option<&str>) -> Result<Self> {
        let conn = Connection::open(path)?;
        if let Some(key) = encryption_key.filter(|k| !k.is_empty()) {
            conn.pragma_update(None, "key", key)?;
        }

        // WAL mode for concurrent reads
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn, &path.display().to_string())
    }

    /// In-memory store, used by tests and when no path is configured.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, ":memory:")
    }

    fn init(conn: Connection, location: &str) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run(&conn)?;

        info!("Local store opened at {}", location);
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))?;
        f(&conn)
    }

    /// Run `f` inside one transaction. Nothing is committed if `f` fails.
    pub fn with_tx<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))?;
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        self.with_conn(|conn| {
            let count = |table: &str| -> Result<i64> {
                Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))?)
            };
            Ok(StoreStats {
                channels: count("channels")?,
                messages: count("messages")?,
                members: count("members")?,
                users: count("users")?,
                reactions: count("reactions")?,
                reads: count("reads")?,
                queries: count("queries")?,
            })
        })
    }
}

impl LocalStore for Database {
    fn store_channels(
        &self,
        query: &ChannelQuery,
        channels: &[ChannelState],
        resync: bool,
    ) -> Result<()> {
        Database::store_channels(self, query, channels, resync)
    }

    fn update_channel_data(&self, cid: &str, data: &Map<String, Value>) -> Result<()> {
        Database::update_channel_data(self, cid, data)
    }

    fn query_channels(
        &self,
        query: &ChannelQuery,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ChannelState>> {
        Database::query_channels(self, query, offset, limit)
    }

    fn insert_messages(&self, cid: &str, messages: &[MessageState]) -> Result<()> {
        Database::insert_messages(self, cid, messages)
    }

    fn update_message(&self, message: &MessageState) -> Result<()> {
        Database::update_message(self, message)
    }

    fn add_reaction(&self, reaction: &ReactionState, own: bool) -> Result<()> {
        Database::add_reaction(self, reaction, own)
    }

    fn delete_reaction(&self, reaction: &ReactionState) -> Result<()> {
        Database::delete_reaction(self, reaction)
    }

    fn add_member(&self, cid: &str, member: &MemberState) -> Result<()> {
        Database::add_member(self, cid, member)
    }

    fn remove_member(&self, cid: &str, user_id: &str) -> Result<()> {
        Database::remove_member(self, cid, user_id)
    }

    fn update_member(&self, cid: &str, member: &MemberState) -> Result<()> {
        Database::update_member(self, cid, member)
    }

    fn update_read(&self, cid: &str, read: &ReadState) -> Result<()> {
        Database::update_read(self, cid, read)
    }

    fn query_messages(
        &self,
        cid: &str,
        limit: usize,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<MessageState>> {
        Database::query_messages(self, cid, limit, before)
    }

    fn truncate_channel(&self, cid: &str) -> Result<()> {
        Database::truncate_channel(self, cid)
    }

    fn sweep_orphans(&self) -> Result<usize> {
        Database::sweep_orphans(self)
    }

    fn delete_all(&self) -> Result<()> {
        Database::delete_all(self)
    }
}
