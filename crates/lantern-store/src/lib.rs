//! Local persistence for chat state.
//!
//! Two interchangeable backends implement [`LocalStore`]: the relational
//! [`structured::Database`] and the key/value [`flat::FlatStore`]. Callers
//! normally go through [`facade::LocalStorage`], which opens the configured
//! backend lazily and never lets a storage failure reach them.

pub mod config;
pub mod error;
pub mod facade;
pub mod flat;
pub mod kv;
pub mod logging;
pub mod mapper;
pub mod models;
pub mod structured;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use lantern_types::{
    ChannelQuery, ChannelState, MemberState, MessageState, ReactionState, ReadState,
};
use serde_json::{Map, Value};

use crate::config::{BackendKind, StorageConfig};
use crate::error::Result;
use crate::flat::FlatStore;
use crate::kv::SqliteKv;
use crate::structured::Database;

/// Storage capability shared by both backends. Calls are synchronous and may
/// block on I/O.
pub trait LocalStore: Send + Sync {
    /// Upsert `channels` and everything they embed, and record them under
    /// `query`. With `resync` the query's channel list is replaced; otherwise
    /// channels are appended, skipping cids already listed.
    fn store_channels(
        &self,
        query: &ChannelQuery,
        channels: &[ChannelState],
        resync: bool,
    ) -> Result<()>;

    fn update_channel_data(&self, cid: &str, data: &Map<String, Value>) -> Result<()>;

    /// Channels stored under `query`, in list order, `limit` starting at `offset`.
    fn query_channels(
        &self,
        query: &ChannelQuery,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ChannelState>>;

    fn insert_messages(&self, cid: &str, messages: &[MessageState]) -> Result<()>;

    /// Rewrite a cached message. Does nothing if the message is not cached.
    fn update_message(&self, message: &MessageState) -> Result<()>;

    fn add_reaction(&self, reaction: &ReactionState, own: bool) -> Result<()>;

    fn delete_reaction(&self, reaction: &ReactionState) -> Result<()>;

    fn add_member(&self, cid: &str, member: &MemberState) -> Result<()>;

    fn remove_member(&self, cid: &str, user_id: &str) -> Result<()>;

    /// Rewrite a cached member. Does nothing if the member is not cached.
    fn update_member(&self, cid: &str, member: &MemberState) -> Result<()>;

    fn update_read(&self, cid: &str, read: &ReadState) -> Result<()>;

    /// Up to `limit` messages of `cid` older than `before`, oldest first.
    fn query_messages(
        &self,
        cid: &str,
        limit: usize,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<MessageState>>;

    /// Drop every cached message of `cid` along with its reactions.
    fn truncate_channel(&self, cid: &str) -> Result<()>;

    /// Remove channels no query references, and whatever only they
    /// referenced. Returns the number of removed rows.
    fn sweep_orphans(&self) -> Result<usize>;

    fn delete_all(&self) -> Result<()>;
}

/// Open the backend described by `config`.
pub fn open_backend(config: &StorageConfig) -> Result<Arc<dyn LocalStore>> {
    let key = config.encryption_key.as_deref();
    let store: Arc<dyn LocalStore> = match (config.backend, config.path.as_deref()) {
        (BackendKind::Structured, Some(path)) => Arc::new(Database::open(path, key)?),
        (BackendKind::Structured, None) => Arc::new(Database::open_in_memory()?),
        (BackendKind::Flat, Some(path)) => {
            Arc::new(FlatStore::new(Arc::new(SqliteKv::open(path, key)?)))
        }
        (BackendKind::Flat, None) => {
            Arc::new(FlatStore::new(Arc::new(SqliteKv::open_in_memory()?)))
        }
    };
    Ok(store)
}
