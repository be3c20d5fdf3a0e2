//! Key/value backend.
//!
//! Every entity is one JSON value under its own key and channels keep
//! ordered id lists pointing at them. The underlying [`KeyValue`] store has
//! no transactions, so every multi-key write runs in two phases: entity
//! records first, then the indices that reference them. A failure between
//! the phases leaves unreferenced records behind, never an index entry
//! without a record. Readers skip index entries whose record is missing.
//!
//! There is no serialization across keys: two concurrent writers touching
//! the same index can lose one another's update.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use lantern_types::{
    ChannelConfig, ChannelQuery, ChannelState, MemberState, MessageState, ReactionState, ReadState,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::LocalStore;
use crate::error::{MappingError, Result};
use crate::kv::KeyValue;
use crate::mapper::{
    NormalizedChannel, NormalizedConfig, NormalizedMessage, from_storable_channel,
    from_storable_config, from_storable_member, from_storable_message, from_storable_reads,
    message_user_ids, to_storable_channel, to_storable_member, to_storable_message,
    to_storable_reaction, to_storable_read, to_storable_user, user_map,
};
use crate::models::{
    ChannelConfigRow, ChannelRow, CommandRow, MemberRow, MessageRow, ReactionCountRow, ReactionRow,
    ReadRow, UserRow, reaction_count_key, reaction_key, to_millis,
};

fn channel_key(cid: &str) -> String {
    format!("channel:{cid}")
}

fn config_key(channel_type: &str) -> String {
    format!("config:{channel_type}")
}

fn channel_messages_key(cid: &str) -> String {
    format!("channel_messages:{cid}")
}

fn channel_members_key(cid: &str) -> String {
    format!("channel_members:{cid}")
}

fn channel_reads_key(cid: &str) -> String {
    format!("channel_reads:{cid}")
}

fn message_key(id: &str) -> String {
    format!("message:{id}")
}

fn member_record_key(cid: &str, user_id: &str) -> String {
    format!("member:{cid}:{user_id}")
}

fn read_record_key(cid: &str, user_id: &str) -> String {
    format!("read:{cid}:{user_id}")
}

fn user_key(id: &str) -> String {
    format!("user:{id}")
}

fn query_key(signature: &str) -> String {
    format!("query:{signature}")
}

/// A channel config and its commands, stored together.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConfigEntry {
    config: ChannelConfigRow,
    commands: Vec<CommandRow>,
}

/// A message with its reactions and counts, stored together.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MessageEntry {
    message: MessageRow,
    reactions: Vec<ReactionRow>,
    counts: Vec<ReactionCountRow>,
}

impl MessageEntry {
    fn from_normalized(normalized: &NormalizedMessage) -> Self {
        Self {
            message: normalized.message.clone(),
            reactions: normalized.reactions.clone(),
            counts: normalized.reaction_counts.clone(),
        }
    }
}

/// One entry of a channel's message index, kept sorted oldest first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
struct MessageRef {
    created_at: i64,
    id: String,
}

impl MessageRef {
    fn of(row: &MessageRow) -> Self {
        Self {
            created_at: row.created_at,
            id: row.id.clone(),
        }
    }
}

/// Writes collected for one phase.
#[derive(Default)]
struct Batch {
    entries: BTreeMap<String, String>,
}

impl Batch {
    fn put<T: Serialize>(&mut self, key: String, value: &T) -> Result<()> {
        self.entries.insert(key, serde_json::to_string(value)?);
        Ok(())
    }

    fn put_user(&mut self, user: &UserRow) -> Result<()> {
        self.put(user_key(&user.id), user)
    }

    fn commit(self, kv: &dyn KeyValue) -> Result<()> {
        if self.entries.is_empty() {
            return Ok(());
        }
        let entries: Vec<(String, String)> = self.entries.into_iter().collect();
        kv.multi_set(&entries)
    }
}

pub struct FlatStore {
    kv: Arc<dyn KeyValue>,
}

impl FlatStore {
    pub fn new(kv: Arc<dyn KeyValue>) -> Self {
        Self { kv }
    }

    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.kv.get(key)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Values for `keys` in order, with missing keys dropped.
    fn get_many<T: DeserializeOwned>(&self, keys: &[String]) -> Result<Vec<T>> {
        let mut found = Vec::with_capacity(keys.len());
        for (key, raw) in keys.iter().zip(self.kv.multi_get(keys)?) {
            match raw {
                Some(raw) => found.push(serde_json::from_str(&raw)?),
                None => debug!("Index points at missing record {}", key),
            }
        }
        Ok(found)
    }

    fn get_index<T: DeserializeOwned>(&self, key: &str) -> Result<Vec<T>> {
        Ok(self.get_json(key)?.unwrap_or_default())
    }

    fn load_users(&self, ids: impl IntoIterator<Item = String>) -> Result<crate::mapper::UserMap> {
        let keys: Vec<String> = ids
            .into_iter()
            .collect::<BTreeSet<_>>()
            .iter()
            .map(|id| user_key(id))
            .collect();
        let rows: Vec<UserRow> = self.get_many(&keys)?;
        Ok(user_map(&rows)?)
    }

    fn load_config(&self, channel_type: &str) -> Result<Option<ChannelConfig>> {
        let entry: Option<ConfigEntry> = self.get_json(&config_key(channel_type))?;
        Ok(entry.map(|e| from_storable_config(&e.config, &e.commands)))
    }

    fn load_messages(&self, ids: &[MessageRef]) -> Result<Vec<MessageState>> {
        let keys: Vec<String> = ids.iter().map(|r| message_key(&r.id)).collect();
        let entries: Vec<MessageEntry> = self.get_many(&keys)?;

        let mut user_ids = Vec::new();
        for entry in &entries {
            user_ids.extend(message_user_ids(&entry.message)?);
            user_ids.extend(entry.reactions.iter().map(|r| r.user_id.clone()));
        }
        let users = self.load_users(user_ids)?;

        entries
            .iter()
            .map(|entry| -> Result<MessageState> {
                let mut reactions = entry.reactions.clone();
                reactions.sort_by(|a, b| {
                    b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id))
                });
                Ok(from_storable_message(&entry.message, &users, &reactions, &entry.counts)?)
            })
            .collect()
    }

    fn load_channel(&self, cid: &str) -> Result<Option<ChannelState>> {
        let Some(channel) = self.get_json::<ChannelRow>(&channel_key(cid))? else {
            return Ok(None);
        };
        let config = self.load_config(&channel.channel_type)?;

        let member_ids: Vec<String> = self.get_index(&channel_members_key(cid))?;
        let member_keys: Vec<String> =
            member_ids.iter().map(|u| member_record_key(cid, u)).collect();
        let mut members: Vec<MemberRow> = self.get_many(&member_keys)?;
        members.sort_by(|a, b| (a.created_at, &a.user_id).cmp(&(b.created_at, &b.user_id)));

        let read_ids: Vec<String> = self.get_index(&channel_reads_key(cid))?;
        let read_keys: Vec<String> = read_ids.iter().map(|u| read_record_key(cid, u)).collect();
        let reads: Vec<ReadRow> = self.get_many(&read_keys)?;

        let message_refs: Vec<MessageRef> = self.get_index(&channel_messages_key(cid))?;
        let messages = self.load_messages(&message_refs)?;

        let users = self.load_users(
            members
                .iter()
                .map(|m| m.user_id.clone())
                .chain(reads.iter().map(|r| r.user_id.clone())),
        )?;
        let members = members.iter().map(|m| from_storable_member(m, &users)).collect();
        let read = from_storable_reads(&reads, &users);

        Ok(Some(from_storable_channel(&channel, config, members, messages, read)?))
    }

    /// Merge `added` into a channel's message index.
    fn merged_message_index(&self, cid: &str, added: &[MessageRef]) -> Result<Vec<MessageRef>> {
        let mut index: Vec<MessageRef> = self.get_index(&channel_messages_key(cid))?;
        let replaced: BTreeSet<&str> = added.iter().map(|r| r.id.as_str()).collect();
        index.retain(|r| !replaced.contains(r.id.as_str()));
        index.extend(added.iter().cloned());
        index.sort();
        Ok(index)
    }

    /// Append ids not yet present, keeping existing order.
    fn merged_id_index(
        &self,
        key: &str,
        added: impl IntoIterator<Item = String>,
    ) -> Result<Vec<String>> {
        let mut index: Vec<String> = self.get_index(key)?;
        for id in added {
            if !index.contains(&id) {
                index.push(id);
            }
        }
        Ok(index)
    }

    fn stage_message(records: &mut Batch, normalized: &NormalizedMessage) -> Result<()> {
        for user in &normalized.users {
            records.put_user(user)?;
        }
        records.put(message_key(&normalized.message.id), &MessageEntry::from_normalized(normalized))
    }

    fn stage_config(records: &mut Batch, config: &NormalizedConfig) -> Result<()> {
        let entry = ConfigEntry {
            config: config.config.clone(),
            commands: config.commands.clone(),
        };
        records.put(config_key(&config.config.channel_type), &entry)
    }

    fn stage_channel(records: &mut Batch, channel: &NormalizedChannel) -> Result<()> {
        for user in channel.all_users() {
            records.put_user(&user)?;
        }
        if let Some(config) = &channel.config {
            Self::stage_config(records, config)?;
        }
        let cid = &channel.channel.cid;
        records.put(channel_key(cid), &channel.channel)?;
        for member in &channel.members {
            records.put(member_record_key(cid, &member.user_id), member)?;
        }
        for read in &channel.reads {
            records.put(read_record_key(cid, &read.user_id), read)?;
        }
        for message in &channel.messages {
            records.put(message_key(&message.message.id), &MessageEntry::from_normalized(message))?;
        }
        Ok(())
    }

    /// Index updates for a set of messages, grouped by channel.
    fn stage_message_indices<'a>(
        &self,
        indices: &mut Batch,
        messages: impl IntoIterator<Item = &'a MessageRow>,
    ) -> Result<()> {
        let mut by_channel: BTreeMap<&str, Vec<MessageRef>> = BTreeMap::new();
        for row in messages {
            by_channel.entry(row.cid.as_str()).or_default().push(MessageRef::of(row));
        }
        for (cid, refs) in by_channel {
            let index = self.merged_message_index(cid, &refs)?;
            indices.put(channel_messages_key(cid), &index)?;
        }
        Ok(())
    }

    fn write_phases(&self, records: Batch, indices: Batch) -> Result<()> {
        records.commit(self.kv.as_ref())?;
        indices.commit(self.kv.as_ref())
    }

    fn update_entry<F>(&self, message_id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut MessageEntry) -> bool,
    {
        let key = message_key(message_id);
        let Some(mut entry) = self.get_json::<MessageEntry>(&key)? else {
            debug!("Message {} not cached, reaction change skipped", message_id);
            return Ok(());
        };
        if f(&mut entry) {
            self.kv.set(&key, &serde_json::to_string(&entry)?)?;
        }
        Ok(())
    }

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

        let mut records = Batch::default();
        for channel in &normalized {
            Self::stage_channel(&mut records, channel)?;
        }

        let mut indices = Batch::default();
        for channel in &normalized {
            let cid = &channel.channel.cid;
            let members = self.merged_id_index(
                &channel_members_key(cid),
                channel.members.iter().map(|m| m.user_id.clone()),
            )?;
            indices.put(channel_members_key(cid), &members)?;
            let reads = self.merged_id_index(
                &channel_reads_key(cid),
                channel.reads.iter().map(|r| r.user_id.clone()),
            )?;
            indices.put(channel_reads_key(cid), &reads)?;
        }
        self.stage_message_indices(
            &mut indices,
            normalized.iter().flat_map(|c| c.messages.iter().map(|m| &m.message)),
        )?;

        let cids = normalized.iter().map(|c| c.channel.cid.clone());
        let list = if resync {
            let mut list: Vec<String> = Vec::new();
            for cid in cids {
                if !list.contains(&cid) {
                    list.push(cid);
                }
            }
            list
        } else {
            self.merged_id_index(&query_key(&signature), cids)?
        };
        indices.put(query_key(&signature), &list)?;

        self.write_phases(records, indices)?;
        debug!(
            "Stored {} channels for query {} (resync={})",
            normalized.len(),
            signature,
            resync
        );
        Ok(())
    }

    pub fn update_channel_data(&self, cid: &str, data: &Map<String, Value>) -> Result<()> {
        let key = channel_key(cid);
        let Some(mut row) = self.get_json::<ChannelRow>(&key)? else {
            debug!("Channel {} not cached, data update skipped", cid);
            return Ok(());
        };
        row.data = serde_json::to_string(data)?;
        self.kv.set(&key, &serde_json::to_string(&row)?)
    }

    pub fn query_channels(
        &self,
        query: &ChannelQuery,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ChannelState>> {
        let signature = query.signature();
        let cids: Vec<String> = self.get_index(&query_key(&signature))?;

        let mut channels = Vec::new();
        for cid in cids.iter().skip(offset).take(limit) {
            match self.load_channel(cid)? {
                Some(channel) => channels.push(channel),
                None => debug!("Query {} lists {} but it is not cached", signature, cid),
            }
        }
        Ok(channels)
    }

    pub fn insert_messages(&self, cid: &str, messages: &[MessageState]) -> Result<()> {
        let normalized = messages
            .iter()
            .map(|m| to_storable_message(m, cid))
            .collect::<std::result::Result<Vec<_>, MappingError>>()?;

        let mut records = Batch::default();
        for message in &normalized {
            Self::stage_message(&mut records, message)?;
        }
        let mut indices = Batch::default();
        self.stage_message_indices(&mut indices, normalized.iter().map(|m| &m.message))?;

        self.write_phases(records, indices)
    }

    pub fn update_message(&self, message: &MessageState) -> Result<()> {
        let Some(existing) = self.get_json::<MessageEntry>(&message_key(&message.id))? else {
            debug!("Message {} not cached, update skipped", message.id);
            return Ok(());
        };
        let normalized = to_storable_message(message, &existing.message.cid)?;

        let mut records = Batch::default();
        Self::stage_message(&mut records, &normalized)?;
        let mut indices = Batch::default();
        self.stage_message_indices(&mut indices, [&normalized.message])?;

        self.write_phases(records, indices)
    }

    /// Record a reaction. The count is bumped only when the reaction is new.
    pub fn add_reaction(&self, reaction: &ReactionState, own: bool) -> Result<()> {
        let row = to_storable_reaction(&reaction.message_id, reaction, own)?;
        if let Some(user) = &reaction.user {
            let user = to_storable_user(user)?;
            self.kv.set(&user_key(&user.id), &serde_json::to_string(&user)?)?;
        }

        self.update_entry(&reaction.message_id, |entry| {
            if entry.reactions.iter().any(|r| r.id == row.id) {
                return false;
            }
            let count_id = reaction_count_key(&row.message_id, &row.kind);
            match entry.counts.iter_mut().find(|c| c.id == count_id) {
                Some(count) => count.count += 1,
                None => entry.counts.push(ReactionCountRow {
                    id: count_id,
                    message_id: row.message_id.clone(),
                    kind: row.kind.clone(),
                    count: 1,
                }),
            }
            entry.reactions.push(row);
            true
        })
    }

    /// Remove a reaction. The count drops only when a reaction was removed,
    /// and never below zero.
    pub fn delete_reaction(&self, reaction: &ReactionState) -> Result<()> {
        let user_id = reaction.author_id().ok_or(MappingError::MissingField {
            entity: "reaction",
            field: "user_id",
        })?;
        let id = reaction_key(&reaction.message_id, user_id, &reaction.kind);
        let count_id = reaction_count_key(&reaction.message_id, &reaction.kind);

        self.update_entry(&reaction.message_id, |entry| {
            let before = entry.reactions.len();
            entry.reactions.retain(|r| r.id != id);
            if entry.reactions.len() == before {
                return false;
            }
            if let Some(count) = entry.counts.iter_mut().find(|c| c.id == count_id) {
                count.count = (count.count - 1).max(0);
            }
            true
        })
    }

    pub fn add_member(&self, cid: &str, member: &MemberState) -> Result<()> {
        let (row, user) = to_storable_member(cid, member)?;

        let mut records = Batch::default();
        if let Some(user) = &user {
            records.put_user(user)?;
        }
        records.put(member_record_key(cid, &row.user_id), &row)?;

        let mut indices = Batch::default();
        let index = self.merged_id_index(&channel_members_key(cid), [row.user_id.clone()])?;
        indices.put(channel_members_key(cid), &index)?;

        self.write_phases(records, indices)
    }

    /// The index entry goes first so no reader sees an id without a record.
    pub fn remove_member(&self, cid: &str, user_id: &str) -> Result<()> {
        let key = channel_members_key(cid);
        let mut index: Vec<String> = self.get_index(&key)?;
        index.retain(|id| id != user_id);
        self.kv.set(&key, &serde_json::to_string(&index)?)?;
        self.kv.remove(&member_record_key(cid, user_id))
    }

    pub fn update_member(&self, cid: &str, member: &MemberState) -> Result<()> {
        let (row, user) = to_storable_member(cid, member)?;
        let key = member_record_key(cid, &row.user_id);
        if self.kv.get(&key)?.is_none() {
            debug!("Member {} not cached, update skipped", row.id);
            return Ok(());
        }

        let mut records = Batch::default();
        if let Some(user) = &user {
            records.put_user(user)?;
        }
        records.put(key, &row)?;
        records.commit(self.kv.as_ref())
    }

    pub fn update_read(&self, cid: &str, read: &ReadState) -> Result<()> {
        let (row, user) = to_storable_read(cid, read)?;

        let mut records = Batch::default();
        records.put_user(&user)?;
        records.put(read_record_key(cid, &row.user_id), &row)?;

        let mut indices = Batch::default();
        let index = self.merged_id_index(&channel_reads_key(cid), [row.user_id.clone()])?;
        indices.put(channel_reads_key(cid), &index)?;

        self.write_phases(records, indices)
    }

    pub fn query_messages(
        &self,
        cid: &str,
        limit: usize,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<MessageState>> {
        let before = before.map(to_millis);
        let index: Vec<MessageRef> = self.get_index(&channel_messages_key(cid))?;
        let older: Vec<MessageRef> = index
            .into_iter()
            .filter(|r| before.is_none_or(|b| r.created_at < b))
            .collect();
        let start = older.len().saturating_sub(limit);
        self.load_messages(&older[start..])
    }

    /// Index first, then the records it pointed at.
    pub fn truncate_channel(&self, cid: &str) -> Result<()> {
        let key = channel_messages_key(cid);
        let index: Vec<MessageRef> = self.get_index(&key)?;
        self.kv.remove(&key)?;
        let records: Vec<String> = index.iter().map(|r| message_key(&r.id)).collect();
        self.kv.multi_remove(&records)?;
        debug!("Truncated {} messages from {}", records.len(), cid);
        Ok(())
    }

    /// Not supported: the flat layout keeps no reverse index to find
    /// unreferenced records with.
    pub fn sweep_orphans(&self) -> Result<usize> {
        debug!("Orphan sweep is not supported by the flat store");
        Ok(0)
    }

    pub fn delete_all(&self) -> Result<()> {
        self.kv.clear()
    }
}

impl LocalStore for FlatStore {
    fn store_channels(
        &self,
        query: &ChannelQuery,
        channels: &[ChannelState],
        resync: bool,
    ) -> Result<()> {
        FlatStore::store_channels(self, query, channels, resync)
    }

    fn update_channel_data(&self, cid: &str, data: &Map<String, Value>) -> Result<()> {
        FlatStore::update_channel_data(self, cid, data)
    }

    fn query_channels(
        &self,
        query: &ChannelQuery,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ChannelState>> {
        FlatStore::query_channels(self, query, offset, limit)
    }

    fn insert_messages(&self, cid: &str, messages: &[MessageState]) -> Result<()> {
        FlatStore::insert_messages(self, cid, messages)
    }

    fn update_message(&self, message: &MessageState) -> Result<()> {
        FlatStore::update_message(self, message)
    }

    fn add_reaction(&self, reaction: &ReactionState, own: bool) -> Result<()> {
        FlatStore::add_reaction(self, reaction, own)
    }

    fn delete_reaction(&self, reaction: &ReactionState) -> Result<()> {
        FlatStore::delete_reaction(self, reaction)
    }

    fn add_member(&self, cid: &str, member: &MemberState) -> Result<()> {
        FlatStore::add_member(self, cid, member)
    }

    fn remove_member(&self, cid: &str, user_id: &str) -> Result<()> {
        FlatStore::remove_member(self, cid, user_id)
    }

    fn update_member(&self, cid: &str, member: &MemberState) -> Result<()> {
        FlatStore::update_member(self, cid, member)
    }

    fn update_read(&self, cid: &str, read: &ReadState) -> Result<()> {
        FlatStore::update_read(self, cid, read)
    }

    fn query_messages(
        &self,
        cid: &str,
        limit: usize,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<MessageState>> {
        FlatStore::query_messages(self, cid, limit, before)
    }

    fn truncate_channel(&self, cid: &str) -> Result<()> {
        FlatStore::truncate_channel(self, cid)
    }

    fn sweep_orphans(&self) -> Result<usize> {
        FlatStore::sweep_orphans(self)
    }

    fn delete_all(&self) -> Result<()> {
        FlatStore::delete_all(self)
    }
}
