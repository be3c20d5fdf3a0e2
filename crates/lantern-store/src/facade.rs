//! Async front door to the local store.
//!
//! The configured backend is opened on first use and shared afterwards.
//! Every call runs on the blocking pool and is contained: a failure anywhere
//! (opening, mapping, SQL, task join) is reported to the [`StorageLogger`]
//! and the call resolves with an empty default. The local cache is an
//! optimisation, so nothing here may fail the caller.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use lantern_types::{
    ChannelQuery, ChannelState, ChatClient, MemberState, MessageState, ReactionState, ReadState,
};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::StorageConfig;
use crate::error::{Result, StoreError};
use crate::logging::{StorageLog, StorageLogger, TracingLogger};
use crate::{LocalStore, open_backend};

const SCOPE: &str = "local_storage";

type Opener = Arc<dyn Fn() -> Result<Arc<dyn LocalStore>> + Send + Sync>;

pub struct LocalStorage {
    opener: Opener,
    handle: Mutex<Option<Arc<dyn LocalStore>>>,
    logger: Arc<dyn StorageLogger>,
}

impl LocalStorage {
    /// Storage that opens the backend described by `config` on first use.
    pub fn new(config: StorageConfig) -> Self {
        Self::with_opener(Arc::new(move || open_backend(&config)))
    }

    /// Storage over an already opened backend. `close` releases the handle
    /// and the next call picks the same backend up again.
    pub fn with_store(store: Arc<dyn LocalStore>) -> Self {
        Self::with_opener(Arc::new(move || -> Result<Arc<dyn LocalStore>> { Ok(store.clone()) }))
    }

    fn with_opener(opener: Opener) -> Self {
        Self {
            opener,
            handle: Mutex::new(None),
            logger: Arc::new(TracingLogger),
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn StorageLogger>) -> Self {
        self.logger = logger;
        self
    }

    async fn store(&self) -> Result<Arc<dyn LocalStore>> {
        let mut handle = self.handle.lock().await;
        if let Some(store) = handle.as_ref() {
            return Ok(store.clone());
        }

        let opener = self.opener.clone();
        let store = tokio::task::spawn_blocking(move || opener())
            .await
            .map_err(|e| StoreError::Task(e.to_string()))??;
        debug!("Local storage handle opened");
        *handle = Some(store.clone());
        Ok(store)
    }

    async fn try_run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn LocalStore) -> Result<T> + Send + 'static,
    {
        let store = self.store().await?;
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }

    /// Run `f` against the backend, containing any failure.
    async fn run<T, F>(&self, operation: &'static str, f: F) -> T
    where
        T: Default + Send + 'static,
        F: FnOnce(&dyn LocalStore) -> Result<T> + Send + 'static,
    {
        match self.try_run(f).await {
            Ok(value) => value,
            Err(e) => {
                self.logger.log(StorageLog {
                    scope: SCOPE,
                    operation,
                    error: e.to_string(),
                });
                T::default()
            }
        }
    }

    // -- Channels --

    pub async fn store_channels(
        &self,
        query: &ChannelQuery,
        channels: &[ChannelState],
        resync: bool,
    ) {
        let query = query.clone();
        let channels = channels.to_vec();
        self.run("store_channels", move |store| {
            store.store_channels(&query, &channels, resync)
        })
        .await
    }

    pub async fn update_channel_data(&self, cid: &str, data: &Map<String, Value>) {
        let cid = cid.to_string();
        let data = data.clone();
        self.run("update_channel_data", move |store| store.update_channel_data(&cid, &data))
            .await
    }

    /// Cached channel states for one page of `query`.
    pub async fn query_channel_states(
        &self,
        query: &ChannelQuery,
        offset: usize,
        limit: usize,
    ) -> Vec<ChannelState> {
        let query = query.clone();
        self.run("query_channels", move |store| store.query_channels(&query, offset, limit))
            .await
    }

    /// Rehydrate one page of `query` into offline channel handles. Each
    /// channel's config is registered with the client before its handle is
    /// built.
    pub async fn query_channels<C: ChatClient>(
        &self,
        client: &C,
        query: &ChannelQuery,
        offset: usize,
        limit: usize,
    ) -> Vec<C::Channel> {
        self.query_channel_states(query, offset, limit)
            .await
            .into_iter()
            .map(|state| {
                if let Some(config) = &state.config {
                    client.register_channel_config(config);
                }
                client.offline_channel(state)
            })
            .collect()
    }

    // -- Messages --

    pub async fn insert_message(&self, cid: &str, message: &MessageState) {
        self.insert_messages(cid, std::slice::from_ref(message)).await
    }

    pub async fn insert_messages(&self, cid: &str, messages: &[MessageState]) {
        let cid = cid.to_string();
        let messages = messages.to_vec();
        self.run("insert_messages", move |store| store.insert_messages(&cid, &messages))
            .await
    }

    pub async fn update_message(&self, message: &MessageState) {
        let message = message.clone();
        self.run("update_message", move |store| store.update_message(&message))
            .await
    }

    pub async fn query_messages(
        &self,
        cid: &str,
        limit: usize,
        before: Option<DateTime<Utc>>,
    ) -> Vec<MessageState> {
        let cid = cid.to_string();
        self.run("query_messages", move |store| store.query_messages(&cid, limit, before))
            .await
    }

    pub async fn truncate_channel(&self, cid: &str) {
        let cid = cid.to_string();
        self.run("truncate_channel", move |store| store.truncate_channel(&cid))
            .await
    }

    // -- Reactions --

    pub async fn add_reaction(&self, reaction: &ReactionState, own: bool) {
        let reaction = reaction.clone();
        self.run("add_reaction", move |store| store.add_reaction(&reaction, own))
            .await
    }

    pub async fn delete_reaction(&self, reaction: &ReactionState) {
        let reaction = reaction.clone();
        self.run("delete_reaction", move |store| store.delete_reaction(&reaction))
            .await
    }

    // -- Members and reads --

    pub async fn add_member(&self, cid: &str, member: &MemberState) {
        let cid = cid.to_string();
        let member = member.clone();
        self.run("add_member", move |store| store.add_member(&cid, &member))
            .await
    }

    pub async fn remove_member(&self, cid: &str, user_id: &str) {
        let cid = cid.to_string();
        let user_id = user_id.to_string();
        self.run("remove_member", move |store| store.remove_member(&cid, &user_id))
            .await
    }

    pub async fn update_member(&self, cid: &str, member: &MemberState) {
        let cid = cid.to_string();
        let member = member.clone();
        self.run("update_member", move |store| store.update_member(&cid, &member))
            .await
    }

    pub async fn update_read(&self, cid: &str, read: &ReadState) {
        let cid = cid.to_string();
        let read = read.clone();
        self.run("update_read", move |store| store.update_read(&cid, &read))
            .await
    }

    // -- Maintenance --

    pub async fn sweep_orphans(&self) -> usize {
        self.run("sweep_orphans", |store| store.sweep_orphans()).await
    }

    pub async fn delete_all(&self) {
        self.run("delete_all", |store| store.delete_all()).await
    }

    /// Release the backend handle. The next call opens it again.
    pub async fn close(&self) {
        if self.handle.lock().await.take().is_some() {
            debug!("Local storage handle closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;
    use chrono::TimeZone;
    use lantern_types::{ChannelConfig, ClientSnapshot, UserState};
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingLogger {
        entries: StdMutex<Vec<StorageLog>>,
    }

    impl StorageLogger for RecordingLogger {
        fn log(&self, entry: StorageLog) {
            self.entries.lock().unwrap().push(entry);
        }
    }

    struct BrokenStore;

    fn broken<T>() -> Result<T> {
        Err(StoreError::LockPoisoned("backend unavailable".into()))
    }

    impl LocalStore for BrokenStore {
        fn store_channels(&self, _: &ChannelQuery, _: &[ChannelState], _: bool) -> Result<()> {
            broken()
        }
        fn update_channel_data(&self, _: &str, _: &Map<String, Value>) -> Result<()> {
            broken()
        }
        fn query_channels(
            &self,
            _: &ChannelQuery,
            _: usize,
            _: usize,
        ) -> Result<Vec<ChannelState>> {
            broken()
        }
        fn insert_messages(&self, _: &str, _: &[MessageState]) -> Result<()> {
            broken()
        }
        fn update_message(&self, _: &MessageState) -> Result<()> {
            broken()
        }
        fn add_reaction(&self, _: &ReactionState, _: bool) -> Result<()> {
            broken()
        }
        fn delete_reaction(&self, _: &ReactionState) -> Result<()> {
            broken()
        }
        fn add_member(&self, _: &str, _: &MemberState) -> Result<()> {
            broken()
        }
        fn remove_member(&self, _: &str, _: &str) -> Result<()> {
            broken()
        }
        fn update_member(&self, _: &str, _: &MemberState) -> Result<()> {
            broken()
        }
        fn update_read(&self, _: &str, _: &ReadState) -> Result<()> {
            broken()
        }
        fn query_messages(
            &self,
            _: &str,
            _: usize,
            _: Option<DateTime<Utc>>,
        ) -> Result<Vec<MessageState>> {
            broken()
        }
        fn truncate_channel(&self, _: &str) -> Result<()> {
            broken()
        }
        fn sweep_orphans(&self) -> Result<usize> {
            broken()
        }
        fn delete_all(&self) -> Result<()> {
            broken()
        }
    }

    /// Records what the facade hands it; channel handles are just cids.
    #[derive(Default)]
    struct FakeClient {
        configs: StdMutex<Vec<String>>,
    }

    impl ChatClient for FakeClient {
        type Channel = String;

        fn register_channel_config(&self, config: &ChannelConfig) {
            self.configs.lock().unwrap().push(config.name.clone());
        }
        fn offline_channel(&self, state: ChannelState) -> String {
            state.cid
        }
        fn client_snapshot(&self) -> ClientSnapshot {
            ClientSnapshot::default()
        }
        fn channel_snapshots(&self) -> Vec<ChannelState> {
            Vec::new()
        }
        fn restore_client(&self, _snapshot: ClientSnapshot) {}
        fn reinitialize_channel(&self, _state: ChannelState) -> anyhow::Result<()> {
            Ok(())
        }
        async fn connect_user(&self, _user: &UserState, _token: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn open_connection(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn query() -> ChannelQuery {
        ChannelQuery::new(json!({"type": "messaging"}), json!([]))
    }

    fn channel(id: &str) -> ChannelState {
        let mut channel = ChannelState::new("messaging", id);
        let config = json!({"name": "messaging", "reactions": true});
        channel.config = Some(serde_json::from_value(config).unwrap());
        channel.messages = vec![MessageState::new(
            format!("{id}-1"),
            "hello",
            Utc.timestamp_millis_opt(1_000).unwrap(),
        )];
        channel
    }

    #[tokio::test]
    async fn failures_resolve_with_defaults_and_are_logged() {
        let logger = Arc::new(RecordingLogger::default());
        let storage = LocalStorage::with_store(Arc::new(BrokenStore)).with_logger(logger.clone());

        storage.store_channels(&query(), &[channel("a")], false).await;
        assert!(storage.query_channel_states(&query(), 0, 10).await.is_empty());
        assert!(storage.query_messages("messaging:a", 10, None).await.is_empty());
        assert_eq!(storage.sweep_orphans().await, 0);
        storage.remove_member("messaging:a", "bob").await;

        let entries = logger.entries.lock().unwrap();
        let operations: Vec<&str> = entries.iter().map(|e| e.operation).collect();
        assert_eq!(
            operations,
            vec![
                "store_channels",
                "query_channels",
                "query_messages",
                "sweep_orphans",
                "remove_member",
            ]
        );
        assert!(entries.iter().all(|e| e.scope == "local_storage"));
        assert!(entries[0].error.contains("backend unavailable"));
    }

    #[tokio::test]
    async fn open_failure_is_contained() {
        let logger = Arc::new(RecordingLogger::default());
        let opener: Opener = Arc::new(|| -> Result<Arc<dyn LocalStore>> {
            Err(StoreError::Task("no disk".into()))
        });
        let storage = LocalStorage::with_opener(opener).with_logger(logger.clone());

        storage.delete_all().await;
        let entries = logger.entries.lock().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].operation, "delete_all");
    }

    #[tokio::test]
    async fn handle_is_opened_once_and_reopened_after_close() {
        let opened = Arc::new(AtomicUsize::new(0));
        let counter = opened.clone();
        let storage = LocalStorage::with_opener(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            open_backend(&StorageConfig::in_memory(BackendKind::Structured))
        }));

        storage.store_channels(&query(), &[channel("a")], true).await;
        assert_eq!(storage.query_channel_states(&query(), 0, 10).await.len(), 1);
        assert_eq!(opened.load(Ordering::SeqCst), 1);

        // A fresh in-memory database comes back empty.
        storage.close().await;
        assert!(storage.query_channel_states(&query(), 0, 10).await.is_empty());
        assert_eq!(opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn query_channels_registers_configs_before_building_handles() {
        let storage = LocalStorage::new(StorageConfig::in_memory(BackendKind::Flat));
        storage.store_channels(&query(), &[channel("a"), channel("b")], true).await;

        let client = FakeClient::default();
        let handles = storage.query_channels(&client, &query(), 0, 10).await;
        assert_eq!(handles, vec!["messaging:a", "messaging:b"]);
        assert_eq!(*client.configs.lock().unwrap(), vec!["messaging", "messaging"]);
    }
}
