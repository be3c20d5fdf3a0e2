use std::future::Future;

use crate::models::{ChannelConfig, ChannelState, ClientSnapshot, UserState};

/// The live chat client the storage layer hydrates and reads from.
///
/// The transport itself (websocket, REST) lives behind this trait. Storage
/// code only needs to read state out of it, push cached state back in and
/// ask it to (re)connect.
pub trait ChatClient: Send + Sync {
    /// Handle the UI layer works with after a channel is rehydrated.
    type Channel: Send;

    /// Make a channel type's features known to the client. Must happen
    /// before a channel of that type is built from cached state.
    fn register_channel_config(&self, config: &ChannelConfig);

    /// Build a channel handle from cached state without touching the
    /// network. The handle is marked as offline-sourced.
    fn offline_channel(&self, state: ChannelState) -> Self::Channel;

    /// Full client state for the snapshot cache.
    fn client_snapshot(&self) -> ClientSnapshot;

    /// Live state of every channel the client currently tracks.
    fn channel_snapshots(&self) -> Vec<ChannelState>;

    /// Replace the client's state with a cached snapshot.
    fn restore_client(&self, snapshot: ClientSnapshot);

    /// Reinitialize one channel's live state from cached state.
    fn reinitialize_channel(&self, state: ChannelState) -> anyhow::Result<()>;

    /// Connect as `user` using a previously issued token.
    fn connect_user(
        &self,
        user: &UserState,
        token: &str,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Reopen the transport for the already connected user.
    fn open_connection(&self) -> impl Future<Output = anyhow::Result<()>> + Send;
}
