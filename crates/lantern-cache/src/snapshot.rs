use std::sync::Arc;

use anyhow::{Context, Result};
use lantern_store::kv::KeyValue;
use lantern_types::{ChannelState, ChatClient, ClientSnapshot, UserState};
use tracing::{debug, info, warn};

use crate::crop::crop_older_messages;

pub const CLIENT_SLOT: &str = "lantern.cache.client";
pub const CHANNELS_SLOT: &str = "lantern.cache.channels";
pub const SDK_VERSION_SLOT: &str = "lantern.cache.sdk_version";
pub const CLIENT_VERSION_SLOT: &str = "lantern.cache.client_version";

const SLOTS: [&str; 4] = [CLIENT_SLOT, CHANNELS_SLOT, SDK_VERSION_SLOT, CLIENT_VERSION_SLOT];

/// User and token the cached client was connected with.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedIdentity {
    pub user: UserState,
    pub token: String,
}

/// Outcome of a cold-start hydration.
#[derive(Debug, Clone, PartialEq)]
pub enum Hydration {
    /// Nothing was cached.
    Empty,
    /// The cache was written by another SDK or client version and has been
    /// purged. The client was left untouched.
    VersionMismatch {
        cached_sdk: Option<String>,
        cached_client: Option<String>,
    },
    /// Cached state was restored into the client.
    Restored {
        channels: usize,
        identity: Option<CachedIdentity>,
    },
}

/// Cached state that passed the version gate, already cropped.
struct Loaded {
    snapshot: ClientSnapshot,
    channels: Vec<ChannelState>,
}

impl Loaded {
    fn identity(&self) -> Option<CachedIdentity> {
        match (&self.snapshot.user, &self.snapshot.token) {
            (Some(user), Some(token)) => Some(CachedIdentity {
                user: user.clone(),
                token: token.clone(),
            }),
            _ => None,
        }
    }
}

enum Gate {
    Pass(Loaded),
    Stop(Hydration),
}

pub struct SnapshotCache {
    slots: Arc<dyn KeyValue>,
    sdk_version: String,
    client_version: String,
}

impl SnapshotCache {
    /// `sdk_version` and `client_version` are the versions of the running
    /// code. A snapshot written under any other pair is discarded.
    pub fn new(
        slots: Arc<dyn KeyValue>,
        sdk_version: impl Into<String>,
        client_version: impl Into<String>,
    ) -> Self {
        Self {
            slots,
            sdk_version: sdk_version.into(),
            client_version: client_version.into(),
        }
    }

    /// Write the client's current full state to the cache. Only reads from
    /// the client; the host decides when to call it.
    pub fn snapshot<C: ChatClient>(&self, client: &C) -> Result<()> {
        let snapshot = client.client_snapshot();
        let channels = client.channel_snapshots();

        let entries = vec![
            (CLIENT_SLOT.to_string(), serde_json::to_string(&snapshot)?),
            (CHANNELS_SLOT.to_string(), serde_json::to_string(&channels)?),
            (SDK_VERSION_SLOT.to_string(), self.sdk_version.clone()),
            (CLIENT_VERSION_SLOT.to_string(), self.client_version.clone()),
        ];
        self.slots
            .multi_set(&entries)
            .context("Failed to write snapshot cache")?;

        debug!("Snapshot cached with {} channels", channels.len());
        Ok(())
    }

    /// Restore cached state, reconnect the cached user, then reinitialize
    /// every cached channel. Connect and reinitialize failures propagate.
    pub async fn bootstrap<C: ChatClient>(&self, client: &C) -> Result<Hydration> {
        let loaded = match self.load()? {
            Gate::Pass(loaded) => loaded,
            Gate::Stop(outcome) => return Ok(outcome),
        };
        let identity = loaded.identity();
        let count = loaded.channels.len();

        client.restore_client(loaded.snapshot);
        if let Some(identity) = &identity {
            client
                .connect_user(&identity.user, &identity.token)
                .await
                .context("Failed to reconnect cached user")?;
        }
        for channel in loaded.channels {
            let cid = channel.cid.clone();
            client
                .reinitialize_channel(channel)
                .with_context(|| format!("Failed to reinitialize {cid}"))?;
        }

        info!("Restored {} channels from snapshot cache", count);
        Ok(Hydration::Restored {
            channels: count,
            identity,
        })
    }

    /// Same as [`bootstrap`](Self::bootstrap) without awaiting anything:
    /// state is restored and channels reinitialized, and the cached
    /// identity is handed back for the host to connect with.
    pub fn bootstrap_sync<C: ChatClient>(&self, client: &C) -> Result<Hydration> {
        let loaded = match self.load()? {
            Gate::Pass(loaded) => loaded,
            Gate::Stop(outcome) => return Ok(outcome),
        };
        let identity = loaded.identity();
        let count = loaded.channels.len();

        client.restore_client(loaded.snapshot);
        for channel in loaded.channels {
            let cid = channel.cid.clone();
            client
                .reinitialize_channel(channel)
                .with_context(|| format!("Failed to reinitialize {cid}"))?;
        }

        info!("Restored {} channels from snapshot cache", count);
        Ok(Hydration::Restored {
            channels: count,
            identity,
        })
    }

    /// Remove all four slots.
    pub fn purge(&self) -> Result<()> {
        let keys: Vec<String> = SLOTS.iter().map(|s| s.to_string()).collect();
        self.slots
            .multi_remove(&keys)
            .context("Failed to purge snapshot cache")?;
        Ok(())
    }

    /// [`purge`](Self::purge) on the blocking pool.
    pub async fn purge_async(&self) -> Result<()> {
        let slots = self.slots.clone();
        tokio::task::spawn_blocking(move || {
            let keys: Vec<String> = SLOTS.iter().map(|s| s.to_string()).collect();
            slots.multi_remove(&keys)
        })
        .await
        .context("Snapshot purge task failed")?
        .context("Failed to purge snapshot cache")?;
        Ok(())
    }

    fn load(&self) -> Result<Gate> {
        let keys: Vec<String> = SLOTS.iter().map(|s| s.to_string()).collect();
        let mut values = self
            .slots
            .multi_get(&keys)
            .context("Failed to read snapshot cache")?
            .into_iter();
        let mut next = || values.next().flatten();
        let (client, channels, sdk, client_version) = (next(), next(), next(), next());

        let (Some(client), Some(channels)) = (client, channels) else {
            debug!("No snapshot cached");
            return Ok(Gate::Stop(Hydration::Empty));
        };

        if sdk.as_deref() != Some(self.sdk_version.as_str())
            || client_version.as_deref() != Some(self.client_version.as_str())
        {
            info!(
                "Snapshot cache written by sdk {:?} / client {:?}, running {} / {}; purging",
                sdk, client_version, self.sdk_version, self.client_version
            );
            self.purge()?;
            return Ok(Gate::Stop(Hydration::VersionMismatch {
                cached_sdk: sdk,
                cached_client: client_version,
            }));
        }

        let parsed = serde_json::from_str::<ClientSnapshot>(&client).and_then(|snapshot| {
            Ok((snapshot, serde_json::from_str::<Vec<ChannelState>>(&channels)?))
        });
        let (snapshot, mut channels) = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Snapshot cache is corrupt, purging: {}", e);
                self.purge()?;
                return Ok(Gate::Stop(Hydration::Empty));
            }
        };

        crop_older_messages(&mut channels);
        Ok(Gate::Pass(Loaded { snapshot, channels }))
    }
}
