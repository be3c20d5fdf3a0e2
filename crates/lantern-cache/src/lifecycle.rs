use anyhow::Result;
use lantern_types::ChatClient;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::snapshot::SnapshotCache;

/// Foreground state reported by the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppState {
    Active,
    Inactive,
    Background,
}

impl AppState {
    /// The app may be suspended or killed from this state without notice.
    pub fn is_leaving_foreground(self) -> bool {
        matches!(self, Self::Inactive | Self::Background)
    }
}

/// Writes a snapshot whenever the app leaves the foreground.
pub struct LifecycleTrigger;

impl LifecycleTrigger {
    /// Returns whether a snapshot was written.
    pub fn on_app_state<C: ChatClient>(
        cache: &SnapshotCache,
        client: &C,
        state: AppState,
    ) -> Result<bool> {
        if !state.is_leaving_foreground() {
            return Ok(false);
        }
        debug!("App state {:?}, caching snapshot", state);
        cache.snapshot(client)?;
        Ok(true)
    }
}
