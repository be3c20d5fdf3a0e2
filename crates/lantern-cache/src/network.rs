use std::sync::Mutex;

use anyhow::{Result, anyhow};
use lantern_types::ChatClient;
use tracing::info;

/// Reopens the transport when connectivity comes back.
///
/// Only an offline to online transition triggers a reconnect: repeated
/// "online" reports, or the very first report, do nothing.
#[derive(Default)]
pub struct NetworkReconciler {
    last: Mutex<Option<bool>>,
}

impl NetworkReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether a reconnect was attempted.
    pub async fn on_network_change<C: ChatClient>(&self, client: &C, online: bool) -> Result<bool> {
        let previous = {
            let mut last = self
                .last
                .lock()
                .map_err(|e| anyhow!("Network state lock poisoned: {}", e))?;
            last.replace(online)
        };

        if previous != Some(false) || !online {
            return Ok(false);
        }

        info!("Network is back, reopening connection");
        client.open_connection().await?;
        Ok(true)
    }
}
