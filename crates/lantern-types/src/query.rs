use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A channel list request: filter and sort exactly as sent to the server.
///
/// The storage layer never evaluates the filter. It only uses the
/// canonical serialization as a key for the page of channel ids the server
/// returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelQuery {
    #[serde(default)]
    pub filters: Value,
    #[serde(default)]
    pub sort: Value,
}

impl ChannelQuery {
    pub fn new(filters: Value, sort: Value) -> Self {
        Self { filters, sort }
    }

    /// Canonical signature of this query. Object keys serialize in sorted
    /// order, so two queries with the same content share a signature.
    pub fn signature(&self) -> String {
        serde_json::json!({ "filters": self.filters, "sort": self.sort }).to_string()
    }
}
