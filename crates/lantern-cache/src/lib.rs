//! Whole-snapshot cache for fast cold start.
//!
//! Independent of the per-entity stores: the complete client state and
//! every channel's state are serialized into four key/value slots, gated by
//! the SDK and client versions that wrote them, and cropped before they are
//! handed back to the client.

pub mod crop;
pub mod lifecycle;
pub mod network;
pub mod snapshot;

pub use crop::{MAX_CHANNEL_MESSAGES, MAX_THREAD_REPLIES, crop_older_messages};
pub use lifecycle::{AppState, LifecycleTrigger};
pub use network::NetworkReconciler;
pub use snapshot::{CachedIdentity, Hydration, SnapshotCache};
