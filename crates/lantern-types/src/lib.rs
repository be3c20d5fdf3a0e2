//! Shared chat state types for the Lantern offline storage layer.
//!
//! `models` mirrors the nested state the live client holds, `query` keys
//! channel lists, and `client` is the seam to the transport client.

pub mod client;
pub mod models;
pub mod query;

pub use client::ChatClient;
pub use models::{
    ChannelConfig, ChannelState, ClientSnapshot, Command, MemberState, MessageState, ReactionState,
    ReadState, UserState,
};
pub use query::ChannelQuery;
