use std::collections::{BTreeSet, HashMap};

use lantern_types::{ChannelState, MessageState};
use tracing::debug;

/// Newest messages kept per channel timeline.
pub const MAX_CHANNEL_MESSAGES: usize = 800;
/// Newest replies kept per thread.
pub const MAX_THREAD_REPLIES: usize = 300;

/// Bound the size of cached channel state before it is restored.
///
/// Per channel: the timeline keeps its newest [`MAX_CHANNEL_MESSAGES`],
/// every thread keeps its newest [`MAX_THREAD_REPLIES`] replies (both in
/// `threads` and for replies sitting in the timeline), and pinned messages
/// are limited to ones that survived.
pub fn crop_older_messages(channels: &mut [ChannelState]) {
    for channel in channels {
        let before = channel.messages.len();
        crop_channel(channel);
        if channel.messages.len() < before {
            debug!(
                "Cropped {} from {} to {} messages",
                channel.cid,
                before,
                channel.messages.len()
            );
        }
    }
}

fn crop_channel(channel: &mut ChannelState) {
    sort_oldest_first(&mut channel.messages);
    keep_newest(&mut channel.messages, MAX_CHANNEL_MESSAGES);
    crop_inline_replies(&mut channel.messages);

    for replies in channel.threads.values_mut() {
        sort_oldest_first(replies);
        keep_newest(replies, MAX_THREAD_REPLIES);
    }

    let survivors: BTreeSet<&str> = channel
        .messages
        .iter()
        .chain(channel.threads.values().flatten())
        .map(|m| m.id.as_str())
        .collect();
    let pinned: Vec<MessageState> = channel
        .pinned_messages
        .iter()
        .filter(|m| survivors.contains(m.id.as_str()))
        .cloned()
        .collect();
    channel.pinned_messages = pinned;
}

fn sort_oldest_first(messages: &mut [MessageState]) {
    messages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}

fn keep_newest(messages: &mut Vec<MessageState>, limit: usize) {
    if messages.len() > limit {
        messages.drain(..messages.len() - limit);
    }
}

/// Replies shown in the timeline count against their thread's limit too.
fn crop_inline_replies(messages: &mut Vec<MessageState>) {
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut keep = vec![true; messages.len()];
    for (i, message) in messages.iter().enumerate().rev() {
        if let Some(parent) = &message.parent_id {
            let count = seen.entry(parent.clone()).or_default();
            *count += 1;
            keep[i] = *count <= MAX_THREAD_REPLIES;
        }
    }
    let mut flags = keep.into_iter();
    messages.retain(|_| flags.next().unwrap_or(true));
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn message(id: String, at: i64, parent: Option<&str>) -> MessageState {
        let mut message = MessageState::new(id, "x", Utc.timestamp_millis_opt(at).unwrap());
        message.parent_id = parent.map(str::to_string);
        message
    }

    #[test]
    fn small_channels_are_untouched() {
        let mut channel = ChannelState::new("messaging", "small");
        channel.messages = (0..10).map(|i| message(format!("m{i}"), i, None)).collect();
        let original = channel.clone();

        crop_older_messages(std::slice::from_mut(&mut channel));
        assert_eq!(channel, original);
    }

    #[test]
    fn keeps_newest_messages_in_order() {
        let mut channel = ChannelState::new("messaging", "busy");
        // Reverse insertion order; cropping sorts first.
        channel.messages = (0..900).rev().map(|i| message(format!("m{i}"), i, None)).collect();

        crop_older_messages(std::slice::from_mut(&mut channel));

        assert_eq!(channel.messages.len(), MAX_CHANNEL_MESSAGES);
        assert_eq!(channel.messages.first().unwrap().id, "m100");
        assert_eq!(channel.messages.last().unwrap().id, "m899");
    }

    #[test]
    fn inline_replies_are_limited_per_thread() {
        let mut channel = ChannelState::new("messaging", "threads");
        let mut messages: Vec<MessageState> =
            (0..350).map(|i| message(format!("a{i}"), i, Some("pa"))).collect();
        messages.extend((0..10).map(|i| message(format!("b{i}"), 1_000 + i, Some("pb"))));
        channel.messages = messages;

        crop_older_messages(std::slice::from_mut(&mut channel));

        let a = channel.messages.iter().filter(|m| m.parent_id.as_deref() == Some("pa")).count();
        let b = channel.messages.iter().filter(|m| m.parent_id.as_deref() == Some("pb")).count();
        assert_eq!(a, MAX_THREAD_REPLIES);
        assert_eq!(b, 10);
        assert!(!channel.messages.iter().any(|m| m.id == "a0"));
    }

    #[test]
    fn pinned_messages_follow_survivors() {
        let mut channel = ChannelState::new("messaging", "pins");
        channel.messages = (0..801).map(|i| message(format!("m{i}"), i, None)).collect();
        channel.pinned_messages =
            vec![message("m0".into(), 0, None), message("m800".into(), 800, None)];

        crop_older_messages(std::slice::from_mut(&mut channel));

        let pinned: Vec<&str> = channel.pinned_messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(pinned, vec!["m800"]);
    }
}
