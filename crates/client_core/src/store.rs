use std::collections::{btree_map, BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use shared::{
    domain::{ChannelKey, MessageId, NotificationId, UserId},
    protocol::{ConversationSummaryPayload, NotificationPayload},
};
use tracing::{debug, trace, warn};

use crate::types::{ConversationPartition, ConversationSummary, Message, OrderKey, Turn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted,
    Duplicate,
}

#[derive(Debug, Default)]
struct ChannelHistory {
    ordered: BTreeMap<OrderKey, Message>,
    by_id: HashMap<MessageId, DateTime<Utc>>,
}

impl ChannelHistory {
    fn contains(&self, id: MessageId) -> bool {
        self.by_id.contains_key(&id)
    }

    fn insert_new(&mut self, message: Message) -> bool {
        if self.contains(message.id) {
            return false;
        }
        self.by_id.insert(message.id, message.timestamp);
        self.ordered.insert(message.order_key(), message);
        true
    }

    fn upsert(&mut self, message: Message) -> bool {
        match self.by_id.insert(message.id, message.timestamp) {
            Some(previous_ts) => {
                let previous = self.ordered.remove(&(previous_ts, message.id));
                if previous.as_ref() != Some(&message) {
                    debug!(message_id = message.id.0, "store: snapshot replaced differing copy");
                }
                self.ordered.insert(message.order_key(), message);
                false
            }
            None => {
                self.ordered.insert(message.order_key(), message);
                true
            }
        }
    }

    fn newest(&self) -> Option<&Message> {
        self.ordered.values().next_back()
    }
}

#[derive(Clone)]
pub struct Messages<'a> {
    inner: Option<btree_map::Values<'a, OrderKey, Message>>,
}

impl<'a> Iterator for Messages<'a> {
    type Item = &'a Message;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.as_mut()?.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match &self.inner {
            Some(inner) => inner.size_hint(),
            None => (0, Some(0)),
        }
    }
}

impl ExactSizeIterator for Messages<'_> {}

pub struct ConversationStore {
    viewer: UserId,
    histories: HashMap<ChannelKey, ChannelHistory>,
    summaries: HashMap<ChannelKey, ConversationSummary>,
    focused: HashSet<ChannelKey>,
    notifications: BTreeMap<NotificationId, NotificationPayload>,
}

impl ConversationStore {
    pub fn new(viewer: UserId) -> Self {
        Self {
            viewer,
            histories: HashMap::new(),
            summaries: HashMap::new(),
            focused: HashSet::new(),
            notifications: BTreeMap::new(),
        }
    }

    /// Merges a REST snapshot into `channel`'s history: union by id, with the
    /// snapshot copy winning on conflict. Returns how many ids were new.
    pub fn seed(&mut self, channel: ChannelKey, messages: impl IntoIterator<Item = Message>) -> usize {
        let history = self.histories.entry(channel).or_default();
        let mut added = 0;
        for message in messages {
            if message.channel != channel {
                warn!(
                    channel = %channel,
                    message_channel = %message.channel,
                    message_id = message.id.0,
                    "store: skipping snapshot message from another channel"
                );
                continue;
            }
            if history.upsert(message) {
                added += 1;
            }
        }
        self.refresh_summary(channel);
        added
    }

    pub fn append(&mut self, message: Message) -> AppendOutcome {
        let channel = message.channel;
        let from_peer = message.sender_id != self.viewer;
        let history = self.histories.entry(channel).or_default();
        if !history.insert_new(message) {
            trace!(channel = %channel, "store: duplicate event ignored");
            return AppendOutcome::Duplicate;
        }
        self.refresh_summary(channel);
        if from_peer && !self.focused.contains(&channel) {
            if let Some(summary) = self.summaries.get_mut(&channel) {
                summary.unread_count = summary.unread_count.saturating_add(1);
            }
        }
        AppendOutcome::Inserted
    }

    pub fn list_messages(&self, channel: &ChannelKey) -> Messages<'_> {
        Messages {
            inner: self.histories.get(channel).map(|h| h.ordered.values()),
        }
    }

    pub fn list_conversations(&self) -> Vec<ConversationSummary> {
        let mut summaries: Vec<_> = self.summaries.values().cloned().collect();
        summaries.sort_by(|a, b| b.last_message.order_key().cmp(&a.last_message.order_key()));
        summaries
    }

    pub fn partition_conversations(&self) -> ConversationPartition {
        let mut partition = ConversationPartition::default();
        for summary in self.list_conversations() {
            match summary.turn(self.viewer) {
                Turn::Yours => partition.your_turn.push(summary),
                Turn::Theirs => partition.their_turn.push(summary),
            }
        }
        partition
    }

    /// Merges the conversation list snapshot. Display metadata and unread
    /// counts come from the snapshot; `last_message` is whichever of the
    /// snapshot's and the held history's newest message is newer.
    pub fn seed_conversations(&mut self, snapshot: impl IntoIterator<Item = ConversationSummaryPayload>) {
        for payload in snapshot {
            let channel = payload.channel;
            let mut last_message = Message::in_channel(channel, &payload.last_message);
            if let Some(newest) = self.histories.get(&channel).and_then(ChannelHistory::newest) {
                if newest.order_key() > last_message.order_key() {
                    last_message = newest.clone();
                }
            }
            let unread_count = if self.focused.contains(&channel) {
                0
            } else {
                payload.unread_count
            };
            self.summaries.insert(
                channel,
                ConversationSummary {
                    channel,
                    display_name: payload.display_name,
                    avatar_url: payload.avatar_url,
                    last_message,
                    unread_count,
                },
            );
        }
    }

    fn refresh_summary(&mut self, channel: ChannelKey) {
        let Some(newest) = self.histories.get(&channel).and_then(ChannelHistory::newest) else {
            return;
        };
        match self.summaries.get_mut(&channel) {
            Some(summary) => {
                if newest.order_key() >= summary.last_message.order_key() {
                    summary.last_message = newest.clone();
                }
            }
            None => {
                self.summaries.insert(
                    channel,
                    ConversationSummary {
                        channel,
                        display_name: channel.to_string(),
                        avatar_url: None,
                        last_message: newest.clone(),
                        unread_count: 0,
                    },
                );
            }
        }
    }

    pub fn summary(&self, channel: &ChannelKey) -> Option<&ConversationSummary> {
        self.summaries.get(channel)
    }

    pub fn set_focus(&mut self, channel: ChannelKey, focused: bool) {
        if focused {
            self.focused.insert(channel);
        } else {
            self.focused.remove(&channel);
        }
    }

    pub fn mark_read(&mut self, channel: &ChannelKey) -> bool {
        match self.summaries.get_mut(channel) {
            Some(summary) if summary.unread_count > 0 => {
                summary.unread_count = 0;
                true
            }
            _ => false,
        }
    }

    pub fn upsert_notifications(
        &mut self,
        notifications: impl IntoIterator<Item = NotificationPayload>,
    ) -> bool {
        let mut changed = false;
        for notification in notifications {
            let id = notification.notification_id;
            if self.notifications.get(&id) != Some(&notification) {
                self.notifications.insert(id, notification);
                changed = true;
            }
        }
        changed
    }

    pub fn notifications(&self) -> Vec<NotificationPayload> {
        let mut notifications: Vec<_> = self.notifications.values().cloned().collect();
        notifications.sort_by(|a, b| {
            (b.created_at, b.notification_id).cmp(&(a.created_at, a.notification_id))
        });
        notifications
    }

    pub fn unread_notification_count(&self) -> usize {
        self.notifications.values().filter(|n| !n.is_read).count()
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
