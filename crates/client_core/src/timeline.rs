use std::collections::HashSet;

use shared::{domain::MessageId, protocol::Message};

/// Materialized, ordered view of one conversation's messages.
///
/// Items are kept sorted by `created_at`; messages with equal timestamps keep
/// the order in which they were merged. No message id appears twice.
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    items: Vec<Message>,
    ids: HashSet<MessageId>,
    hydrated: bool,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current items in display order.
    pub fn items(&self) -> &[Message] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    pub fn last(&self) -> Option<&Message> {
        self.items.last()
    }

    /// Whether the local cache has been loaded into this timeline.
    pub fn is_hydrated(&self) -> bool {
        self.hydrated
    }

    pub fn mark_hydrated(&mut self) {
        self.hydrated = true;
    }

    /// Merges `batch` and returns the messages that were not present before,
    /// in the order they were inserted.
    pub fn merge<I>(&mut self, batch: I) -> Vec<Message>
    where
        I: IntoIterator<Item = Message>,
    {
        let mut inserted = Vec::new();
        for message in batch {
            if self.ids.contains(&message.id) {
                continue;
            }
            let idx = self
                .items
                .partition_point(|existing| existing.created_at <= message.created_at);
            self.ids.insert(message.id.clone());
            self.items.insert(idx, message.clone());
            inserted.push(message);
        }
        inserted
    }

    /// Drops every item. The timeline counts as hydrated afterwards since the
    /// cache it mirrors is empty too.
    pub fn clear(&mut self) {
        self.items.clear();
        self.ids.clear();
        self.hydrated = true;
    }
}
