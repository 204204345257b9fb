//! Conversation store
//!
//! The canonical in-memory ordered log of messages. Only the assembler and
//! the manual-message path append or mutate entries; the synchronizer reads
//! unsaved entries and flips the saved flag.

use crate::message::{Channel, Message, MessageId};
use chrono::Utc;
use std::collections::HashSet;
use tracing::warn;

/// Store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Message not found: {0}")]
    NotFound(MessageId),
}

/// Filters for reading the conversation log.
///
/// Defaults exclude partial and hidden messages, which is the "clean
/// transcript" view consumed by the AI-request composer.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryFilter {
    pub include_partial: bool,
    pub include_hidden: bool,
}

/// Summary counters over the conversation log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversationStats {
    pub total: usize,
    pub saved: usize,
    pub unsaved: usize,
    pub partial: usize,
    pub local_messages: usize,
    pub remote_messages: usize,
    pub has_unsaved: bool,
}

/// Insertion-ordered conversation log
#[derive(Debug, Default)]
pub struct ConversationStore {
    messages: Vec<Message>,
    /// Mutations that targeted a missing id; should stay zero in normal operation
    not_found_count: u64,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message to the end of the log
    pub fn append(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Mutate a message in place by id.
    ///
    /// A missing id is reported to the caller and counted; the mutation is
    /// dropped, never applied to some other message.
    pub fn update_in_place<F>(&mut self, id: &MessageId, mutator: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Message),
    {
        match self.messages.iter_mut().find(|m| &m.id == id) {
            Some(message) => {
                mutator(message);
                message.last_updated_at = Utc::now();
                Ok(())
            }
            None => {
                self.not_found_count += 1;
                warn!("Dropped mutation for unknown message id {}", id);
                Err(StoreError::NotFound(id.clone()))
            }
        }
    }

    /// Flip the saved flag for every id in the set.
    ///
    /// Ids not present in the log are ignored here: the persistence endpoint
    /// may acknowledge messages from an earlier session snapshot.
    pub fn mark_saved(&mut self, ids: &HashSet<MessageId>) -> usize {
        let mut marked = 0;
        for message in self.messages.iter_mut() {
            if ids.contains(&message.id) && !message.is_saved {
                message.is_saved = true;
                marked += 1;
            }
        }
        marked
    }

    /// Read the log through the given filters
    pub fn query(&self, filter: QueryFilter) -> Vec<Message> {
        self.messages
            .iter()
            .filter(|m| filter.include_partial || !m.is_partial)
            .filter(|m| filter.include_hidden || !m.is_hidden)
            .cloned()
            .collect()
    }

    /// Snapshot of messages pending persistence.
    ///
    /// Partial messages are excluded: an open segment is still mutating and
    /// must not be upserted until it is finalized.
    pub fn unsaved(&self) -> Vec<Message> {
        self.messages
            .iter()
            .filter(|m| !m.is_saved && !m.is_partial)
            .cloned()
            .collect()
    }

    /// Look up a message by id
    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| &m.id == id)
    }

    /// Toggle user-controlled visibility for a message
    pub fn set_hidden(&mut self, id: &MessageId, hidden: bool) -> Result<(), StoreError> {
        self.update_in_place(id, |m| m.is_hidden = hidden)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Number of mutations dropped because the target id was missing
    pub fn not_found_count(&self) -> u64 {
        self.not_found_count
    }

    /// Summary counters for display and diagnostics
    pub fn stats(&self) -> ConversationStats {
        let total = self.messages.len();
        let saved = self.messages.iter().filter(|m| m.is_saved).count();
        let partial = self.messages.iter().filter(|m| m.is_partial).count();
        let local_messages = self
            .messages
            .iter()
            .filter(|m| m.channel == Channel::Local)
            .count();
        ConversationStats {
            total,
            saved,
            unsaved: total - saved,
            partial,
            local_messages,
            remote_messages: total - local_messages,
            has_unsaved: saved < total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Channel, Message};

    fn sample(channel: Channel, text: &str, partial: bool) -> Message {
        Message::new(channel, text, partial)
    }

    #[test]
    fn test_query_defaults_exclude_partial_and_hidden() {
        let mut store = ConversationStore::new();
        store.append(sample(Channel::Local, "visible", false));
        store.append(sample(Channel::Local, "still open", true));
        let mut hidden = sample(Channel::Remote, "hidden", false);
        hidden.is_hidden = true;
        store.append(hidden);

        let clean = store.query(QueryFilter::default());
        assert_eq!(clean.len(), 1);
        assert_eq!(clean[0].text, "visible");

        let all = store.query(QueryFilter {
            include_partial: true,
            include_hidden: true,
        });
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_update_in_place_missing_id_is_reported_and_counted() {
        let mut store = ConversationStore::new();
        store.append(sample(Channel::Local, "only", false));

        let ghost = MessageId("mic_0_missing".to_string());
        let result = store.update_in_place(&ghost, |m| m.text.push('x'));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
        assert_eq!(store.not_found_count(), 1);
        // The existing message was not touched
        assert_eq!(store.query(QueryFilter::default())[0].text, "only");
    }

    #[test]
    fn test_mark_saved_flips_exactly_given_ids() {
        let mut store = ConversationStore::new();
        let a = sample(Channel::Local, "a", false);
        let b = sample(Channel::Local, "b", false);
        let a_id = a.id.clone();
        store.append(a);
        store.append(b);

        let mut ids = HashSet::new();
        ids.insert(a_id.clone());
        ids.insert(MessageId("mic_0_unknown".to_string()));
        assert_eq!(store.mark_saved(&ids), 1);

        assert!(store.get(&a_id).unwrap().is_saved);
        assert_eq!(store.stats().unsaved, 1);
    }

    #[test]
    fn test_unsaved_excludes_partial_messages() {
        let mut store = ConversationStore::new();
        store.append(sample(Channel::Local, "done", false));
        store.append(sample(Channel::Remote, "open", true));

        let batch = store.unsaved();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].text, "done");
    }

    #[test]
    fn test_set_hidden_independent_of_save_state() {
        let mut store = ConversationStore::new();
        let msg = sample(Channel::Local, "secret", false);
        let id = msg.id.clone();
        store.append(msg);

        store.set_hidden(&id, true).unwrap();
        let m = store.get(&id).unwrap();
        assert!(m.is_hidden);
        assert!(!m.is_saved);
        assert!(store.query(QueryFilter::default()).is_empty());
    }

    #[test]
    fn test_stats_counts_channels() {
        let mut store = ConversationStore::new();
        store.append(sample(Channel::Local, "a", false));
        store.append(sample(Channel::Local, "b", true));
        store.append(sample(Channel::Remote, "c", false));

        let stats = store.stats();
        assert_eq!(store.len(), 3);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.partial, 1);
        assert_eq!(stats.local_messages, 2);
        assert_eq!(stats.remote_messages, 1);
        assert!(stats.has_unsaved);
    }
}
