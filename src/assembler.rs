//! Segment assembler
//!
//! Converts the fragment stream from all active adapters into message
//! mutations on the conversation store, under the single-open-segment-per-
//! channel invariant: at most one partial message exists per channel, and a
//! fragment either extends it, finalizes it on length overflow, or starts a
//! fresh segment. Fragments are never split.

use crate::message::{Channel, Fragment, Message, MessageId};
use crate::store::ConversationStore;
use std::collections::HashMap;
use tracing::{debug, warn};

/// What the assembler did with a fragment, for event reporting
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssemblyOutcome {
    /// Whitespace-only fragment, dropped
    Ignored,
    /// A new segment was opened (or created already finalized)
    Started { id: MessageId, finalized: bool },
    /// The open segment was extended in place
    Extended { id: MessageId, finalized: bool },
    /// The open segment overflowed and was finalized; a new one holds the fragment
    Split {
        finalized_id: MessageId,
        new_id: MessageId,
        new_finalized: bool,
    },
}

/// Per-channel segmentation state machine
#[derive(Debug)]
pub struct SegmentAssembler {
    /// Open segment per channel; absent means the next fragment starts fresh
    open_segments: HashMap<Channel, MessageId>,
    max_message_length: usize,
}

impl SegmentAssembler {
    pub fn new(max_message_length: usize) -> Self {
        Self {
            open_segments: HashMap::new(),
            max_message_length,
        }
    }

    /// Apply one fragment to the store.
    ///
    /// Must run to completion before the next fragment for the same channel
    /// is handed in; the engine's event loop serializes calls.
    pub fn handle_fragment(
        &mut self,
        store: &mut ConversationStore,
        fragment: &Fragment,
    ) -> AssemblyOutcome {
        if fragment.text.trim().is_empty() {
            return AssemblyOutcome::Ignored;
        }

        let channel = fragment.channel;
        let Some(open_id) = self.open_segments.get(&channel).cloned() else {
            let id = self.open_segment(store, fragment);
            return AssemblyOutcome::Started {
                id,
                finalized: fragment.is_final,
            };
        };

        // The open segment should always be present in the store; if the id
        // has gone stale, drop it and start over rather than stalling.
        let Some(open_text) = store.get(&open_id).map(|m| m.text.clone()) else {
            warn!(
                channel = %channel,
                "Open segment {} missing from store, starting a new segment",
                open_id
            );
            self.open_segments.remove(&channel);
            let id = self.open_segment(store, fragment);
            return AssemblyOutcome::Started {
                id,
                finalized: fragment.is_final,
            };
        };

        let candidate = format!("{} {}", open_text, fragment.text);
        if candidate.chars().count() > self.max_message_length {
            // Finalize the open segment as-is, then the fragment becomes the
            // entire content of a fresh segment. Never split mid-fragment.
            if store
                .update_in_place(&open_id, |m| m.is_partial = false)
                .is_err()
            {
                warn!("Failed to finalize overflowing segment {}", open_id);
            }
            self.open_segments.remove(&channel);
            debug!(channel = %channel, "Segment {} finalized at length bound", open_id);

            let new_id = self.open_segment(store, fragment);
            AssemblyOutcome::Split {
                finalized_id: open_id,
                new_id,
                new_finalized: fragment.is_final,
            }
        } else {
            let is_final = fragment.is_final;
            // A final transcript covers the segment's whole utterance window
            // and supersedes the interim text accumulated so far; interim
            // fragments extend the live text.
            let new_text = if is_final {
                fragment.text.clone()
            } else {
                candidate
            };
            if store
                .update_in_place(&open_id, |m| {
                    m.text = new_text;
                    m.is_partial = !is_final;
                })
                .is_err()
            {
                warn!("Failed to extend segment {}", open_id);
            }
            if is_final {
                self.open_segments.remove(&channel);
            }
            AssemblyOutcome::Extended {
                id: open_id,
                finalized: is_final,
            }
        }
    }

    /// End-of-utterance signal: force-finalize the open segment, if any.
    ///
    /// Distinct from a final fragment; no new message is created.
    pub fn speech_final(
        &mut self,
        store: &mut ConversationStore,
        channel: Channel,
    ) -> Option<MessageId> {
        let id = self.open_segments.remove(&channel)?;
        if store
            .update_in_place(&id, |m| m.is_partial = false)
            .is_err()
        {
            warn!(channel = %channel, "speech_final target {} missing from store", id);
            return None;
        }
        debug!(channel = %channel, "Segment {} finalized by end of speech", id);
        Some(id)
    }

    /// Finalize every open segment (manual flush / session teardown)
    pub fn flush_all(&mut self, store: &mut ConversationStore) -> Vec<MessageId> {
        let channels: Vec<Channel> = self.open_segments.keys().copied().collect();
        channels
            .into_iter()
            .filter_map(|c| self.speech_final(store, c))
            .collect()
    }

    /// The currently open segment for a channel, if any
    pub fn open_segment_id(&self, channel: Channel) -> Option<&MessageId> {
        self.open_segments.get(&channel)
    }

    fn open_segment(&mut self, store: &mut ConversationStore, fragment: &Fragment) -> MessageId {
        let message = Message::new(fragment.channel, fragment.text.clone(), !fragment.is_final);
        let id = message.id.clone();
        store.append(message);
        if !fragment.is_final {
            self.open_segments.insert(fragment.channel, id.clone());
        }
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Fragment;
    use crate::store::QueryFilter;

    fn setup() -> (SegmentAssembler, ConversationStore) {
        (SegmentAssembler::new(200), ConversationStore::new())
    }

    fn all(store: &ConversationStore) -> Vec<Message> {
        store.query(QueryFilter {
            include_partial: true,
            include_hidden: true,
        })
    }

    fn assert_single_open_per_channel(store: &ConversationStore) {
        for channel in [Channel::Local, Channel::Remote] {
            let partial = all(store)
                .iter()
                .filter(|m| m.channel == channel && m.is_partial)
                .count();
            assert!(partial <= 1, "{} has {} open segments", channel, partial);
        }
    }

    #[test]
    fn test_interim_then_final_yields_single_message() {
        // "hello" (interim) then "hello world" (final) collapse into one message
        let (mut assembler, mut store) = setup();
        assembler.handle_fragment(&mut store, &Fragment::new(Channel::Local, "hello", false));
        // The final result covers the whole utterance and supersedes the interim
        assembler.handle_fragment(
            &mut store,
            &Fragment::new(Channel::Local, "hello world", true),
        );

        let log = all(&store);
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].text, "hello world");
        assert!(!log[0].is_partial);
        assert!(assembler.open_segment_id(Channel::Local).is_none());
    }

    #[test]
    fn test_overflow_finalizes_old_segment_and_opens_new() {
        // Open segment at 195 chars, incoming 20-char fragment
        let (mut assembler, mut store) = setup();
        let long = "x".repeat(195);
        assembler.handle_fragment(&mut store, &Fragment::new(Channel::Local, &long, false));
        let incoming = "y".repeat(20);
        let outcome =
            assembler.handle_fragment(&mut store, &Fragment::new(Channel::Local, &incoming, false));

        assert!(matches!(outcome, AssemblyOutcome::Split { .. }));
        let log = all(&store);
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].text.len(), 195);
        assert!(!log[0].is_partial);
        assert_eq!(log[1].text, incoming);
        assert!(log[1].is_partial);
        assert_eq!(assembler.open_segment_id(Channel::Local), Some(&log[1].id));
        assert_single_open_per_channel(&store);
    }

    #[test]
    fn test_speech_final_finalizes_without_new_message() {
        let (mut assembler, mut store) = setup();
        assembler.handle_fragment(
            &mut store,
            &Fragment::new(Channel::Remote, "partial text", false),
        );
        let finalized = assembler.speech_final(&mut store, Channel::Remote);

        assert!(finalized.is_some());
        let log = all(&store);
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].text, "partial text");
        assert!(!log[0].is_partial);
        assert!(assembler.open_segment_id(Channel::Remote).is_none());
    }

    #[test]
    fn test_interim_fragments_extend_open_segment() {
        let (mut assembler, mut store) = setup();
        assembler.handle_fragment(&mut store, &Fragment::new(Channel::Local, "good", false));
        let outcome =
            assembler.handle_fragment(&mut store, &Fragment::new(Channel::Local, "morning", false));

        assert!(matches!(
            outcome,
            AssemblyOutcome::Extended {
                finalized: false,
                ..
            }
        ));
        let log = all(&store);
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].text, "good morning");
        assert!(log[0].is_partial);
    }

    #[test]
    fn test_speech_final_with_no_open_segment_is_noop() {
        let (mut assembler, mut store) = setup();
        assert!(assembler.speech_final(&mut store, Channel::Local).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_whitespace_fragment_ignored() {
        let (mut assembler, mut store) = setup();
        let outcome =
            assembler.handle_fragment(&mut store, &Fragment::new(Channel::Local, "   ", false));
        assert_eq!(outcome, AssemblyOutcome::Ignored);
        assert!(store.is_empty());
        assert!(assembler.open_segment_id(Channel::Local).is_none());
    }

    #[test]
    fn test_final_first_fragment_never_occupies_open_slot() {
        let (mut assembler, mut store) = setup();
        assembler.handle_fragment(&mut store, &Fragment::new(Channel::Local, "done", true));

        let log = all(&store);
        assert_eq!(log.len(), 1);
        assert!(!log[0].is_partial);
        assert!(assembler.open_segment_id(Channel::Local).is_none());
    }

    #[test]
    fn test_oversized_single_fragment_stays_whole() {
        // Length bound exception: a lone fragment larger than the limit is
        // kept intact, never split.
        let (mut assembler, mut store) = setup();
        let huge = "z".repeat(250);
        assembler.handle_fragment(&mut store, &Fragment::new(Channel::Local, &huge, true));

        let log = all(&store);
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].text.len(), 250);
        assert!(!log[0].is_partial);
    }

    #[test]
    fn test_channels_interleave_in_creation_order() {
        // Order preservation: segment creation order is log order
        let (mut assembler, mut store) = setup();
        assembler.handle_fragment(&mut store, &Fragment::new(Channel::Local, "first", false));
        assembler.handle_fragment(&mut store, &Fragment::new(Channel::Remote, "second", false));
        assembler.handle_fragment(&mut store, &Fragment::new(Channel::Local, "first more", true));
        assembler.handle_fragment(
            &mut store,
            &Fragment::new(Channel::Remote, "second words", true),
        );

        let log = all(&store);
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].channel, Channel::Local);
        assert_eq!(log[0].text, "first more");
        assert_eq!(log[1].channel, Channel::Remote);
        assert_eq!(log[1].text, "second words");
        assert_single_open_per_channel(&store);
    }

    #[test]
    fn test_invariant_holds_under_fragment_storm() {
        let (mut assembler, mut store) = setup();
        for i in 0..100 {
            let channel = if i % 3 == 0 {
                Channel::Remote
            } else {
                Channel::Local
            };
            let is_final = i % 7 == 0;
            let text = format!("word{}", i);
            assembler.handle_fragment(&mut store, &Fragment::new(channel, text, is_final));
            assert_single_open_per_channel(&store);
        }
        // No finalized message exceeds the bound (no fragment alone did)
        for m in all(&store) {
            if !m.is_partial {
                assert!(m.text.chars().count() <= 200 + "word100".len());
            }
        }
    }

    #[test]
    fn test_flush_all_closes_every_channel() {
        let (mut assembler, mut store) = setup();
        assembler.handle_fragment(&mut store, &Fragment::new(Channel::Local, "one", false));
        assembler.handle_fragment(&mut store, &Fragment::new(Channel::Remote, "two", false));

        let finalized = assembler.flush_all(&mut store);
        assert_eq!(finalized.len(), 2);
        assert!(all(&store).iter().all(|m| !m.is_partial));
    }
}
