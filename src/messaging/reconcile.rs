//! Merging history, optimistic sends and live traffic into one message list
//!
//! Local sends are appended immediately. When the server echoes one back it
//! is matched to the pending local entry instead of being appended again.
//! A live message matches when it comes from the local user, carries the
//! same content, and its timestamp is within the echo window of the local
//! one. A missing timestamp on either side is treated as a match.
//!
//! A live message identical to one already in the list (same sender, text
//! and server timestamp) is a redelivery and is dropped.
//!
//! The list is kept in arrival order. Messages that arrive out of order are
//! not re-sorted by timestamp.

use std::time::Duration;

use crate::models::{parse_timestamp, ChatMessage, GroupMessage, UserId};

pub const DEFAULT_ECHO_WINDOW: Duration = Duration::from_secs(30);

/// Fields needed to correlate a live message with a local send.
pub trait Correlate: Clone + PartialEq {
    fn sender(&self) -> UserId;
    fn content(&self) -> &str;
    fn timestamp(&self) -> Option<&str>;
    fn set_timestamp(&mut self, timestamp: Option<String>);
}

impl Correlate for ChatMessage {
    fn sender(&self) -> UserId {
        self.sender_id
    }
    fn content(&self) -> &str {
        &self.content
    }
    fn timestamp(&self) -> Option<&str> {
        self.timestamp.as_deref()
    }
    fn set_timestamp(&mut self, timestamp: Option<String>) {
        self.timestamp = timestamp;
    }
}

impl Correlate for GroupMessage {
    fn sender(&self) -> UserId {
        self.sender_id
    }
    fn content(&self) -> &str {
        &self.content
    }
    fn timestamp(&self) -> Option<&str> {
        self.timestamp.as_deref()
    }
    fn set_timestamp(&mut self, timestamp: Option<String>) {
        self.timestamp = timestamp;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    History,
    /// Sent from here. `confirmed` once the server echo has been seen.
    Local { confirmed: bool },
    Live,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entry<M> {
    pub message: M,
    pub origin: Origin,
}

/// What `apply_live` did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveOutcome {
    /// New entry at this index.
    Appended(usize),
    /// Matched the pending local send at this index.
    EchoConfirmed(usize),
    /// Already present, either from history or as an earlier delivery.
    Ignored,
}

/// One conversation's message list.
pub struct Conversation<M> {
    local_user: UserId,
    echo_window: Duration,
    entries: Vec<Entry<M>>,
    seeded: bool,
}

impl<M: Correlate> Conversation<M> {
    pub fn new(local_user: UserId, echo_window: Duration) -> Self {
        Self {
            local_user,
            echo_window,
            entries: Vec::new(),
            seeded: false,
        }
    }

    /// Record a message sent from here. Returns its index.
    pub fn push_local(&mut self, message: M) -> usize {
        self.entries.push(Entry {
            message,
            origin: Origin::Local { confirmed: false },
        });
        self.entries.len() - 1
    }

    pub fn apply_live(&mut self, message: M) -> LiveOutcome {
        if self.is_redelivery(&message) {
            return LiveOutcome::Ignored;
        }

        if message.sender() == self.local_user {
            if let Some(idx) = self.find_pending_echo(&message) {
                let entry = &mut self.entries[idx];
                if message.timestamp().is_some() {
                    entry.message.set_timestamp(message.timestamp().map(str::to_string));
                }
                entry.origin = Origin::Local { confirmed: true };
                return LiveOutcome::EchoConfirmed(idx);
            }
        }

        if self
            .entries
            .iter()
            .any(|e| e.origin == Origin::History && e.message == message)
        {
            return LiveOutcome::Ignored;
        }

        self.entries.push(Entry {
            message,
            origin: Origin::Live,
        });
        LiveOutcome::Appended(self.entries.len() - 1)
    }

    /// Install fetched history ahead of anything received so far.
    ///
    /// Live entries that also appear in the history are dropped. Only the
    /// first call has any effect. Returns false if history was already seeded.
    pub fn seed_history(&mut self, history: Vec<M>) -> bool {
        if self.seeded {
            tracing::debug!("History already seeded, ignoring {} messages", history.len());
            return false;
        }
        self.seeded = true;

        let buffered = std::mem::take(&mut self.entries);
        let mut entries: Vec<Entry<M>> = history
            .into_iter()
            .map(|message| Entry {
                message,
                origin: Origin::History,
            })
            .collect();
        let history_len = entries.len();

        for entry in buffered {
            let seen = entry.origin == Origin::Live
                && entries[..history_len].iter().any(|h| h.message == entry.message);
            if !seen {
                entries.push(entry);
            }
        }

        self.entries = entries;
        true
    }

    pub fn is_seeded(&self) -> bool {
        self.seeded
    }

    pub fn entries(&self) -> &[Entry<M>] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Local sends whose echo has not been seen yet.
    pub fn pending_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.origin == Origin::Local { confirmed: false })
            .count()
    }

    /// A second delivery of a live message or of an already confirmed echo.
    ///
    /// Needs a server timestamp, since two untimestamped messages with the
    /// same text can be two real sends.
    fn is_redelivery(&self, live: &M) -> bool {
        live.timestamp().is_some()
            && self.entries.iter().any(|e| {
                matches!(e.origin, Origin::Live | Origin::Local { confirmed: true })
                    && e.message == *live
            })
    }

    fn find_pending_echo(&self, live: &M) -> Option<usize> {
        self.entries.iter().position(|e| {
            e.origin == Origin::Local { confirmed: false }
                && e.message.content() == live.content()
                && self.within_window(e.message.timestamp(), live.timestamp())
        })
    }

    fn within_window(&self, local: Option<&str>, live: Option<&str>) -> bool {
        let (Some(local), Some(live)) = (local, live) else {
            return true;
        };
        let (Some(a), Some(b)) = (parse_timestamp(local), parse_timestamp(live)) else {
            return true;
        };
        let gap = if a > b { a - b } else { b - a };
        gap.to_std().map(|d| d <= self.echo_window).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat(sender: UserId, receiver: UserId, content: &str, ts: Option<&str>) -> ChatMessage {
        ChatMessage {
            sender_id: sender,
            receiver_id: receiver,
            content: content.to_string(),
            timestamp: ts.map(str::to_string),
        }
    }

    fn group(sender: UserId, content: &str, ts: &str) -> GroupMessage {
        GroupMessage {
            group_id: 7,
            sender_id: sender,
            content: content.to_string(),
            timestamp: Some(ts.to_string()),
        }
    }

    fn contents<M: Correlate>(c: &Conversation<M>) -> Vec<String> {
        c.entries().iter().map(|e| e.message.content().to_string()).collect()
    }

    #[test]
    fn test_self_echo_appears_once() {
        let mut c = Conversation::new(1, DEFAULT_ECHO_WINDOW);
        c.seed_history(Vec::new());

        let idx = c.push_local(chat(1, 2, "hi", Some("2024-05-01T10:00:00.000Z")));
        assert_eq!(c.len(), 1);
        assert_eq!(c.pending_count(), 1);

        let outcome = c.apply_live(chat(1, 2, "hi", Some("2024-05-01T10:00:00.412")));
        assert_eq!(outcome, LiveOutcome::EchoConfirmed(idx));
        assert_eq!(c.len(), 1);
        assert_eq!(c.pending_count(), 0);
        assert_eq!(
            c.entries()[0].message.timestamp.as_deref(),
            Some("2024-05-01T10:00:00.412")
        );
    }

    #[test]
    fn test_echo_without_timestamp_correlates() {
        let mut c = Conversation::new(1, DEFAULT_ECHO_WINDOW);
        c.push_local(chat(1, 2, "hi", Some("2024-05-01T10:00:00.000Z")));
        assert!(matches!(c.apply_live(chat(1, 2, "hi", None)), LiveOutcome::EchoConfirmed(0)));
        // Kept the local timestamp.
        assert!(c.entries()[0].message.timestamp.is_some());
    }

    #[test]
    fn test_same_text_outside_window_is_new_message() {
        let mut c = Conversation::new(1, Duration::from_secs(30));
        c.push_local(chat(1, 2, "ok", Some("2024-05-01T10:00:00Z")));
        let outcome = c.apply_live(chat(1, 2, "ok", Some("2024-05-01T10:05:00Z")));
        assert_eq!(outcome, LiveOutcome::Appended(1));
        assert_eq!(c.pending_count(), 1);
    }

    #[test]
    fn test_repeated_sends_each_confirm_one_echo() {
        let mut c = Conversation::new(1, DEFAULT_ECHO_WINDOW);
        c.push_local(chat(1, 2, "ha", None));
        c.push_local(chat(1, 2, "ha", None));

        assert_eq!(c.apply_live(chat(1, 2, "ha", None)), LiveOutcome::EchoConfirmed(0));
        assert_eq!(c.apply_live(chat(1, 2, "ha", None)), LiveOutcome::EchoConfirmed(1));
        assert_eq!(c.apply_live(chat(1, 2, "ha", None)), LiveOutcome::Appended(2));
    }

    #[test]
    fn test_peer_message_with_same_text_not_swallowed() {
        let mut c = Conversation::new(1, DEFAULT_ECHO_WINDOW);
        c.push_local(chat(1, 2, "hello", None));
        assert_eq!(c.apply_live(chat(2, 1, "hello", None)), LiveOutcome::Appended(1));
        assert_eq!(c.pending_count(), 1);
    }

    #[test]
    fn test_history_then_live_order() {
        let mut c = Conversation::new(1, DEFAULT_ECHO_WINDOW);
        let history = vec![
            group(2, "one", "2024-05-01T09:00:00"),
            group(3, "two", "2024-05-01T09:01:00"),
            group(2, "three", "2024-05-01T09:02:00"),
        ];
        assert!(c.seed_history(history));
        c.apply_live(group(3, "four", "2024-05-01T10:00:00"));

        assert_eq!(contents(&c), vec!["one", "two", "three", "four"]);
        assert_eq!(c.entries()[3].origin, Origin::Live);
    }

    #[test]
    fn test_live_before_history_merges_without_duplicates() {
        let mut c = Conversation::new(1, DEFAULT_ECHO_WINDOW);
        // Arrives while history is still in flight and is also in the response.
        c.apply_live(group(2, "three", "2024-05-01T09:02:00"));
        c.apply_live(group(3, "four", "2024-05-01T10:00:00"));

        c.seed_history(vec![
            group(2, "one", "2024-05-01T09:00:00"),
            group(2, "three", "2024-05-01T09:02:00"),
        ]);

        assert_eq!(contents(&c), vec!["one", "three", "four"]);
        // Same frame delivered again after seeding.
        assert_eq!(
            c.apply_live(group(2, "three", "2024-05-01T09:02:00")),
            LiveOutcome::Ignored
        );
    }

    #[test]
    fn test_local_send_before_history_is_kept_after_it() {
        let mut c = Conversation::new(1, DEFAULT_ECHO_WINDOW);
        c.push_local(group(1, "early", "2024-05-01T10:00:00"));
        c.seed_history(vec![group(2, "old", "2024-05-01T09:00:00")]);

        assert_eq!(contents(&c), vec!["old", "early"]);
        assert_eq!(c.pending_count(), 1);
        assert_eq!(
            c.apply_live(group(1, "early", "2024-05-01T10:00:01")),
            LiveOutcome::EchoConfirmed(1)
        );
    }

    #[test]
    fn test_seed_only_once() {
        let mut c: Conversation<GroupMessage> = Conversation::new(1, DEFAULT_ECHO_WINDOW);
        assert!(c.seed_history(vec![group(2, "a", "2024-05-01T09:00:00")]));
        assert!(!c.seed_history(vec![group(2, "b", "2024-05-01T09:00:00")]));
        assert_eq!(contents(&c), vec!["a"]);
        assert!(c.is_seeded());
    }

    #[test]
    fn test_echo_delivered_twice_appears_once() {
        let mut c = Conversation::new(1, DEFAULT_ECHO_WINDOW);
        c.seed_history(Vec::new());
        c.push_local(chat(1, 2, "hi", Some("2024-05-01T10:00:00.000Z")));

        let echo = chat(1, 2, "hi", Some("2024-05-01T10:00:00.300"));
        assert_eq!(c.apply_live(echo.clone()), LiveOutcome::EchoConfirmed(0));
        assert_eq!(c.apply_live(echo), LiveOutcome::Ignored);
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn test_redelivered_peer_message_appears_once() {
        let mut c = Conversation::new(1, DEFAULT_ECHO_WINDOW);
        c.seed_history(Vec::new());

        let msg = chat(2, 1, "yo", Some("2024-05-01T10:00:00"));
        assert_eq!(c.apply_live(msg.clone()), LiveOutcome::Appended(0));
        assert_eq!(c.apply_live(msg), LiveOutcome::Ignored);
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn test_redelivery_before_history_dropped() {
        let mut c = Conversation::new(1, DEFAULT_ECHO_WINDOW);
        let msg = group(2, "again", "2024-05-01T10:00:00");
        c.apply_live(msg.clone());
        assert_eq!(c.apply_live(msg), LiveOutcome::Ignored);

        c.seed_history(Vec::new());
        assert_eq!(contents(&c), vec!["again"]);
    }

    #[test]
    fn test_second_send_confirms_despite_earlier_echo() {
        let mut c = Conversation::new(1, DEFAULT_ECHO_WINDOW);
        c.push_local(chat(1, 2, "ha", None));
        c.push_local(chat(1, 2, "ha", None));

        let first = chat(1, 2, "ha", Some("2024-05-01T10:00:00.100"));
        assert_eq!(c.apply_live(first.clone()), LiveOutcome::EchoConfirmed(0));
        assert_eq!(c.apply_live(first), LiveOutcome::Ignored);
        assert_eq!(
            c.apply_live(chat(1, 2, "ha", Some("2024-05-01T10:00:00.900"))),
            LiveOutcome::EchoConfirmed(1)
        );
        assert_eq!(c.pending_count(), 0);
    }

    #[test]
    fn test_out_of_order_arrival_is_not_resorted() {
        let mut c = Conversation::new(1, DEFAULT_ECHO_WINDOW);
        c.seed_history(Vec::new());
        c.apply_live(group(2, "later", "2024-05-01T10:00:05"));
        c.apply_live(group(3, "earlier", "2024-05-01T10:00:01"));
        assert_eq!(contents(&c), vec!["later", "earlier"]);
    }
}
