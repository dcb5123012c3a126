//! Ordered log of content messages replayed to newly attached clients.

use chrono::{DateTime, Utc};
use shared::{
    domain::{MessageId, MessageStatus},
    protocol::ContentMessage,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Updated,
}

/// Holds at most one entry per message id. Updates happen in place so an
/// entry keeps its position in append order for its whole life.
#[derive(Debug, Default)]
pub struct MessageHistory {
    entries: Vec<ContentMessage>,
}

impl MessageHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &MessageId) -> Option<&ContentMessage> {
        self.entries.iter().find(|entry| &entry.id == id)
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.get(id).is_some()
    }

    pub fn upsert(&mut self, message: ContentMessage) -> Upsert {
        match self.position(&message.id) {
            Some(index) => {
                self.entries[index] = message;
                Upsert::Updated
            }
            None => {
                self.entries.push(message);
                Upsert::Inserted
            }
        }
    }

    /// Re-keys the most recent entry carrying `local_id` to `canonical_id` and
    /// marks it delivered. Matching scans from the tail, so if a local id was
    /// ever reused the newest message wins.
    pub fn acknowledge(
        &mut self,
        local_id: &MessageId,
        canonical_id: &MessageId,
        timestamp: DateTime<Utc>,
    ) -> Option<&ContentMessage> {
        let index = self
            .entries
            .iter()
            .rposition(|entry| &entry.id == local_id)?;

        // The backend may already have pushed the canonical copy.
        let duplicate = self
            .entries
            .iter()
            .enumerate()
            .position(|(other, entry)| other != index && &entry.id == canonical_id);
        let index = match duplicate {
            Some(other) => {
                self.entries.remove(other);
                if other < index {
                    index - 1
                } else {
                    index
                }
            }
            None => index,
        };

        let entry = &mut self.entries[index];
        entry.id = canonical_id.clone();
        entry.timestamp = timestamp;
        entry.status = MessageStatus::Delivered;
        Some(&*entry)
    }

    pub fn set_status(&mut self, id: &MessageId, status: MessageStatus) -> Option<&ContentMessage> {
        let index = self.position(id)?;
        let entry = &mut self.entries[index];
        entry.status = status;
        Some(&*entry)
    }

    pub fn remove(&mut self, id: &MessageId) -> Option<ContentMessage> {
        let index = self.position(id)?;
        Some(self.entries.remove(index))
    }

    pub fn snapshot(&self) -> Vec<ContentMessage> {
        self.entries.clone()
    }

    /// Entries appended after `last_known_id`. The full log is returned when
    /// the client knows nothing or knows an id this history never saw.
    pub fn since(&self, last_known_id: Option<&MessageId>) -> Vec<ContentMessage> {
        let start = last_known_id
            .and_then(|id| self.position(id))
            .map(|index| index + 1)
            .unwrap_or(0);
        self.entries[start..].to_vec()
    }

    /// Merges restored messages, given in store order, into the log. Known ids
    /// keep their entry. An unknown message lands right before the next
    /// restored message the log already holds, or at the end when none
    /// follows. Returns how many were added.
    pub fn merge_restored(&mut self, restored: Vec<ContentMessage>) -> usize {
        let mut added = 0;
        let mut anchor: Option<usize> = None;
        for message in restored.into_iter().rev() {
            if let Some(index) = self.position(&message.id) {
                anchor = Some(index);
                continue;
            }
            let index = match anchor {
                Some(index) => {
                    self.entries.insert(index, message);
                    index
                }
                None => {
                    self.entries.push(message);
                    self.entries.len() - 1
                }
            };
            anchor = Some(index);
            added += 1;
        }
        added
    }

    fn position(&self, id: &MessageId) -> Option<usize> {
        self.entries.iter().position(|entry| &entry.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(id: &str, body: &str) -> ContentMessage {
        ContentMessage::plaintext(MessageId::from(id), body)
    }

    fn ids(messages: &[ContentMessage]) -> Vec<&str> {
        messages.iter().map(|message| message.id.as_str()).collect()
    }

    #[test]
    fn upsert_edits_in_place() {
        let mut history = MessageHistory::new();
        history.upsert(text("a", "one"));
        history.upsert(text("b", "two"));

        let mut edited = text("a", "uno");
        edited.edited = true;
        assert_eq!(history.upsert(edited), Upsert::Updated);

        let snapshot = history.snapshot();
        assert_eq!(ids(&snapshot), vec!["a", "b"]);
        assert!(snapshot[0].edited);
    }

    #[test]
    fn acknowledge_rekeys_and_marks_delivered() {
        let mut history = MessageHistory::new();
        history.upsert(text("m1", "hi"));
        let acked_at: DateTime<Utc> = "2024-01-01T00:00:05Z".parse().expect("timestamp");

        let updated = history
            .acknowledge(&MessageId::from("m1"), &MessageId::from("m101"), acked_at)
            .expect("match")
            .clone();

        assert_eq!(updated.id.as_str(), "m101");
        assert_eq!(updated.status, MessageStatus::Delivered);
        assert_eq!(updated.timestamp, acked_at);
        assert!(!history.contains(&MessageId::from("m1")));
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn acknowledge_prefers_the_newest_duplicate_local_id() {
        let mut history = MessageHistory {
            entries: vec![text("dup", "old"), text("x", "mid"), text("dup", "new")],
        };

        history
            .acknowledge(&MessageId::from("dup"), &MessageId::from("c1"), Utc::now())
            .expect("match");

        let snapshot = history.snapshot();
        assert_eq!(ids(&snapshot), vec!["dup", "x", "c1"]);
        assert_eq!(
            snapshot[2].payload,
            shared::protocol::MessagePayload::Plaintext {
                text: "new".to_string()
            }
        );
    }

    #[test]
    fn acknowledge_collapses_an_existing_canonical_copy() {
        let mut history = MessageHistory::new();
        history.upsert(text("c1", "echo from backend"));
        history.upsert(text("m1", "hi"));

        history
            .acknowledge(&MessageId::from("m1"), &MessageId::from("c1"), Utc::now())
            .expect("match");

        let snapshot = history.snapshot();
        assert_eq!(ids(&snapshot), vec!["c1"]);
        assert_eq!(snapshot[0].status, MessageStatus::Delivered);
    }

    #[test]
    fn acknowledge_without_match_changes_nothing() {
        let mut history = MessageHistory::new();
        history.upsert(text("m1", "hi"));
        assert!(history
            .acknowledge(&MessageId::from("nope"), &MessageId::from("c1"), Utc::now())
            .is_none());
        assert_eq!(ids(&history.snapshot()), vec!["m1"]);
    }

    #[test]
    fn since_returns_tail_or_everything() {
        let mut history = MessageHistory::new();
        for id in ["a", "b", "c"] {
            history.upsert(text(id, id));
        }

        assert_eq!(ids(&history.since(None)), vec!["a", "b", "c"]);
        assert_eq!(ids(&history.since(Some(&MessageId::from("a")))), vec!["b", "c"]);
        assert!(history.since(Some(&MessageId::from("c"))).is_empty());
        assert_eq!(
            ids(&history.since(Some(&MessageId::from("unknown")))),
            vec!["a", "b", "c"]
        );
    }

    #[test]
    fn merge_restored_skips_known_ids() {
        let mut history = MessageHistory::new();
        history.upsert(text("b", "live"));

        let added = history.merge_restored(vec![text("a", "old"), text("b", "stale")]);

        assert_eq!(added, 1);
        let snapshot = history.snapshot();
        assert_eq!(ids(&snapshot), vec!["a", "b"]);
        assert_eq!(
            snapshot[0].payload,
            shared::protocol::MessagePayload::Plaintext {
                text: "live".to_string()
            }
        );
    }

    #[test]
    fn merge_restored_places_older_messages_before_known_ones() {
        let mut history = MessageHistory::new();
        history.merge_restored(vec![text("s3", "c"), text("s4", "d")]);
        history.upsert(text("live", "e"));

        let added = history.merge_restored(vec![
            text("s1", "a"),
            text("s2", "b"),
            text("s3", "c"),
            text("s4", "d"),
        ]);

        assert_eq!(added, 2);
        assert_eq!(
            ids(&history.snapshot()),
            vec!["s1", "s2", "s3", "s4", "live"]
        );
        assert_eq!(ids(&history.since(Some(&MessageId::from("s4")))), vec!["live"]);
    }

    #[test]
    fn merge_restored_appends_when_nothing_known_follows() {
        let mut history = MessageHistory::new();
        history.upsert(text("a", "x"));

        history.merge_restored(vec![text("a", "x"), text("b", "y"), text("c", "z")]);

        assert_eq!(ids(&history.snapshot()), vec!["a", "b", "c"]);
    }

    #[test]
    fn remove_deletes_single_entry() {
        let mut history = MessageHistory::new();
        history.upsert(text("a", "x"));
        history.upsert(text("b", "y"));

        assert!(history.remove(&MessageId::from("a")).is_some());
        assert!(history.remove(&MessageId::from("a")).is_none());
        assert_eq!(ids(&history.snapshot()), vec!["b"]);
    }
}
